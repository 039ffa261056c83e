use crate::device::Alignment;
use crate::error::Result;
use nix::ioctl_read;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

fn read_sys_u64(device_name: &str, file: &str) -> Option<u64> {
    read_sys_file(device_name, file).ok()?.parse().ok()
}

/// Returns `true` if `path` exists and is a block device.
pub fn is_block_device(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// Capacity of a block device in bytes, via the `BLKGETSIZE64` ioctl.
///
/// Returns `Ok(None)` for anything that is not a block device, such as a
/// regular image file, which has no fixed capacity.
pub fn device_size(path: &Path) -> Result<Option<u64>> {
    if !is_block_device(path) {
        return Ok(None);
    }

    let device_file = File::open(path)?;
    let mut size_bytes: u64 = 0;
    unsafe {
        blkgetsize64(device_file.as_raw_fd(), &mut size_bytes).map_err(io::Error::from)?;
    }
    Ok(Some(size_bytes))
}

/// Reads the optimal partition alignment the kernel reports for a disk.
///
/// Uses `queue/optimal_io_size` and `alignment_offset` under `/sys/block`.
/// When the device reports no optimal I/O size, or is not a block device at
/// all, boundaries fall on 1 MiB.
pub fn optimal_alignment(path: &Path, sector_size: u64) -> Alignment {
    let fallback = Alignment::default_for(sector_size);
    let Some(device_name) = fs::canonicalize(path)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
    else {
        return fallback;
    };

    let optimal_io = read_sys_u64(&device_name, "queue/optimal_io_size").unwrap_or(0);
    let offset = read_sys_u64(&device_name, "alignment_offset").unwrap_or(0);
    debug!(
        "{}: optimal_io_size={} alignment_offset={}",
        device_name, optimal_io, offset
    );

    if optimal_io == 0 || sector_size == 0 || optimal_io % sector_size != 0 {
        return Alignment {
            offset: offset / sector_size.max(1),
            ..fallback
        };
    }

    Alignment {
        grain: optimal_io / sector_size,
        offset: offset / sector_size,
    }
}

/// Finds where a partition node is mounted, if anywhere.
pub fn mount_point_of(node: &Path) -> Option<PathBuf> {
    let canonical = fs::canonicalize(node).unwrap_or_else(|_| node.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| {
            let name = Path::new(disk.name());
            name == node || name == canonical
        })
        .map(|disk| disk.mount_point().to_path_buf())
}

/// Asks the kernel to flush all pending writes to storage.
pub fn sync_filesystems() {
    nix::unistd::sync();
}
