//! Reads a device's partition table and geometry.
//!
//! The table comes from `sfdisk --json`, filesystem types from `blkid`, and
//! the optimal alignment from sysfs. The result is a [`Disk`] whose
//! partitions are sorted and checked for overlap before anything else
//! trusts them.

use crate::command::CommandRunner;
use crate::device::{Disk, Partition};
use crate::error::{ImageError, Result};
use crate::platform;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct SfdiskOutput {
    partitiontable: SfdiskPartitionTable,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartitionTable {
    // Older util-linux releases omit it; those only ever reported 512.
    sectorsize: Option<u64>,
    partitions: Option<Vec<SfdiskPartition>>,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartition {
    node: String,
    start: u64,
    size: u64,
    #[serde(rename = "type")]
    part_type: Option<String>,
}

/// MBR type codes of extended partitions. They only contain the logical
/// partitions and always overlap them.
const EXTENDED_TYPES: [&str; 3] = ["5", "f", "85"];

fn is_extended(part_type: Option<&str>) -> bool {
    part_type.is_some_and(|t| {
        let code = t.trim_start_matches("0x").to_ascii_lowercase();
        EXTENDED_TYPES.contains(&code.as_str())
    })
}

/// Reads the partition table of `device_path`.
///
/// # Errors
///
/// - [`ImageError::DeviceUnreadable`] if the device cannot be opened, `sfdisk`
///   cannot be run or fails, or the table it reports is malformed.
/// - [`ImageError::NoPartitionTable`] if there is no table or it is empty.
pub fn inspect(runner: &dyn CommandRunner, device_path: &Path) -> Result<Disk> {
    let unreadable = |reason: String| ImageError::DeviceUnreadable {
        path: device_path.to_path_buf(),
        reason,
    };

    // Fail early with the OS error rather than an sfdisk message.
    File::open(device_path).map_err(|e| unreadable(e.to_string()))?;

    let path_arg = device_path.to_string_lossy();
    let output = runner
        .run("sfdisk", &["--json", &path_arg], None)
        .map_err(|e| unreadable(format!("failed to run sfdisk: {e}")))?;

    if !output.success() {
        if output.stderr.contains("does not contain a recognized partition table") {
            return Err(ImageError::NoPartitionTable(device_path.to_path_buf()));
        }
        return Err(unreadable(format!("sfdisk failed: {}", output.combined())));
    }

    let mut disk = parse_table(device_path, &output.stdout)?;
    disk.alignment = platform::optimal_alignment(device_path, disk.sector_size);

    for partition in &mut disk.partitions {
        partition.filesystem = probe_filesystem(runner, &partition.node);
    }

    debug!("{}", disk);
    for partition in &disk.partitions {
        debug!("  {}", partition);
    }
    Ok(disk)
}

/// Turns `sfdisk --json` output into a validated [`Disk`].
///
/// Filesystem types are left empty and the alignment is the 1 MiB default;
/// [`inspect`] fills both in.
pub fn parse_table(device_path: &Path, json: &str) -> Result<Disk> {
    let unreadable = |reason: String| ImageError::DeviceUnreadable {
        path: device_path.to_path_buf(),
        reason,
    };

    let output: SfdiskOutput = serde_json::from_str(json)
        .map_err(|e| unreadable(format!("malformed sfdisk output: {e}")))?;
    let table = output.partitiontable;

    let sector_size = table.sectorsize.unwrap_or(512);
    if sector_size == 0 {
        return Err(unreadable("sector size reported as zero".to_string()));
    }

    let mut partitions = Vec::new();
    for entry in table.partitions.unwrap_or_default() {
        if is_extended(entry.part_type.as_deref()) {
            debug!("skipping extended partition {}", entry.node);
            continue;
        }
        if entry.size == 0 {
            return Err(unreadable(format!("partition {} has zero length", entry.node)));
        }
        let number = partition_number(&entry.node).ok_or_else(|| {
            unreadable(format!("cannot tell the partition number of {}", entry.node))
        })?;
        partitions.push(Partition {
            node: PathBuf::from(&entry.node),
            number,
            start_sector: entry.start,
            end_sector: entry.start + entry.size - 1,
            filesystem: None,
        });
    }

    if partitions.is_empty() {
        return Err(ImageError::NoPartitionTable(device_path.to_path_buf()));
    }

    partitions.sort_by_key(|p| p.start_sector);
    for pair in partitions.windows(2) {
        if pair[1].start_sector <= pair[0].end_sector {
            return Err(unreadable(format!(
                "partitions {} and {} overlap",
                pair[0].node.display(),
                pair[1].node.display()
            )));
        }
    }

    Ok(Disk {
        path: device_path.to_path_buf(),
        sector_size,
        alignment: crate::device::Alignment::default_for(sector_size),
        partitions,
    })
}

/// The trailing digits of a partition node (`/dev/mmcblk0p2` is 2).
fn partition_number(node: &str) -> Option<u32> {
    let digits = node.len() - node.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    node[node.len() - digits..].parse().ok()
}

/// Asks `blkid` for the filesystem type on a partition node.
fn probe_filesystem(runner: &dyn CommandRunner, node: &Path) -> Option<String> {
    let node_arg = node.to_string_lossy();
    match runner.run("blkid", &["-o", "value", "-s", "TYPE", &node_arg], None) {
        Ok(output) if output.success() => {
            let fs_type = output.stdout.trim();
            (!fs_type.is_empty()).then(|| fs_type.to_string())
        }
        // Exit status 2: nothing recognizable on the partition.
        Ok(output) if output.status == Some(2) => None,
        Ok(output) => {
            warn!(
                "blkid could not probe {}: {}",
                node.display(),
                output.combined()
            );
            None
        }
        Err(e) => {
            warn!("failed to run blkid on {}: {}", node.display(), e);
            None
        }
    }
}
