use std::fmt;
use std::path::PathBuf;

/// The one filesystem type the shrinker knows how to resize.
pub const SUPPORTED_FILESYSTEM: &str = "ext4";

/// A partitioned block device as read from its partition table.
///
/// This is populated by [`crate::inspect::inspect`] and owned by a single
/// pipeline run. Partitions are kept sorted by start sector and never
/// overlap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disk {
    /// The system path to the device (e.g., `/dev/mmcblk0`).
    pub path: PathBuf,
    /// Logical sector size in bytes.
    pub sector_size: u64,
    /// Where partition boundaries should fall for best I/O performance.
    pub alignment: Alignment,
    pub partitions: Vec<Partition>,
}

/// One entry of a partition table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// The partition's own device node (e.g., `/dev/mmcblk0p2`).
    pub node: PathBuf,
    /// The kernel partition number, as used by `sfdisk -N`.
    pub number: u32,
    pub start_sector: u64,
    /// Last sector of the partition, inclusive.
    pub end_sector: u64,
    /// Filesystem type reported by `blkid`, if any was recognized.
    pub filesystem: Option<String>,
}

/// A device's optimal alignment, expressed in sectors.
///
/// A partition end sector `s` is aligned when `s + 1 - offset` is a multiple
/// of `grain`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Alignment {
    pub grain: u64,
    pub offset: u64,
}

impl Alignment {
    /// 1 MiB boundaries, the usual choice when the device gives no hint.
    pub fn default_for(sector_size: u64) -> Self {
        Self {
            grain: (1024 * 1024 / sector_size.max(1)).max(1),
            offset: 0,
        }
    }

    pub fn is_aligned_end(&self, end_sector: u64) -> bool {
        self.grain <= 1 || self.misalignment(end_sector + 1) == 0
    }

    /// The smallest aligned end sector that is `>= end_sector`.
    pub fn align_end_up(&self, end_sector: u64) -> u64 {
        if self.grain <= 1 {
            return end_sector;
        }
        let rel = self.misalignment(end_sector + 1);
        if rel == 0 {
            end_sector
        } else {
            end_sector + (self.grain - rel)
        }
    }

    /// `(boundary - offset) mod grain`, without underflow.
    fn misalignment(&self, boundary: u64) -> u64 {
        let offset = self.offset % self.grain;
        (boundary % self.grain + self.grain - offset) % self.grain
    }
}

impl Disk {
    /// The partition with the highest end sector.
    pub fn last_partition(&self) -> Option<&Partition> {
        self.partitions.iter().max_by_key(|p| p.end_sector)
    }

    /// Exclusive upper bound of every byte in use on the disk.
    pub fn last_logical_byte(&self) -> Option<u64> {
        self.last_partition()
            .map(|p| last_logical_byte(self.sector_size, p))
    }
}

impl Partition {
    pub fn len_sectors(&self) -> u64 {
        self.end_sector - self.start_sector + 1
    }

    pub fn filesystem_name(&self) -> &str {
        self.filesystem.as_deref().unwrap_or("none")
    }
}

/// `(end_sector + 1) * sector_size`: the byte just past the partition.
pub fn last_logical_byte(sector_size: u64, partition: &Partition) -> u64 {
    (partition.end_sector + 1) * sector_size
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<18} #{:<3} sectors {}..={} [{}]",
            self.node.display(),
            self.number,
            self.start_sector,
            self.end_sector,
            self.filesystem_name()
        )
    }
}

impl fmt::Display for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} byte sectors, {} partitions)",
            self.path.display(),
            self.sector_size,
            self.partitions.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(number: u32, start: u64, end: u64) -> Partition {
        Partition {
            node: PathBuf::from(format!("/dev/mmcblk0p{number}")),
            number,
            start_sector: start,
            end_sector: end,
            filesystem: None,
        }
    }

    #[test]
    fn last_partition_is_highest_end_sector() {
        let disk = Disk {
            path: PathBuf::from("/dev/mmcblk0"),
            sector_size: 512,
            alignment: Alignment::default_for(512),
            partitions: vec![part(1, 8192, 532479), part(2, 532480, 3_000_000)],
        };
        assert_eq!(disk.last_partition().unwrap().number, 2);
        assert_eq!(disk.last_logical_byte(), Some(3_000_001 * 512));
    }

    #[test]
    fn empty_disk_has_no_logical_end() {
        let disk = Disk {
            path: PathBuf::from("/dev/sdz"),
            sector_size: 512,
            alignment: Alignment::default_for(512),
            partitions: vec![],
        };
        assert!(disk.last_logical_byte().is_none());
    }

    #[test]
    fn default_alignment_is_one_mebibyte() {
        assert_eq!(Alignment::default_for(512).grain, 2048);
        assert_eq!(Alignment::default_for(4096).grain, 256);
    }

    #[test]
    fn align_end_up_moves_to_next_boundary() {
        let a = Alignment { grain: 2048, offset: 0 };
        assert_eq!(a.align_end_up(2047), 2047);
        assert_eq!(a.align_end_up(2048), 4095);
        assert_eq!(a.align_end_up(3000), 4095);
        assert!(a.is_aligned_end(4095));
        assert!(!a.is_aligned_end(4096));

        let shifted = Alignment { grain: 8, offset: 3 };
        assert_eq!(shifted.align_end_up(0), 2);
        assert_eq!(shifted.align_end_up(3), 10);
        assert!(shifted.is_aligned_end(10));
    }
}
