//! Shrinks the trailing ext4 filesystem and its partition.
//!
//! The filesystem is resized first, with `e2fsck` and `resize2fs`, and the
//! partition entry is then cut down to match through a [`TableEdit`]. The
//! order matters: a partition must never end before the filesystem inside it.
//!
//! The filesystem must not be mounted while this runs. The pipeline checks
//! that before calling [`shrink`].

use crate::command::{CommandOutput, CommandRunner};
use crate::device::{self, Disk, Partition, SUPPORTED_FILESYSTEM};
use crate::error::{ImageError, Result};
use std::path::Path;
use tracing::{debug, error, info};

/// How far the trailing filesystem can and should shrink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShrinkPlan {
    pub block_size: u64,
    pub current_size: u64,
    /// Smallest size `resize2fs -P` estimates the filesystem can take.
    pub minimum_size: u64,
    /// Free space to keep on top of the minimum.
    pub min_free: u64,
}

impl ShrinkPlan {
    pub fn target_size(&self) -> u64 {
        self.minimum_size.saturating_add(self.min_free)
    }

    pub fn needs_shrink(&self) -> bool {
        self.current_size > self.target_size()
    }

    /// Whole filesystem blocks for the target, rounded down.
    pub fn target_blocks(&self) -> u64 {
        self.target_size() / self.block_size
    }
}

/// Shrinks the last partition of `disk` so it keeps at least `min_free`
/// bytes free, and returns the new logical end byte of the disk.
///
/// When the filesystem is already at or below the target size this is a
/// no-op that only runs the two read-only queries and returns the current
/// end byte.
///
/// # Errors
///
/// - [`ImageError::UnsupportedFilesystem`] if the partition is not ext4. No
///   tool runs and the table is untouched.
/// - [`ImageError::FilesystemQueryFailed`] if the size queries fail.
/// - [`ImageError::FilesystemCheckFailed`] if `e2fsck` leaves errors behind;
///   nothing is resized.
/// - [`ImageError::FilesystemResizeFailed`] if `resize2fs` fails.
/// - [`ImageError::PartitionCommitFailed`] if the filesystem was shrunk but
///   the new partition table could not be written. The disk is then
///   inconsistent and must not be imaged.
pub fn shrink(runner: &dyn CommandRunner, disk: &mut Disk, min_free: u64) -> Result<u64> {
    let partition = disk
        .last_partition()
        .cloned()
        .ok_or_else(|| ImageError::NoPartitionTable(disk.path.clone()))?;
    let current_end = device::last_logical_byte(disk.sector_size, &partition);

    if partition.filesystem.as_deref() != Some(SUPPORTED_FILESYSTEM) {
        return Err(ImageError::UnsupportedFilesystem {
            node: partition.node.clone(),
            found: partition.filesystem_name().to_string(),
        });
    }

    info!("Determining if filesystem needs to shrink...");
    let plan = plan(runner, &partition.node, min_free)?;
    debug!("{:?}", plan);

    if !plan.needs_shrink() {
        info!(
            "{} does not need resize: {} bytes is already within the {} byte target.",
            partition.node.display(),
            plan.current_size,
            plan.target_size()
        );
        return Ok(current_end);
    }

    info!(
        "Partition needs resize. Resizing to {} bytes...",
        plan.target_size()
    );
    check_filesystem(runner, &partition.node)?;
    resize_filesystem(runner, &partition.node, plan.target_blocks())?;

    info!("Resizing partition...");
    match TableEdit::shrink_last(disk, plan.target_size())? {
        Some(edit) => {
            let new_end = edit.new_end_byte();
            edit.commit(runner, disk)?;
            Ok(new_end)
        }
        None => {
            info!("Partition already ends on the nearest aligned boundary.");
            Ok(current_end)
        }
    }
}

/// Queries the filesystem's current and minimum sizes.
pub fn plan(runner: &dyn CommandRunner, node: &Path, min_free: u64) -> Result<ShrinkPlan> {
    let query_failed = |reason: String| ImageError::FilesystemQueryFailed {
        node: node.to_path_buf(),
        reason,
    };
    let node_arg = node.to_string_lossy();

    let estimate = run_checked(runner, "resize2fs", &["-P", &node_arg])
        .map_err(query_failed)?;
    let min_blocks = parse_minimum_blocks(&estimate.stdout)
        .ok_or_else(|| query_failed("resize2fs -P reported no minimum size".to_string()))?;

    let dump = run_checked(runner, "dumpe2fs", &["-h", &node_arg]).map_err(query_failed)?;
    let block_size = parse_dumpe2fs_field(&dump.stdout, "Block size:")
        .filter(|&size| size > 0)
        .ok_or_else(|| query_failed("dumpe2fs reported no block size".to_string()))?;
    let block_count = parse_dumpe2fs_field(&dump.stdout, "Block count:")
        .ok_or_else(|| query_failed("dumpe2fs reported no block count".to_string()))?;

    Ok(ShrinkPlan {
        block_size,
        current_size: block_count * block_size,
        minimum_size: min_blocks * block_size,
        min_free,
    })
}

/// Runs `e2fsck -f -y` and fails unless every problem was fixed.
fn check_filesystem(runner: &dyn CommandRunner, node: &Path) -> Result<()> {
    info!("Running `e2fsck -f {}`...", node.display());
    let node_arg = node.to_string_lossy();
    let output = runner
        .run("e2fsck", &["-f", "-y", &node_arg], None)
        .map_err(|e| ImageError::FilesystemCheckFailed {
            node: node.to_path_buf(),
            status: None,
            output: format!("failed to run e2fsck: {e}"),
        })?;

    // Exit bits 1 and 2 mean errors were found and corrected. Anything else
    // (uncorrected errors, operational or usage errors, cancellation) or a
    // signal means the filesystem is not safe to resize.
    match output.status {
        Some(code) if code & !0b11 == 0 => Ok(()),
        status => Err(ImageError::FilesystemCheckFailed {
            node: node.to_path_buf(),
            status,
            output: output.combined(),
        }),
    }
}

fn resize_filesystem(runner: &dyn CommandRunner, node: &Path, blocks: u64) -> Result<()> {
    info!("Shrinking {} to {} blocks...", node.display(), blocks);
    let node_arg = node.to_string_lossy();
    let blocks_arg = blocks.to_string();
    run_checked(runner, "resize2fs", &[&node_arg, &blocks_arg]).map_err(|reason| {
        ImageError::FilesystemResizeFailed {
            node: node.to_path_buf(),
            reason,
        }
    })?;
    Ok(())
}

/// Runs a tool and turns a spawn failure or non-zero exit into a message.
fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
) -> std::result::Result<CommandOutput, String> {
    let output = runner
        .run(program, args, None)
        .map_err(|e| format!("failed to run {program}: {e}"))?;
    if !output.success() {
        return Err(format!(
            "{program} exited with status {:?}: {}",
            output.status,
            output.combined()
        ));
    }
    Ok(output)
}

/// Parses "Estimated minimum size of the filesystem: N" from `resize2fs -P`.
fn parse_minimum_blocks(output: &str) -> Option<u64> {
    output
        .lines()
        .find_map(|line| line.split_once("Estimated minimum size of the filesystem:"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Parses a numeric field such as "Block count:" from `dumpe2fs -h` output.
fn parse_dumpe2fs_field(output: &str, field: &str) -> Option<u64> {
    output
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|value| value.trim().parse().ok())
}

/// A pending change to the trailing partition's geometry.
///
/// The new table state is built and validated entirely in memory; only
/// [`TableEdit::commit`] touches the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableEdit {
    pub old: Partition,
    pub new: Partition,
    /// Sectors the resized filesystem needs. The new partition never has
    /// fewer.
    pub required_sectors: u64,
    sector_size: u64,
}

impl TableEdit {
    /// Plans shrinking the last partition of `disk` to hold `target_size`
    /// bytes.
    ///
    /// The new end sector is moved forward to the next optimal alignment
    /// boundary and clamped to the old end. Returns `Ok(None)` when that
    /// leaves the partition unchanged.
    pub fn shrink_last(disk: &Disk, target_size: u64) -> Result<Option<TableEdit>> {
        let old = disk
            .last_partition()
            .cloned()
            .ok_or_else(|| ImageError::NoPartitionTable(disk.path.clone()))?;

        let required_sectors = target_size.div_ceil(disk.sector_size).max(1);
        let min_end = old.start_sector + required_sectors - 1;
        let new_end = disk.alignment.align_end_up(min_end).min(old.end_sector);
        debug!(
            "partition {}: {} sectors required, end {} -> {}",
            old.number, required_sectors, old.end_sector, new_end
        );

        if new_end >= old.end_sector {
            return Ok(None);
        }

        let new = Partition {
            end_sector: new_end,
            ..old.clone()
        };
        let edit = TableEdit {
            old,
            new,
            required_sectors,
            sector_size: disk.sector_size,
        };
        edit.validate(disk)?;
        Ok(Some(edit))
    }

    /// Checks the edited table against the invariants every table must keep.
    pub fn validate(&self, disk: &Disk) -> Result<()> {
        let invalid = |msg: String| Err(ImageError::InvalidGeometry(msg));

        if self.new.start_sector != self.old.start_sector {
            return invalid(format!(
                "start sector moved from {} to {}",
                self.old.start_sector, self.new.start_sector
            ));
        }
        if self.new.end_sector < self.new.start_sector {
            return invalid(format!(
                "end sector {} precedes start sector {}",
                self.new.end_sector, self.new.start_sector
            ));
        }
        if self.new.end_sector > self.old.end_sector {
            return invalid(format!(
                "end sector {} grows past the old end {}",
                self.new.end_sector, self.old.end_sector
            ));
        }
        if self.new.len_sectors() < self.required_sectors {
            return invalid(format!(
                "{} sectors cannot hold a filesystem needing {}",
                self.new.len_sectors(),
                self.required_sectors
            ));
        }

        let mut partitions = self.apply(&disk.partitions);
        partitions.sort_by_key(|p| p.start_sector);
        for pair in partitions.windows(2) {
            if pair[1].start_sector <= pair[0].end_sector {
                return invalid(format!(
                    "{} would overlap {}",
                    pair[0].node.display(),
                    pair[1].node.display()
                ));
            }
        }
        Ok(())
    }

    /// Exclusive end byte of the partition after the edit.
    pub fn new_end_byte(&self) -> u64 {
        device::last_logical_byte(self.sector_size, &self.new)
    }

    /// The `sfdisk` script line describing the new geometry.
    pub fn script(&self) -> String {
        format!(
            "start={}, size={}\n",
            self.new.start_sector,
            self.new.len_sectors()
        )
    }

    fn apply(&self, partitions: &[Partition]) -> Vec<Partition> {
        partitions
            .iter()
            .map(|p| {
                if p.number == self.old.number {
                    self.new.clone()
                } else {
                    p.clone()
                }
            })
            .collect()
    }

    /// Writes the new geometry to the device and, on success, to `disk`.
    ///
    /// On failure `disk` keeps the old geometry, which is what the device
    /// still holds.
    pub fn commit(self, runner: &dyn CommandRunner, disk: &mut Disk) -> Result<()> {
        let commit_failed = |reason: String| {
            error!(
                "The filesystem on {} was shrunk but the partition table was not updated.",
                self.old.node.display()
            );
            ImageError::PartitionCommitFailed {
                disk: disk.path.clone(),
                number: self.old.number,
                reason,
            }
        };

        let disk_arg = disk.path.to_string_lossy().to_string();
        let number_arg = self.old.number.to_string();
        let script = self.script();
        debug!("sfdisk -N {} {}: {}", number_arg, disk_arg, script.trim());

        let output = runner
            .run(
                "sfdisk",
                &["--no-reread", "-N", &number_arg, &disk_arg],
                Some(&script),
            )
            .map_err(|e| commit_failed(format!("failed to run sfdisk: {e}")))?;
        if !output.success() {
            return Err(commit_failed(format!(
                "sfdisk exited with status {:?}: {}",
                output.status,
                output.combined()
            )));
        }

        disk.partitions = self.apply(&disk.partitions);
        Ok(())
    }
}
