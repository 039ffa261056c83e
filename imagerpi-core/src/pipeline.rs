//! The capture and deploy operations, composed from the other modules.
//!
//! Capture inspects the source device, shrinks its trailing filesystem and
//! copies everything up to the new logical end into an image file. Deploy
//! writes an image file verbatim onto a device. Neither reads global state:
//! confirmation and progress reporting are supplied by the caller.

use crate::command::CommandRunner;
use crate::copy;
use crate::error::{ImageError, Result};
use crate::inspect;
use crate::platform;
use crate::shrink;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What the pipeline asks the host about devices outside their partition
/// tables. Tests substitute a fixed answer.
trait Host {
    fn mount_point_of(&self, node: &Path) -> Option<PathBuf>;
    fn device_size(&self, path: &Path) -> Result<Option<u64>>;
}

struct LocalHost;

impl Host for LocalHost {
    fn mount_point_of(&self, node: &Path) -> Option<PathBuf> {
        platform::mount_point_of(node)
    }

    fn device_size(&self, path: &Path) -> Result<Option<u64>> {
        platform::device_size(path)
    }
}

/// Settings for [`capture`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Shrink the trailing filesystem and partition before copying.
    pub shrink: bool,
    /// Copy the device to the image file. Disabling this only shrinks.
    pub copy: bool,
    /// Free space to leave in the shrunk filesystem, in bytes.
    pub min_free: u64,
    /// Transfer chunk size in bytes. Must be non-zero.
    pub buffer_size: u64,
    /// Compare the image against the device after copying.
    pub verify: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            shrink: true,
            copy: true,
            min_free: 500 * 1024 * 1024,
            buffer_size: 512 * 1024,
            verify: false,
        }
    }
}

/// Settings for [`deploy`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployOptions {
    /// Transfer chunk size in bytes. Must be non-zero.
    pub buffer_size: u64,
    /// Compare the device against the image after writing.
    pub verify: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            buffer_size: 512 * 1024,
            verify: false,
        }
    }
}

/// How a pipeline run ended, when it did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The range `[0, bytes)` was processed.
    Completed { bytes: u64 },
    /// The caller declined to overwrite the destination; nothing was changed.
    Aborted,
}

/// Progress callbacks for the copy and verify stages.
///
/// `*_start` is called once with the total byte count; `*_progress` after
/// every chunk with the bytes done so far.
pub struct Progress<S1, P1, S2, P2>
where
    S1: FnOnce(u64),
    P1: FnMut(u64),
    S2: FnOnce(u64),
    P2: FnMut(u64),
{
    pub on_copy_start: S1,
    pub on_copy_progress: P1,
    pub on_verify_start: S2,
    pub on_verify_progress: P2,
}

/// Progress callbacks that report nothing.
pub fn silent() -> Progress<impl FnOnce(u64), impl FnMut(u64), impl FnOnce(u64), impl FnMut(u64)>
{
    Progress {
        on_copy_start: |_: u64| {},
        on_copy_progress: |_: u64| {},
        on_verify_start: |_: u64| {},
        on_verify_progress: |_: u64| {},
    }
}

fn check_buffer_size(buffer_size: u64) -> Result<()> {
    if buffer_size == 0 {
        return Err(ImageError::InvalidSize("0B".to_string()));
    }
    Ok(())
}

/// Images the block device `src` into the file `dest`.
///
/// If `dest` already exists, `confirm_overwrite` decides whether to go on;
/// returning `false` yields [`Outcome::Aborted`] before anything is touched.
///
/// # Errors
///
/// Any error from inspection, shrinking, copying or verification.
/// Shrinking refuses with [`ImageError::PartitionMounted`] if the trailing
/// partition is mounted, and an unsupported filesystem aborts the capture
/// rather than producing an unshrunk image.
pub fn capture<C, S1, P1, S2, P2>(
    runner: &dyn CommandRunner,
    src: &Path,
    dest: &Path,
    options: &CaptureOptions,
    confirm_overwrite: C,
    progress: Progress<S1, P1, S2, P2>,
) -> Result<Outcome>
where
    C: FnOnce(&Path) -> Result<bool>,
    S1: FnOnce(u64),
    P1: FnMut(u64),
    S2: FnOnce(u64),
    P2: FnMut(u64),
{
    capture_on(&LocalHost, runner, src, dest, options, confirm_overwrite, progress)
}

fn capture_on<C, S1, P1, S2, P2>(
    host: &dyn Host,
    runner: &dyn CommandRunner,
    src: &Path,
    dest: &Path,
    options: &CaptureOptions,
    confirm_overwrite: C,
    progress: Progress<S1, P1, S2, P2>,
) -> Result<Outcome>
where
    C: FnOnce(&Path) -> Result<bool>,
    S1: FnOnce(u64),
    P1: FnMut(u64),
    S2: FnOnce(u64),
    P2: FnMut(u64),
{
    check_buffer_size(options.buffer_size)?;
    debug!("Source: {}", src.display());
    debug!("Destination: {}", dest.display());
    debug!("Buffer Size: {}", options.buffer_size);

    let mut disk = inspect::inspect(runner, src)?;
    let mut last_byte = disk
        .last_logical_byte()
        .ok_or_else(|| ImageError::NoPartitionTable(src.to_path_buf()))?;
    debug!("Total Size: {}", last_byte);

    if dest.is_file() && !confirm_overwrite(dest)? {
        info!("Operation aborted.");
        return Ok(Outcome::Aborted);
    }

    if options.shrink {
        if let Some(partition) = disk.last_partition() {
            if let Some(mount_point) = host.mount_point_of(&partition.node) {
                return Err(ImageError::PartitionMounted {
                    node: partition.node.clone(),
                    mount_point,
                });
            }
        }
        last_byte = shrink::shrink(runner, &mut disk, options.min_free)?;
        debug!("Total Size after shrink: {}", last_byte);
    }

    if options.copy {
        run_copy(src, dest, last_byte, options.buffer_size, options.verify, progress)?;
    }

    finish();
    Ok(Outcome::Completed { bytes: last_byte })
}

/// Writes the image file `src` onto the block device `dest`.
///
/// The whole file is written; its size is the length of the range.
///
/// # Errors
///
/// [`ImageError::DeviceTooSmall`] if `dest` is a block device with less
/// capacity than the image, or any copy or verification error.
pub fn deploy<S1, P1, S2, P2>(
    src: &Path,
    dest: &Path,
    options: &DeployOptions,
    progress: Progress<S1, P1, S2, P2>,
) -> Result<Outcome>
where
    S1: FnOnce(u64),
    P1: FnMut(u64),
    S2: FnOnce(u64),
    P2: FnMut(u64),
{
    deploy_on(&LocalHost, src, dest, options, progress)
}

fn deploy_on<S1, P1, S2, P2>(
    host: &dyn Host,
    src: &Path,
    dest: &Path,
    options: &DeployOptions,
    progress: Progress<S1, P1, S2, P2>,
) -> Result<Outcome>
where
    S1: FnOnce(u64),
    P1: FnMut(u64),
    S2: FnOnce(u64),
    P2: FnMut(u64),
{
    check_buffer_size(options.buffer_size)?;
    debug!("Source: {}", src.display());
    debug!("Destination: {}", dest.display());
    debug!("Buffer Size: {}", options.buffer_size);

    let last_byte = std::fs::metadata(src)?.len();
    debug!("Total Size: {}", last_byte);

    if let Some(capacity) = host.device_size(dest)? {
        if capacity < last_byte {
            return Err(ImageError::DeviceTooSmall {
                path: dest.to_path_buf(),
                capacity,
                required: last_byte,
            });
        }
    }

    run_copy(src, dest, last_byte, options.buffer_size, options.verify, progress)?;

    finish();
    Ok(Outcome::Completed { bytes: last_byte })
}

fn run_copy<S1, P1, S2, P2>(
    src: &Path,
    dest: &Path,
    len: u64,
    buffer_size: u64,
    verify: bool,
    progress: Progress<S1, P1, S2, P2>,
) -> Result<()>
where
    S1: FnOnce(u64),
    P1: FnMut(u64),
    S2: FnOnce(u64),
    P2: FnMut(u64),
{
    let Progress {
        on_copy_start,
        mut on_copy_progress,
        on_verify_start,
        mut on_verify_progress,
    } = progress;

    info!("Beginning copy");
    on_copy_start(len);
    copy::copy_path(src, dest, len, buffer_size, |done, _| on_copy_progress(done))?;

    if verify {
        info!("Verifying copy");
        on_verify_start(len * 2);
        copy::verify_path(src, dest, len, buffer_size, |done, _| {
            on_verify_progress(done)
        })?;
    }
    Ok(())
}

fn finish() {
    info!("Operation completed. Syncing filesystems...");
    platform::sync_filesystems();
    info!("Done.");
}
