use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Every failure the imaging pipeline can report.
///
/// Nothing here is retried by the library; the caller decides how to report
/// and halts.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid size '{0}': expected a whole number followed by one of B, K, M, G, T, P, E, Z, Y")]
    InvalidSize(String),

    #[error("cannot read device {}: {reason}", path.display())]
    DeviceUnreadable { path: PathBuf, reason: String },

    #[error("{} has no partition table or no partitions", .0.display())]
    NoPartitionTable(PathBuf),

    #[error("filesystem type '{found}' on {} is not supported for resize (only ext4)", node.display())]
    UnsupportedFilesystem { node: PathBuf, found: String },

    #[error("could not query filesystem on {}: {reason}", node.display())]
    FilesystemQueryFailed { node: PathBuf, reason: String },

    #[error("filesystem check of {} failed (e2fsck exit status {status:?}): {output}", node.display())]
    FilesystemCheckFailed {
        node: PathBuf,
        status: Option<i32>,
        output: String,
    },

    #[error("resize of {} failed: {reason}", node.display())]
    FilesystemResizeFailed { node: PathBuf, reason: String },

    #[error(
        "partition table of {} was NOT updated after the filesystem was shrunk; \
         partition {number} still spans its old geometry: {reason}",
        disk.display()
    )]
    PartitionCommitFailed {
        disk: PathBuf,
        number: u32,
        reason: String,
    },

    #[error("refusing to write invalid partition geometry: {0}")]
    InvalidGeometry(String),

    #[error("{} is mounted at {}; unmount it before shrinking", node.display(), mount_point.display())]
    PartitionMounted { node: PathBuf, mount_point: PathBuf },

    #[error("{} holds {capacity} bytes but the image needs {required}", path.display())]
    DeviceTooSmall {
        path: PathBuf,
        capacity: u64,
        required: u64,
    },

    #[error("short read at offset {offset}: source ended {missing} bytes early")]
    ShortRead { offset: u64, missing: u64 },

    #[error("short write at offset {offset}: destination accepted no more data")]
    ShortWrite { offset: u64 },

    #[error("verification failed: {} differs from {} within the first {len} bytes", src.display(), dest.display())]
    VerificationFailed {
        src: PathBuf,
        dest: PathBuf,
        len: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ImageError>;
