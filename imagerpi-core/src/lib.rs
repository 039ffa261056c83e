//! The core, UI-agnostic library for the `imagerpi` disk imaging utility.
//!
//! `imagerpi-core` captures SD cards and similar block devices into raw image
//! files and deploys those images back. Before capturing, it shrinks the
//! trailing ext4 filesystem and its partition so the image only holds the
//! bytes in use plus a chosen amount of free space.
//!
//! The library is structured into several key modules:
//! - [`units`]: Parses human-readable size strings such as `500M`.
//! - [`command`]: The [`command::CommandRunner`] seam through which `sfdisk`,
//!   `blkid` and e2fsprogs are run.
//! - [`device`]: The [`device::Disk`] and [`device::Partition`] model.
//! - [`inspect`]: Reads a device's partition table and geometry.
//! - [`shrink`]: Shrinks the trailing filesystem and partition.
//! - [`mod@copy`]: Byte-range copies and verification between streams.
//! - [`pipeline`]: The capture and deploy operations built from the above.
//! - [`platform`]: Linux-specific device queries.
//!
//! The primary entry points are [`pipeline::capture`] and
//! [`pipeline::deploy`]. They take their configuration explicitly and report
//! progress via callbacks, so the calling application can display progress
//! in any way it chooses.
//!
//! ## Example: Capturing an SD card
//!
//! ```rust,no_run
//! use imagerpi_core::command::SystemRunner;
//! use imagerpi_core::pipeline::{self, CaptureOptions, Outcome};
//! use imagerpi_core::units;
//! use std::path::Path;
//!
//! fn main() -> imagerpi_core::Result<()> {
//!     let options = CaptureOptions {
//!         min_free: units::parse("200M")?,
//!         ..CaptureOptions::default()
//!     };
//!
//!     let outcome = pipeline::capture(
//!         &SystemRunner,
//!         Path::new("/dev/mmcblk0"),
//!         Path::new("raspios.img"),
//!         &options,
//!         |_existing| Ok(true), // overwrite without asking
//!         pipeline::silent(),
//!     )?;
//!
//!     if let Outcome::Completed { bytes } = outcome {
//!         println!("captured {} bytes", bytes);
//!     }
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod copy;
pub mod device;
mod error;
pub mod inspect;
pub mod pipeline;
pub mod platform;
pub mod shrink;
pub mod units;

pub use error::{ImageError, Result};
