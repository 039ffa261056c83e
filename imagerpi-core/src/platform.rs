//! Provides platform-specific functionality.
//!
//! Imaging talks to raw block devices, the kernel's sysfs and the mount table,
//! none of which is portable. Only Linux is supported; the submodule exposes
//! block-device detection, capacity and alignment queries, mount lookup and
//! the final `sync`.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
