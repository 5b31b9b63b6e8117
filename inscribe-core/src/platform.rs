//! Operating-system probing: block-device enumeration via `lsblk`, sysfs
//! attributes, and locating the disk the running system boots from.
//!
//! Only Linux is implemented; the module is compiled per target OS.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
