//! Provides platform-specific functionality.
//!
//! This module contains the code that talks to the operating system's volume
//! subsystem: listing mounted volumes, resolving their attributes, unmounting
//! them, and watching the mount table for changes.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the correct
//! implementation for the target OS. Every submodule exposes the same public
//! API (`SystemVolumes`, `SystemMonitor`, `mount_monitor` and
//! `DEFAULT_EXTERNAL_ROOTS`), so the rest of the library can use it without
//! worrying about the underlying platform.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
mod other;
#[cfg(not(target_os = "linux"))]
pub use self::other::*;
