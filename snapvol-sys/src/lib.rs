// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for snapvol
//!
//! This crate provides direct interfaces for the host-side work of
//! reconstructing and mounting volume images:
//! - Positioned, sparse writes of downloaded blocks into an image file
//! - Loop device attachment via `losetup`
//! - Partition table probing via `sfdisk --json`
//! - LVM discovery and activation via `pvs`, `lvs` and `vgchange`
//! - Filesystem mount and unmount
//!
//! Mount-related operations require elevated privileges and should only be
//! called from a privileged process.

pub mod cmd;
pub mod error;
pub mod host;
pub mod image;
pub mod lock;
pub mod logical;
pub mod loop_device;
pub mod mount;
pub mod partition;

pub use error::{Result, SysError};
pub use host::{HostTools, SystemHost};
pub use image::{Allocation, ImageSummary, SparseImageWriter};
pub use lock::ImageLock;
pub use mount::MountRequest;
