// SPDX-License-Identifier: GPL-3.0-only

//! Test doubles for snapvol
//!
//! - [`MemoryVolumeStore`]: snapshot service and block source with fault plans
//! - [`FakeHost`]: scripted loop/LVM/mount host recording every call

pub mod host;
pub mod store;

pub use host::{FakeHost, HostCall, Mountable};
pub use store::{BlockFault, MemoryVolumeStore, block_bytes};
