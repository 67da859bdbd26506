// SPDX-License-Identifier: GPL-3.0-only

//! Mount resolution for downloaded volume images
//!
//! A [`Resolver`] attaches an image to a loop device, inspects its partition
//! table and volume groups, and mounts the most appropriate filesystem. A
//! [`MountSession`] then owns the mount until its command exits and drives the
//! reverse-order teardown.

pub mod error;
pub mod resolver;
pub mod session;
pub mod state;

pub use error::{ResolveError, Result};
pub use resolver::{DEFAULT_PARTITION, Resolution, ResolveOptions, Resolver};
pub use session::{MOUNT_ENV, MountSession, SessionCommand, SessionEnd};
pub use state::{Inventory, MountInUseWarning, MountedFilesystem, ResolveState, TeardownReport};
