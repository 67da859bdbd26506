// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for snapvol
//!
//! This crate defines the records shared by every layer of the stack:
//!
//! - **snapvol-contracts**: block source and snapshot service traits speak these types
//! - **snapvol-fetch**: turns `BlockDescriptor`s into a sparse image and an `ImageMetadata` sidecar
//! - **snapvol-mount**: parses partition tables and volume groups into `PartitionEntry`
//!   and `LogicalVolume` records before making any mount decision
//!
//! Raw tool output and remote responses are converted into these records at the
//! boundary, so no internal logic inspects untyped text.

pub mod block;
pub mod common;
pub mod filesystem;
pub mod lvm;
pub mod metadata;
pub mod partition;
pub mod volume;

pub use block::{BlockData, BlockDescriptor, BlockPage, ChecksumAlgorithm, FetchResult};
pub use common::{DEFAULT_BLOCK_SIZE, DEFAULT_SECTOR_SIZE, LIST_PAGE_SIZE, format_bytes};
pub use filesystem::{FILESYSTEM_CANDIDATES, FilesystemType};
pub use lvm::{LogicalVolume, PhysicalVolume, VolumeGroup};
pub use metadata::ImageMetadata;
pub use partition::{PartitionEntry, PartitionTable, PartitionTableType};
pub use volume::{Snapshot, SnapshotState, Volume, VolumeState};
