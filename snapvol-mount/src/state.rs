// SPDX-License-Identifier: GPL-3.0-only

//! Resolver states and the records they carry

use std::path::PathBuf;

use serde::Serialize;

use snapvol_types::{FilesystemType, LogicalVolume, PartitionTable};

/// Where the resolver is between attaching an image and releasing it.
///
/// `Listed`, `Unmountable` and `Cleaned` are terminal. `Mounted` hands the
/// filesystem to a session, which drives `Unmounting` once it ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveState {
    Init,
    Attached,
    Probed(PartitionTable),
    LvPath {
        table: PartitionTable,
        volume: LogicalVolume,
    },
    PartitionPath(PartitionTable),
    Mounted(MountedFilesystem),
    Unmounting,
    Cleaned,
    Listed(Inventory),
    Unmountable,
}

impl ResolveState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Attached => "attached",
            Self::Probed(_) => "probed",
            Self::LvPath { .. } => "lv-path",
            Self::PartitionPath(_) => "partition-path",
            Self::Mounted(_) => "mounted",
            Self::Unmounting => "unmounting",
            Self::Cleaned => "cleaned",
            Self::Listed(_) => "listed",
            Self::Unmountable => "unmountable",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cleaned | Self::Listed(_) | Self::Unmountable)
    }
}

/// A filesystem live at a mount point
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountedFilesystem {
    /// Device passed to mount
    pub device: String,
    pub mount_point: PathBuf,
    pub fs_type: FilesystemType,
    pub offset: u64,
    /// Set when the filesystem lives on a logical volume
    pub logical_volume: Option<LogicalVolume>,
    /// Set when the filesystem lives in a partition
    pub partition: Option<u32>,
}

/// Contents of an image reported by list-only inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inventory {
    pub partitions: PartitionTable,
    pub logical_volumes: Vec<LogicalVolume>,
}

/// Advisory conditions detected while resolving; resolution continues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MountInUseWarning {
    /// The image is already backing other loop devices
    ImageAttached { devices: Vec<String> },
    /// Something is already mounted at the mount point
    MountPointBusy(PathBuf),
}

impl std::fmt::Display for MountInUseWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ImageAttached { devices } => {
                write!(f, "image is already attached to {}", devices.join(", "))
            }
            Self::MountPointBusy(path) => {
                write!(f, "{} is already a mount point", path.display())
            }
        }
    }
}

/// Outcome of releasing host resources. Every step runs even when an earlier
/// one failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub completed: Vec<String>,
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
