// SPDX-License-Identifier: GPL-3.0-only

//! Volume and snapshot records
//!
//! Volumes are read-only from snapvol's point of view. Snapshots are created,
//! polled and deleted by the lifecycle manager in `snapvol-fetch`.

use serde::{Deserialize, Serialize};

/// Attachment state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Available,
    InUse,
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::InUse => "in-use",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "in-use" | "in_use" => Some(Self::InUse),
            _ => None,
        }
    }
}

/// Remote block-storage volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume identifier (e.g., "vol-0123456789abcdef0")
    pub id: String,

    /// Value of the Name tag, if any
    pub name: Option<String>,

    /// Size in bytes
    pub size_bytes: u64,

    /// Attachment state
    pub state: VolumeState,

    /// Instance the volume is attached to, if any
    pub attached_instance: Option<String>,
}

impl Volume {
    pub fn is_in_use(&self) -> bool {
        self.state == VolumeState::InUse
    }

    /// "vol-123 (name)" when a name tag exists, otherwise the bare id
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("{} ({})", self.id, name),
            _ => self.id.clone(),
        }
    }
}

/// Readiness state of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
}

/// Point-in-time copy of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot identifier
    pub id: String,

    /// Volume this snapshot was taken from
    pub volume_id: String,

    /// Readiness state
    pub state: SnapshotState,

    /// True when snapvol created the snapshot and must delete it
    pub ephemeral: bool,
}
