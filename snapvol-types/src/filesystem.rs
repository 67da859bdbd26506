// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem types tried by the mount resolver

use serde::{Deserialize, Serialize};

/// Filesystem type passed to the host mount facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    Ext4,
    Ext3,
    Ext2,
    Xfs,
    Btrfs,
    /// Let the host probe the filesystem
    Auto,
}

/// Fixed candidate order; `Auto` is only tried after every explicit type failed.
pub const FILESYSTEM_CANDIDATES: [FilesystemType; 6] = [
    FilesystemType::Ext4,
    FilesystemType::Ext3,
    FilesystemType::Ext2,
    FilesystemType::Xfs,
    FilesystemType::Btrfs,
    FilesystemType::Auto,
];

impl FilesystemType {
    /// Value for `mount -t`, `None` for auto-detection
    pub fn mount_type(&self) -> Option<&'static str> {
        match self {
            Self::Ext4 => Some("ext4"),
            Self::Ext3 => Some("ext3"),
            Self::Ext2 => Some("ext2"),
            Self::Xfs => Some("xfs"),
            Self::Btrfs => Some("btrfs"),
            Self::Auto => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.mount_type().unwrap_or("auto")
    }
}

impl std::fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
