// SPDX-License-Identifier: GPL-3.0-only

//! LVM (Logical Volume Manager) types
//!
//! Volume groups found inside an attached image and the logical volumes they expose.

use serde::{Deserialize, Serialize};

/// Physical volume as reported by `pvs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalVolume {
    /// Device path (e.g., "/dev/loop3p2")
    pub device: String,

    /// Volume group name (None if not assigned)
    pub vg_name: Option<String>,
}

impl PhysicalVolume {
    /// Check whether this PV lives on the given loop device or one of its partitions
    pub fn is_on_device(&self, loop_device: &str) -> bool {
        match self.device.strip_prefix(loop_device) {
            Some("") => true,
            Some(rest) => rest
                .strip_prefix('p')
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())),
            None => false,
        }
    }
}

/// Volume group discovered on an attached image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroup {
    /// Volume group name
    pub name: String,

    /// Physical volume device paths backing this group
    pub physical_volumes: Vec<String>,
}

/// Logical volume information
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalVolume {
    /// Parent volume group name
    pub vg_name: String,

    /// Logical volume name
    pub name: String,

    /// Device path (e.g., "/dev/vg0/lv0" or "/dev/mapper/vg0-lv0")
    pub device_path: String,
}

impl LogicalVolume {
    /// Get a display name for this logical volume
    pub fn display_name(&self) -> String {
        // Prefer short form: vg/lv
        if !self.vg_name.is_empty() && !self.name.is_empty() {
            format!("{}/{}", self.vg_name, self.name)
        } else if let Some(stripped) = self.device_path.strip_prefix("/dev/") {
            stripped.to_string()
        } else {
            self.device_path.clone()
        }
    }
}
