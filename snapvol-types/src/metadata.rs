// SPDX-License-Identifier: GPL-3.0-only

//! Sidecar record written next to a downloaded image

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Descriptive metadata for a downloaded image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub volume_id: String,
    pub volume_name: Option<String>,
    pub snapshot_id: String,
    pub size_bytes: u64,
    pub block_size: u32,
    /// Number of blocks the snapshot listed (zero blocks are not listed)
    pub block_count: u64,
    pub region: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ImageMetadata {
    /// Sidecar path for an image: `<image>.metadata.json`
    pub fn sidecar_path(image: &std::path::Path) -> std::path::PathBuf {
        let mut name = image.as_os_str().to_os_string();
        name.push(".metadata.json");
        std::path::PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn sidecar_sits_next_to_image() {
        let path = ImageMetadata::sidecar_path(Path::new("/tmp/vol.img"));
        assert_eq!(path, Path::new("/tmp/vol.img.metadata.json"));
    }

    #[test]
    fn serializes_expected_fields() {
        let metadata = ImageMetadata {
            volume_id: "vol-1".to_string(),
            volume_name: None,
            snapshot_id: "snap-1".to_string(),
            size_bytes: 8,
            block_size: 4,
            block_count: 2,
            region: Some("eu-west-1".to_string()),
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&metadata).unwrap();
        for field in [
            "volume_id",
            "snapshot_id",
            "size_bytes",
            "block_size",
            "region",
            "created_at",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }
}
