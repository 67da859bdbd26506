// SPDX-License-Identifier: GPL-3.0-only

//! `<image>.metadata.json` sidecar

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use snapvol_types::ImageMetadata;

/// Write the sidecar next to `image`, replacing any previous one.
pub fn write_sidecar(image: &Path, metadata: &ImageMetadata) -> io::Result<PathBuf> {
    let path = ImageMetadata::sidecar_path(image);
    let content = serde_json::to_string_pretty(metadata).map_err(io::Error::other)?;

    let staging = path.with_extension("json.tmp");
    fs::write(&staging, content)?;
    fs::rename(&staging, &path)?;
    Ok(path)
}

pub fn read_sidecar(image: &Path) -> io::Result<ImageMetadata> {
    let content = fs::read_to_string(ImageMetadata::sidecar_path(image))?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write the sidecar, logging instead of failing. The image itself is already
/// complete at this point.
pub fn emit(image: &Path, metadata: &ImageMetadata) -> Option<PathBuf> {
    match write_sidecar(image, metadata) {
        Ok(path) => {
            info!(path = %path.display(), "saved image metadata");
            Some(path)
        }
        Err(e) => {
            warn!(image = %image.display(), "failed to write image metadata: {e}");
            None
        }
    }
}
