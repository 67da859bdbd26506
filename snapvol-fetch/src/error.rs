// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use thiserror::Error;

use snapvol_contracts::SourceError;
use snapvol_sys::SysError;

/// Errors surfaced by snapshot acquisition and block download
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Volume {0} not found")]
    VolumeNotFound(String),

    #[error("Volume {0} is in use and the download was not confirmed")]
    UserDeclined(String),

    #[error("Snapshot {snapshot_id} not ready after {waited:?}")]
    SnapshotTimeout {
        snapshot_id: String,
        waited: Duration,
    },

    #[error("Snapshot {0} entered the error state")]
    SnapshotFailed(String),

    #[error("Failed to fetch block {index} after {attempts} attempts: {reason}")]
    BlockFetchError {
        index: u64,
        attempts: u32,
        reason: String,
    },

    #[error("Checksum mismatch for block {index}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        index: u64,
        expected: String,
        actual: String,
    },

    #[error("Source lists {listed}-byte blocks but the image uses {image}-byte blocks")]
    BlockSizeMismatch { listed: u32, image: u32 },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Snapshot service error: {0}")]
    Source(#[from] SourceError),

    #[error("Image error: {0}")]
    Image(#[from] SysError),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl DownloadError {
    /// Whether a block fetch failing with this error may be attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source(e) => e.is_retryable(),
            Self::ChecksumMismatch { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias for download operations
pub type Result<T> = std::result::Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;
    use snapvol_contracts::SourceErrorKind;

    #[test]
    fn transient_and_checksum_errors_are_retryable() {
        assert!(DownloadError::Source(SourceError::transport("reset")).is_retryable());
        assert!(
            DownloadError::ChecksumMismatch {
                index: 1,
                expected: "a".to_string(),
                actual: "b".to_string(),
            }
            .is_retryable()
        );
        assert!(
            !DownloadError::Source(SourceError::new(SourceErrorKind::PermissionDenied, "no"))
                .is_retryable()
        );
        assert!(!DownloadError::Cancelled.is_retryable());
    }
}
