// SPDX-License-Identifier: GPL-3.0-only

//! Block checksum computation and verification

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

use snapvol_types::{BlockData, BlockDescriptor, ChecksumAlgorithm};

use crate::error::{DownloadError, Result};

/// Checksum of `bytes` in the encoding used by block sources
pub fn compute(bytes: &[u8], algorithm: ChecksumAlgorithm) -> String {
    match algorithm {
        ChecksumAlgorithm::Sha256 => STANDARD.encode(Sha256::digest(bytes)),
    }
}

/// Check fetched bytes against the checksum returned with them and, when
/// present, the checksum declared by the listing.
pub fn verify(descriptor: &BlockDescriptor, data: &BlockData) -> Result<()> {
    let actual = compute(&data.bytes, data.algorithm);

    let declared = [Some(&data.checksum), descriptor.checksum.as_ref()];
    for expected in declared.into_iter().flatten() {
        if *expected != actual {
            return Err(DownloadError::ChecksumMismatch {
                index: descriptor.index,
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(checksum: Option<String>) -> BlockDescriptor {
        BlockDescriptor {
            index: 9,
            token: "token".to_string(),
            checksum,
        }
    }

    #[test]
    fn sha256_matches_known_digest() {
        // sha256("") = e3b0c442...
        assert_eq!(
            compute(b"", ChecksumAlgorithm::Sha256),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn verify_accepts_matching_block() {
        let bytes = vec![7u8; 64];
        let checksum = compute(&bytes, ChecksumAlgorithm::Sha256);
        let data = BlockData {
            bytes,
            checksum: checksum.clone(),
            algorithm: ChecksumAlgorithm::Sha256,
        };
        verify(&descriptor(Some(checksum)), &data).unwrap();
    }

    #[test]
    fn verify_rejects_corrupted_bytes() {
        let checksum = compute(&[1u8; 64], ChecksumAlgorithm::Sha256);
        let data = BlockData {
            bytes: vec![2u8; 64],
            checksum,
            algorithm: ChecksumAlgorithm::Sha256,
        };
        let err = verify(&descriptor(None), &data).unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch { index: 9, .. }));
    }

    #[test]
    fn verify_checks_listing_checksum_too() {
        let bytes = vec![3u8; 16];
        let data = BlockData {
            checksum: compute(&bytes, ChecksumAlgorithm::Sha256),
            bytes,
            algorithm: ChecksumAlgorithm::Sha256,
        };
        assert!(verify(&descriptor(Some("stale".to_string())), &data).is_err());
    }
}
