// SPDX-License-Identifier: GPL-3.0-only

//! Block feed records
//!
//! A snapshot is exposed as a paginated feed of `BlockDescriptor`s. Each
//! descriptor carries the opaque token needed to fetch the block bytes.

use serde::{Deserialize, Serialize};

/// Checksum algorithm advertised by a block source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChecksumAlgorithm {
    /// SHA-256 digest, base64 encoded
    #[default]
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
        }
    }
}

/// One entry of a block listing page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    /// Ordinal position of the block in the volume
    pub index: u64,

    /// Opaque token required to fetch the block
    pub token: String,

    /// Checksum declared by the listing, when the source provides one
    pub checksum: Option<String>,
}

impl BlockDescriptor {
    /// Byte offset of this block in the image
    pub fn offset(&self, block_size: u32) -> u64 {
        self.index * u64::from(block_size)
    }
}

/// One page of a block listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPage {
    pub blocks: Vec<BlockDescriptor>,

    /// Token for the next page; `None` when the listing is exhausted
    pub next_token: Option<String>,

    /// Nominal block size in bytes
    pub block_size: u32,

    /// Logical size of the snapshot's volume, if advertised
    pub volume_size_bytes: Option<u64>,
}

impl BlockPage {
    pub fn is_last(&self) -> bool {
        self.next_token.is_none()
    }
}

/// Bytes of a single block as returned by the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub bytes: Vec<u8>,

    /// Checksum of `bytes` as computed by the source
    pub checksum: String,

    pub algorithm: ChecksumAlgorithm,
}

/// A block that was fetched and checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub index: u64,
    pub bytes: Vec<u8>,
    pub checksum_verified: bool,
}
