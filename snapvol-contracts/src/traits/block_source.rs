// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;

use snapvol_types::{BlockData, BlockPage};

use crate::SourceError;

/// Paginated, checksum-bearing block feed of a snapshot.
///
/// Implementations must be safe to call concurrently; every `get_block` call is
/// independent and may be repeated.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// List one page of block descriptors. `page_token` is `None` for the first page.
    async fn list_blocks(
        &self,
        snapshot_id: &str,
        page_token: Option<&str>,
    ) -> Result<BlockPage, SourceError>;

    /// Fetch the bytes of one block together with the source's checksum.
    async fn get_block(
        &self,
        snapshot_id: &str,
        index: u64,
        token: &str,
    ) -> Result<BlockData, SourceError>;
}
