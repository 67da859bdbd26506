// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;

use snapvol_types::{Snapshot, Volume};

use crate::SourceError;

/// Control-plane operations needed to obtain a point-in-time copy of a volume.
#[async_trait]
pub trait SnapshotApi: Send + Sync {
    async fn describe_volume(&self, volume_id: &str) -> Result<Volume, SourceError>;

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
    ) -> Result<Snapshot, SourceError>;

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot, SourceError>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), SourceError>;

    /// Region the service operates in, recorded in image metadata
    fn region(&self) -> Option<String> {
        None
    }
}
