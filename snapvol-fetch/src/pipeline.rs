// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end volume download: snapshot, fetch, finalize, describe.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use snapvol_contracts::{BlockSource, SnapshotApi};
use snapvol_sys::{Allocation, ImageSummary, SparseImageWriter};
use snapvol_types::{DEFAULT_BLOCK_SIZE, ImageMetadata, Volume};

use crate::error::{DownloadError, Result};
use crate::lifecycle::{InUseGate, ReadinessPolicy, SnapshotInfo, SnapshotLifecycle};
use crate::metadata;
use crate::progress::Progress;
use crate::scheduler::{DownloadConfig, DownloadStats, Downloader};

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub volume_id: String,
    pub output: PathBuf,
    /// Download this existing snapshot instead of creating one
    pub snapshot_id: Option<String>,
    pub block_size: u32,
    pub allocation: Allocation,
    pub download: DownloadConfig,
    pub readiness: ReadinessPolicy,
}

impl DownloadRequest {
    pub fn new(volume_id: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            volume_id: volume_id.into(),
            output: output.into(),
            snapshot_id: None,
            block_size: DEFAULT_BLOCK_SIZE,
            allocation: Allocation::Sparse,
            download: DownloadConfig::default(),
            readiness: ReadinessPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub volume: Volume,
    pub snapshot_id: String,
    pub captured_while_in_use: bool,
    pub image: ImageSummary,
    pub stats: DownloadStats,
    pub metadata_path: Option<PathBuf>,
}

pub struct VolumeDownload {
    api: Arc<dyn SnapshotApi>,
    source: Arc<dyn BlockSource>,
    progress: Arc<Progress>,
}

impl VolumeDownload {
    pub fn new(api: Arc<dyn SnapshotApi>, source: Arc<dyn BlockSource>) -> Self {
        Self {
            api,
            source,
            progress: Arc::new(Progress::new()),
        }
    }

    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Reconstruct `request.volume_id` into `request.output`.
    ///
    /// A snapshot created here is deleted before returning, on success and on
    /// every failure after its creation.
    pub async fn run(
        &self,
        request: &DownloadRequest,
        gate: &dyn InUseGate,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport> {
        let lifecycle = SnapshotLifecycle::new(Arc::clone(&self.api), request.readiness);
        let handle = match &request.snapshot_id {
            Some(id) => lifecycle.adopt(id, cancel).await?,
            None => lifecycle.acquire(&request.volume_id, gate, cancel).await?,
        };
        if handle.volume().id != request.volume_id {
            warn!(
                requested = %request.volume_id,
                snapshot_volume = %handle.volume().id,
                "snapshot belongs to a different volume"
            );
        }

        let outcome = self.transfer(request, handle.info(), cancel).await;
        if let Err(e) = &outcome {
            warn!(output = %request.output.display(), "download failed: {e}");
        }
        lifecycle.release(handle).await;
        outcome
    }

    async fn transfer(
        &self,
        request: &DownloadRequest,
        info: &SnapshotInfo,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport> {
        let volume = &info.volume;
        let output = request.output.clone();
        let (size, block_size, allocation) =
            (volume.size_bytes, request.block_size, request.allocation);
        let writer = tokio::task::spawn_blocking(move || {
            SparseImageWriter::open(&output, size, block_size, allocation)
        })
        .await
        .map_err(|e| DownloadError::Worker(e.to_string()))??;
        let writer = Arc::new(writer);
        info!(
            output = %request.output.display(),
            size,
            block_size,
            "allocated image"
        );

        let stats = Downloader::new(Arc::clone(&self.source), request.download)
            .with_progress(Arc::clone(&self.progress))
            .download(&info.snapshot.id, Arc::clone(&writer), cancel)
            .await?;

        let writer = Arc::try_unwrap(writer)
            .map_err(|_| DownloadError::Worker("image writer still in use".to_string()))?;
        let expected = stats.blocks_listed;
        let image = tokio::task::spawn_blocking(move || writer.finalize(expected))
            .await
            .map_err(|e| DownloadError::Worker(e.to_string()))??;

        let metadata = ImageMetadata {
            volume_id: volume.id.clone(),
            volume_name: volume.name.clone(),
            snapshot_id: info.snapshot.id.clone(),
            size_bytes: volume.size_bytes,
            block_size: request.block_size,
            block_count: stats.blocks_written,
            region: self.api.region(),
            created_at: Utc::now(),
        };
        let metadata_path = metadata::emit(&request.output, &metadata);

        Ok(DownloadReport {
            volume: volume.clone(),
            snapshot_id: info.snapshot.id.clone(),
            captured_while_in_use: info.captured_while_in_use,
            image,
            stats,
            metadata_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::lifecycle::ForceInUse;
    use crate::local::{LocalStore, VolumeRecord};
    use snapvol_types::VolumeState;

    #[tokio::test]
    async fn downloads_local_volume_and_releases_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut data = vec![0u8; 64 * 1024];
        data[..4096].fill(0xAB);
        data[40 * 1024..44 * 1024].fill(0x5A);
        let source = dir.path().join("source.img");
        std::fs::write(&source, &data).unwrap();

        let store = Arc::new(
            LocalStore::new(dir.path().join("store"))
                .with_block_size(4096)
                .with_region(Some("local".to_string())),
        );
        store
            .import_volume(
                "vol-1",
                &VolumeRecord {
                    name: Some("data".to_string()),
                    state: VolumeState::Available,
                    attached_instance: None,
                },
                &source,
            )
            .await
            .unwrap();

        let output = dir.path().join("out.img");
        let mut request = DownloadRequest::new("vol-1", &output);
        request.block_size = 4096;
        let download = VolumeDownload::new(store.clone(), store.clone());
        let report = download
            .run(&request, &ForceInUse, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), data);
        assert_eq!(report.stats.blocks_written, 2);
        assert_eq!(report.image.size_bytes, 64 * 1024);

        let metadata = crate::metadata::read_sidecar(&output).unwrap();
        assert_eq!(metadata.snapshot_id, report.snapshot_id);
        assert_eq!(metadata.region.as_deref(), Some("local"));

        let leftover: Vec<_> = std::fs::read_dir(dir.path().join("store/snapshots"))
            .unwrap()
            .collect();
        assert!(leftover.is_empty());
    }
}
