// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use snapvol_fetch::{DownloadError, ForceInUse, RefuseInUse, VolumeDownload};
use snapvol_testing::{BlockFault, MemoryVolumeStore};
use snapvol_types::VolumeState;

const BLOCK: u32 = 4096;

fn store() -> Arc<MemoryVolumeStore> {
    let store = Arc::new(MemoryVolumeStore::new(BLOCK).with_page_size(4));
    store.add_volume("vol-1", 16 * BLOCK as u64, VolumeState::Available);
    store
}

#[tokio::test]
async fn snapshot_is_deleted_after_success() {
    let store = store();
    store.set_pending_polls(2);
    let dir = TempDir::new().unwrap();

    let report = common::download(&store, "vol-1", &dir.path().join("vol.img"), 4, 0)
        .await
        .unwrap();

    assert_eq!(store.created_snapshots(), vec![report.snapshot_id.clone()]);
    assert_eq!(store.deleted_snapshots(), vec![report.snapshot_id]);
    assert!(store.live_snapshots().is_empty());
}

#[tokio::test]
async fn snapshot_is_deleted_after_fatal_block_failure() {
    let store = store();
    store.fail_block(9, BlockFault::Permanent);
    let dir = TempDir::new().unwrap();

    let err = common::download(&store, "vol-1", &dir.path().join("vol.img"), 4, 3)
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::BlockFetchError { index: 9, attempts: 1, .. }));
    assert_eq!(store.created_snapshots().len(), 1);
    assert_eq!(store.deleted_snapshots(), store.created_snapshots());
    assert!(store.live_snapshots().is_empty());
}

#[tokio::test]
async fn snapshot_is_deleted_after_cancellation() {
    let store = Arc::new(
        MemoryVolumeStore::new(BLOCK)
            .with_page_size(2)
            .with_fetch_delay(Duration::from_millis(20)),
    );
    store.add_volume("vol-1", 64 * BLOCK as u64, VolumeState::Available);
    let dir = TempDir::new().unwrap();
    let request = common::request(&store, "vol-1", &dir.path().join("vol.img"), 2, 0);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = VolumeDownload::new(store.clone(), store.clone())
        .run(&request, &ForceInUse, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::Cancelled));
    assert!(store.total_fetches() < 64);
    assert!(store.live_snapshots().is_empty());
}

#[tokio::test]
async fn deletion_failure_does_not_mask_the_result() {
    let store = store();
    store.set_delete_failure(true);
    let dir = TempDir::new().unwrap();

    let report = common::download(&store, "vol-1", &dir.path().join("vol.img"), 4, 0)
        .await
        .unwrap();

    assert_eq!(report.stats.blocks_written, 16);
    assert_eq!(store.deleted_snapshots(), vec![report.snapshot_id]);
}

#[tokio::test]
async fn readiness_timeout_still_deletes_the_snapshot() {
    let store = store();
    store.set_pending_polls(u32::MAX);
    let dir = TempDir::new().unwrap();
    let mut request = common::request(&store, "vol-1", &dir.path().join("vol.img"), 4, 0);
    request.readiness.timeout = Duration::from_millis(30);

    let err = common::download_with(&store, &request, &ForceInUse)
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::SnapshotTimeout { .. }));
    assert_eq!(store.deleted_snapshots().len(), 1);
    assert!(store.live_snapshots().is_empty());
    assert!(!dir.path().join("vol.img").exists());
}

#[tokio::test]
async fn failed_snapshot_is_deleted() {
    let store = store();
    store.set_snapshot_error(true);
    let dir = TempDir::new().unwrap();

    let err = common::download(&store, "vol-1", &dir.path().join("vol.img"), 4, 0)
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::SnapshotFailed(_)));
    assert!(store.live_snapshots().is_empty());
}

#[tokio::test]
async fn in_use_volume_is_refused_without_override() {
    let store = Arc::new(MemoryVolumeStore::new(BLOCK));
    store.add_volume("vol-busy", 4 * BLOCK as u64, VolumeState::InUse);
    let dir = TempDir::new().unwrap();
    let request = common::request(&store, "vol-busy", &dir.path().join("vol.img"), 2, 0);

    let err = common::download_with(&store, &request, &RefuseInUse)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::UserDeclined(_)));
    assert!(store.created_snapshots().is_empty());

    let report = common::download_with(&store, &request, &ForceInUse)
        .await
        .unwrap();
    assert!(report.captured_while_in_use);
    assert!(store.live_snapshots().is_empty());
}

#[tokio::test]
async fn missing_volume_is_reported() {
    let store = store();
    let dir = TempDir::new().unwrap();
    let err = common::download(&store, "vol-nope", &dir.path().join("vol.img"), 4, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::VolumeNotFound(ref id) if id == "vol-nope"));
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn adopted_snapshot_survives_the_download() {
    let store = store();
    store.add_existing_snapshot("snap-existing", "vol-1");
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("vol.img");
    let mut request = common::request(&store, "vol-1", &output, 4, 0);
    request.snapshot_id = Some("snap-existing".to_string());

    let report = common::download_with(&store, &request, &ForceInUse)
        .await
        .unwrap();

    assert_eq!(report.snapshot_id, "snap-existing");
    assert!(store.deleted_snapshots().is_empty());
    assert_eq!(store.live_snapshots(), vec!["snap-existing".to_string()]);
    assert_eq!(std::fs::read(&output).unwrap(), store.expected_image("vol-1"));
}
