// SPDX-License-Identifier: GPL-3.0-only
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use snapvol_fetch::{
    DownloadConfig, DownloadReport, DownloadRequest, ForceInUse, InUseGate, ReadinessPolicy,
    RetryPolicy, VolumeDownload,
};
use snapvol_testing::MemoryVolumeStore;
use snapvol_types::{PartitionEntry, PartitionTable, PartitionTableType};

pub fn request(
    store: &MemoryVolumeStore,
    volume_id: &str,
    output: &Path,
    concurrency: usize,
    max_retries: u32,
) -> DownloadRequest {
    let mut request = DownloadRequest::new(volume_id, output);
    request.block_size = store.block_size();
    request.download = DownloadConfig {
        concurrency,
        retry: RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
        },
    };
    request.readiness = ReadinessPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        timeout: Duration::from_secs(5),
    };
    request
}

pub async fn download_with(
    store: &Arc<MemoryVolumeStore>,
    request: &DownloadRequest,
    gate: &dyn InUseGate,
) -> snapvol_fetch::Result<DownloadReport> {
    VolumeDownload::new(store.clone(), store.clone())
        .run(request, gate, &CancellationToken::new())
        .await
}

pub async fn download(
    store: &Arc<MemoryVolumeStore>,
    volume_id: &str,
    output: &Path,
    concurrency: usize,
    max_retries: u32,
) -> snapvol_fetch::Result<DownloadReport> {
    let request = request(store, volume_id, output, concurrency, max_retries);
    download_with(store, &request, &ForceInUse).await
}

pub fn partition(index: u32, start_sector: u64, size_sectors: u64) -> PartitionEntry {
    PartitionEntry {
        index,
        start_sector,
        size_sectors,
        sector_size: 512,
        type_id: "0fc63daf-8483-4772-8e79-3d69d8477de4".to_string(),
        device: Some(format!("/dev/loop7p{index}")),
    }
}

pub fn gpt(entries: Vec<PartitionEntry>) -> PartitionTable {
    PartitionTable {
        table_type: Some(PartitionTableType::Gpt),
        sector_size: 512,
        entries,
    }
}

/// Small placeholder image file; the fake host never reads it.
pub fn image(dir: &Path) -> PathBuf {
    let path = dir.join("disk.img");
    std::fs::write(&path, vec![0u8; 4096]).unwrap();
    path
}
