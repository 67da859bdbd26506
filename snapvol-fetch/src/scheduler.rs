// SPDX-License-Identifier: GPL-3.0-only

//! Concurrent block download
//!
//! Listing and fetching are pipelined: descriptors are dispatched to workers
//! as soon as their page arrives, while at most `concurrency` fetches are in
//! flight. Each block is fetched, verified and written by a single worker; the
//! first unrecoverable failure stops dispatch and aborts the remaining workers.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snapvol_contracts::BlockSource;
use snapvol_sys::SparseImageWriter;
use snapvol_types::{BlockDescriptor, BlockPage, FetchResult};

use crate::checksum;
use crate::error::{DownloadError, Result};
use crate::progress::Progress;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadConfig {
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadStats {
    pub pages: u64,
    pub blocks_listed: u64,
    pub blocks_written: u64,
    pub bytes_written: u64,
    pub duplicates_skipped: u64,
    pub retries: u64,
}

pub struct Downloader {
    source: Arc<dyn BlockSource>,
    config: DownloadConfig,
    progress: Arc<Progress>,
}

struct BlockWorker {
    source: Arc<dyn BlockSource>,
    snapshot_id: String,
    writer: Arc<SparseImageWriter>,
    retry: RetryPolicy,
    progress: Arc<Progress>,
    retries: AtomicU64,
}

impl Downloader {
    pub fn new(source: Arc<dyn BlockSource>, config: DownloadConfig) -> Self {
        Self {
            source,
            config,
            progress: Arc::new(Progress::new()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Download every listed block of `snapshot_id` into `writer`.
    ///
    /// Returns once every listed block has been written. The writer is not
    /// finalized here.
    pub async fn download(
        &self,
        snapshot_id: &str,
        writer: Arc<SparseImageWriter>,
        cancel: &CancellationToken,
    ) -> Result<DownloadStats> {
        let concurrency = self.config.concurrency.max(1);
        let worker = Arc::new(BlockWorker {
            source: Arc::clone(&self.source),
            snapshot_id: snapshot_id.to_string(),
            writer: Arc::clone(&writer),
            retry: self.config.retry,
            progress: Arc::clone(&self.progress),
            retries: AtomicU64::new(0),
        });

        info!(snapshot = %snapshot_id, concurrency, "starting block download");

        let semaphore = Arc::new(Semaphore::new(concurrency));
        // Dropping the set on an early return aborts every worker still running.
        let mut set: JoinSet<Result<u64>> = JoinSet::new();
        let mut seen = HashSet::new();
        let mut stats = DownloadStats::default();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .list_page(snapshot_id, page_token.as_deref(), cancel)
                .await?;
            stats.pages += 1;

            if page.block_size != writer.block_size() {
                return Err(DownloadError::BlockSizeMismatch {
                    listed: page.block_size,
                    image: writer.block_size(),
                });
            }
            if let Some(size) = page.volume_size_bytes
                && size != writer.size_bytes()
            {
                warn!(
                    listed = size,
                    image = writer.size_bytes(),
                    "source reports a different volume size"
                );
            }

            debug!(
                page = stats.pages,
                blocks = page.blocks.len(),
                last = page.is_last(),
                "listed block page"
            );

            for descriptor in page.blocks {
                if !seen.insert(descriptor.index) {
                    warn!(block = descriptor.index, "skipping duplicate block descriptor");
                    stats.duplicates_skipped += 1;
                    continue;
                }
                stats.blocks_listed += 1;
                self.progress.add_discovered(1);

                let permit = acquire(&semaphore, cancel).await?;
                while let Some(joined) = set.try_join_next() {
                    record(&mut stats, joined)?;
                }

                let worker = Arc::clone(&worker);
                set.spawn(async move {
                    let _permit: OwnedSemaphorePermit = permit;
                    worker.run(descriptor).await
                });
            }

            match page.next_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        self.progress.mark_listing_complete();
        info!(blocks = stats.blocks_listed, pages = stats.pages, "block listing complete");

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                joined = set.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            record(&mut stats, joined)?;
        }

        stats.retries = worker.retries.load(Ordering::Relaxed);
        info!(
            blocks = stats.blocks_written,
            bytes = stats.bytes_written,
            retries = stats.retries,
            "block download complete"
        );
        Ok(stats)
    }

    async fn list_page(
        &self,
        snapshot_id: &str,
        page_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BlockPage> {
        let retry = self.config.retry;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let listed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                listed = self.source.list_blocks(snapshot_id, page_token) => listed,
            };
            match listed {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && retry.allows_retry(attempts) => {
                    let delay = retry.delay_for(attempts);
                    warn!(attempt = attempts, ?delay, "block listing failed, retrying: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(DownloadError::Source(e)),
            }
        }
    }
}

impl BlockWorker {
    async fn run(self: Arc<Self>, descriptor: BlockDescriptor) -> Result<u64> {
        let fetched = self.fetch(&descriptor).await?;
        let len = fetched.bytes.len() as u64;

        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || writer.write_block(fetched.index, &fetched.bytes))
            .await
            .map_err(|e| DownloadError::Worker(e.to_string()))??;

        self.progress.complete_block(len);
        Ok(len)
    }

    async fn fetch(&self, descriptor: &BlockDescriptor) -> Result<FetchResult> {
        let index = descriptor.index;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let outcome = match self
                .source
                .get_block(&self.snapshot_id, index, &descriptor.token)
                .await
            {
                Ok(data) => checksum::verify(descriptor, &data).map(|()| data.bytes),
                Err(e) => Err(DownloadError::Source(e)),
            };

            match outcome {
                Ok(bytes) => {
                    return Ok(FetchResult {
                        index,
                        bytes,
                        checksum_verified: true,
                    });
                }
                Err(e) if e.is_retryable() && self.retry.allows_retry(attempts) => {
                    let delay = self.retry.delay_for(attempts);
                    debug!(block = index, attempt = attempts, ?delay, "retrying block: {e}");
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(DownloadError::BlockFetchError {
                        index,
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

async fn acquire(semaphore: &Arc<Semaphore>, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        permit = Arc::clone(semaphore).acquire_owned() => {
            permit.map_err(|e| DownloadError::Worker(format!("download semaphore closed: {e}")))
        }
    }
}

fn record(
    stats: &mut DownloadStats,
    joined: std::result::Result<Result<u64>, JoinError>,
) -> Result<()> {
    let bytes = joined.map_err(|e| DownloadError::Worker(e.to_string()))??;
    stats.blocks_written += 1;
    stats.bytes_written += bytes;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use snapvol_contracts::{SourceError, SourceErrorKind};
    use snapvol_sys::Allocation;
    use snapvol_types::{BlockData, ChecksumAlgorithm};
    use tempfile::TempDir;

    use super::*;

    const BLOCK: u32 = 4096;

    /// In-memory source with per-block failure scripts
    struct FakeSource {
        blocks: Vec<(u64, Vec<u8>)>,
        page_size: usize,
        failures: Mutex<HashMap<u64, Vec<Fault>>>,
        calls: Mutex<HashMap<u64, u32>>,
        duplicate_first: bool,
    }

    #[derive(Clone, Copy)]
    enum Fault {
        Transient,
        Permanent,
        Corrupt,
    }

    impl FakeSource {
        fn new(indices: &[u64]) -> Self {
            let blocks = indices
                .iter()
                .map(|&i| (i, vec![(i % 251) as u8 + 1; BLOCK as usize]))
                .collect();
            Self {
                blocks,
                page_size: 3,
                failures: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                duplicate_first: false,
            }
        }

        fn fail(self, index: u64, faults: &[Fault]) -> Self {
            self.failures.lock().unwrap().insert(index, faults.to_vec());
            self
        }

        fn calls(&self, index: u64) -> u32 {
            self.calls.lock().unwrap().get(&index).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl BlockSource for FakeSource {
        async fn list_blocks(
            &self,
            _snapshot_id: &str,
            page_token: Option<&str>,
        ) -> std::result::Result<BlockPage, SourceError> {
            let start: usize = page_token.map_or(0, |t| t.parse().unwrap());
            let end = (start + self.page_size).min(self.blocks.len());
            let mut blocks: Vec<BlockDescriptor> = self.blocks[start..end]
                .iter()
                .map(|(index, _)| BlockDescriptor {
                    index: *index,
                    token: format!("t{index}"),
                    checksum: None,
                })
                .collect();
            if self.duplicate_first && start == 0 && !blocks.is_empty() {
                blocks.push(blocks[0].clone());
            }
            Ok(BlockPage {
                blocks,
                next_token: (end < self.blocks.len()).then(|| end.to_string()),
                block_size: BLOCK,
                volume_size_bytes: None,
            })
        }

        async fn get_block(
            &self,
            _snapshot_id: &str,
            index: u64,
            token: &str,
        ) -> std::result::Result<BlockData, SourceError> {
            assert_eq!(token, format!("t{index}"));
            *self.calls.lock().unwrap().entry(index).or_default() += 1;

            let bytes = self
                .blocks
                .iter()
                .find(|(i, _)| *i == index)
                .map(|(_, b)| b.clone())
                .ok_or_else(|| SourceError::not_found(format!("block {index}")))?;
            let checksum = checksum::compute(&bytes, ChecksumAlgorithm::Sha256);

            let fault = {
                let mut failures = self.failures.lock().unwrap();
                failures
                    .get_mut(&index)
                    .and_then(|f| (!f.is_empty()).then(|| f.remove(0)))
            };
            match fault {
                Some(Fault::Transient) => Err(SourceError::new(SourceErrorKind::Throttled, "slow down")),
                Some(Fault::Permanent) => {
                    Err(SourceError::new(SourceErrorKind::PermissionDenied, "denied"))
                }
                Some(Fault::Corrupt) => Ok(BlockData {
                    bytes: vec![0xFF; bytes.len()],
                    checksum,
                    algorithm: ChecksumAlgorithm::Sha256,
                }),
                None => Ok(BlockData {
                    bytes,
                    checksum,
                    algorithm: ChecksumAlgorithm::Sha256,
                }),
            }
        }
    }

    fn config(concurrency: usize, max_retries: u32) -> DownloadConfig {
        DownloadConfig {
            concurrency,
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
        }
    }

    fn writer(dir: &TempDir, blocks: u64) -> Arc<SparseImageWriter> {
        let path = dir.path().join("disk.img");
        Arc::new(
            SparseImageWriter::open(&path, blocks * BLOCK as u64, BLOCK, Allocation::Sparse)
                .unwrap(),
        )
    }

    fn read_image(writer: &SparseImageWriter) -> Vec<u8> {
        std::fs::read(writer.path()).unwrap()
    }

    #[tokio::test]
    async fn writes_every_listed_block_at_its_offset() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new(&[0, 2, 3, 7, 8, 9, 11]));
        let writer = writer(&dir, 12);
        let downloader = Downloader::new(source, config(4, 0));

        let stats = downloader
            .download("snap-1", Arc::clone(&writer), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.blocks_listed, 7);
        assert_eq!(stats.blocks_written, 7);
        assert_eq!(stats.bytes_written, 7 * BLOCK as u64);

        let image = read_image(&writer);
        let block = |i: usize| &image[i * BLOCK as usize..(i + 1) * BLOCK as usize];
        assert!(block(1).iter().all(|&b| b == 0));
        assert!(block(7).iter().all(|&b| b == 8));
        assert!(block(11).iter().all(|&b| b == 12));

        let progress = downloader.progress().snapshot();
        assert!(progress.total_known);
        assert_eq!(progress.completed, 7);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(
            FakeSource::new(&[0, 1, 2]).fail(1, &[Fault::Transient, Fault::Corrupt]),
        );
        let writer = writer(&dir, 3);
        let stats = Downloader::new(Arc::clone(&source) as Arc<dyn BlockSource>, config(2, 3))
            .download("snap-1", Arc::clone(&writer), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.retries, 2);
        assert_eq!(source.calls(1), 3);
        assert_eq!(writer.blocks_written(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_download() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new(&[0, 1]).fail(
            0,
            &[Fault::Transient, Fault::Transient, Fault::Transient],
        ));
        let err = Downloader::new(Arc::clone(&source) as Arc<dyn BlockSource>, config(1, 2))
            .download("snap-1", writer(&dir, 2), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DownloadError::BlockFetchError {
                index: 0,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(source.calls(0), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new(&[0]).fail(0, &[Fault::Permanent]));
        let err = Downloader::new(Arc::clone(&source) as Arc<dyn BlockSource>, config(1, 5))
            .download("snap-1", writer(&dir, 1), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::BlockFetchError { attempts: 1, .. }));
        assert_eq!(source.calls(0), 1);
    }

    #[tokio::test]
    async fn persistent_corruption_exhausts_into_block_fetch_error() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new(&[0]).fail(0, &[Fault::Corrupt, Fault::Corrupt]));
        let err = Downloader::new(Arc::clone(&source) as Arc<dyn BlockSource>, config(1, 1))
            .download("snap-1", writer(&dir, 1), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DownloadError::BlockFetchError { index, attempts, reason } => {
                assert_eq!(index, 0);
                assert_eq!(attempts, 2);
                assert!(reason.starts_with("Checksum mismatch for block 0"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(source.calls(0), 2);
    }

    #[tokio::test]
    async fn duplicate_descriptors_are_fetched_once() {
        let dir = TempDir::new().unwrap();
        let mut source = FakeSource::new(&[0, 1]);
        source.duplicate_first = true;
        let source = Arc::new(source);
        let stats = Downloader::new(Arc::clone(&source) as Arc<dyn BlockSource>, config(2, 0))
            .download("snap-1", writer(&dir, 2), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.duplicates_skipped, 1);
        assert_eq!(stats.blocks_written, 2);
        assert_eq!(source.calls(0), 1);
    }

    #[tokio::test]
    async fn mismatched_block_size_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.img");
        let writer = Arc::new(
            SparseImageWriter::open(&path, 4 * BLOCK as u64, BLOCK * 2, Allocation::Sparse)
                .unwrap(),
        );
        let err = Downloader::new(Arc::new(FakeSource::new(&[0])), config(1, 0))
            .download("snap-1", writer, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::BlockSizeMismatch { .. }));
    }

    #[tokio::test]
    async fn cancelled_token_stops_download() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Downloader::new(Arc::new(FakeSource::new(&[0, 1, 2])), config(1, 0))
            .download("snap-1", writer(&dir, 3), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
    }
}
