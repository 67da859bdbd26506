// SPDX-License-Identifier: GPL-3.0-only

//! In-memory snapshot service with scripted faults
//!
//! Block contents are generated from the volume id and block index, so tests
//! can compare a downloaded image against [`MemoryVolumeStore::expected_block`]
//! without holding the whole volume in memory.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use snapvol_contracts::{BlockSource, SnapshotApi, SourceError, SourceErrorKind};
use snapvol_fetch::checksum;
use snapvol_types::{
    BlockData, BlockDescriptor, BlockPage, ChecksumAlgorithm, LIST_PAGE_SIZE, Snapshot,
    SnapshotState, Volume, VolumeState,
};

/// Failure injected into fetches of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFault {
    /// The first `attempts` fetches fail with a throttling error
    Transient { attempts: u32 },
    /// The first `attempts` fetches return bytes that do not match their checksum
    Corrupt { attempts: u32 },
    /// Every fetch fails with a non-retryable error
    Permanent,
}

#[derive(Debug, Clone, Copy)]
enum Attempt {
    Throttle,
    Corrupt,
}

#[derive(Debug, Clone)]
struct StoredVolume {
    volume: Volume,
    populated: BTreeSet<u64>,
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    volume_id: String,
    populated: BTreeSet<u64>,
    size_bytes: u64,
    polls: u32,
}

#[derive(Debug, Default)]
struct Inner {
    volumes: HashMap<String, StoredVolume>,
    snapshots: HashMap<String, StoredSnapshot>,
    next_snapshot: u64,
    attempts: HashMap<u64, VecDeque<Attempt>>,
    permanent: BTreeSet<u64>,
    listing_failures: u32,
    pending_polls: u32,
    snapshot_error: bool,
    delete_fails: bool,
    created: Vec<String>,
    deleted: Vec<String>,
    fetches: HashMap<u64, u32>,
}

pub struct MemoryVolumeStore {
    block_size: u32,
    page_size: usize,
    fetch_delay: Option<Duration>,
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

type SourceResult<T> = std::result::Result<T, SourceError>;

impl MemoryVolumeStore {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            page_size: LIST_PAGE_SIZE,
            fetch_delay: None,
            inner: Mutex::new(Inner::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Hold every fetch for `delay`, making concurrency observable.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a volume whose every block holds data.
    pub fn add_volume(&self, id: &str, size_bytes: u64, state: VolumeState) {
        let blocks = size_bytes.div_ceil(self.block_size as u64);
        self.add_sparse_volume(id, size_bytes, state, 0..blocks);
    }

    /// Add a volume where only `populated` blocks hold data.
    pub fn add_sparse_volume(
        &self,
        id: &str,
        size_bytes: u64,
        state: VolumeState,
        populated: impl IntoIterator<Item = u64>,
    ) {
        let blocks = size_bytes.div_ceil(self.block_size as u64);
        let volume = Volume {
            id: id.to_string(),
            name: Some(format!("{id}-name")),
            size_bytes,
            state,
            attached_instance: (state == VolumeState::InUse).then(|| "i-0123456789".to_string()),
        };
        let populated = populated.into_iter().filter(|i| *i < blocks).collect();
        self.lock()
            .volumes
            .insert(id.to_string(), StoredVolume { volume, populated });
    }

    pub fn fail_block(&self, index: u64, fault: BlockFault) {
        let mut inner = self.lock();
        match fault {
            BlockFault::Transient { attempts } => inner
                .attempts
                .entry(index)
                .or_default()
                .extend((0..attempts).map(|_| Attempt::Throttle)),
            BlockFault::Corrupt { attempts } => inner
                .attempts
                .entry(index)
                .or_default()
                .extend((0..attempts).map(|_| Attempt::Corrupt)),
            BlockFault::Permanent => {
                inner.permanent.insert(index);
            }
        }
    }

    /// The next `count` listing calls fail transiently.
    pub fn fail_listing(&self, count: u32) {
        self.lock().listing_failures = count;
    }

    /// Snapshots stay pending for `polls` describe calls.
    pub fn set_pending_polls(&self, polls: u32) {
        self.lock().pending_polls = polls;
    }

    pub fn set_snapshot_error(&self, error: bool) {
        self.lock().snapshot_error = error;
    }

    pub fn set_delete_failure(&self, fails: bool) {
        self.lock().delete_fails = fails;
    }

    /// Register a completed snapshot that was not created by the download.
    pub fn add_existing_snapshot(&self, snapshot_id: &str, volume_id: &str) {
        let mut inner = self.lock();
        let Some(stored) = inner.volumes.get(volume_id).cloned() else {
            return;
        };
        inner.snapshots.insert(
            snapshot_id.to_string(),
            StoredSnapshot {
                volume_id: volume_id.to_string(),
                populated: stored.populated,
                size_bytes: stored.volume.size_bytes,
                polls: u32::MAX,
            },
        );
    }

    pub fn created_snapshots(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    pub fn deleted_snapshots(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    pub fn live_snapshots(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().snapshots.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn fetch_attempts(&self, index: u64) -> u32 {
        self.lock().fetches.get(&index).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u32 {
        self.lock().fetches.values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Bytes the source serves for `index` of `volume_id`; zeros for blocks
    /// without data.
    pub fn expected_block(&self, volume_id: &str, index: u64) -> Vec<u8> {
        let inner = self.lock();
        let Some(stored) = inner.volumes.get(volume_id) else {
            return Vec::new();
        };
        let len = block_len(stored.volume.size_bytes, self.block_size, index);
        if stored.populated.contains(&index) {
            block_bytes(volume_id, index, len)
        } else {
            vec![0; len]
        }
    }

    /// Whole expected image; only sensible for small volumes.
    pub fn expected_image(&self, volume_id: &str) -> Vec<u8> {
        let size = self
            .lock()
            .volumes
            .get(volume_id)
            .map_or(0, |v| v.volume.size_bytes);
        let blocks = size.div_ceil(self.block_size as u64);
        (0..blocks)
            .flat_map(|i| self.expected_block(volume_id, i))
            .collect()
    }
}

/// Deterministic, non-zero content for one block
pub fn block_bytes(volume_id: &str, index: u64, len: usize) -> Vec<u8> {
    // FNV-1a of the volume id seeds a xorshift stream per block
    let mut state = volume_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
            (h ^ b as u64).wrapping_mul(0x100_0000_01b3)
        })
        ^ index.wrapping_mul(0x9e37_79b9_7f4a_7c15)
        | 1;

    let mut bytes = Vec::with_capacity(len);
    while bytes.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        bytes.extend_from_slice(&state.to_le_bytes());
    }
    bytes.truncate(len);
    if let Some(first) = bytes.first_mut() {
        *first |= 1;
    }
    bytes
}

fn block_len(size_bytes: u64, block_size: u32, index: u64) -> usize {
    let offset = index * block_size as u64;
    size_bytes.saturating_sub(offset).min(block_size as u64) as usize
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotApi for MemoryVolumeStore {
    async fn describe_volume(&self, volume_id: &str) -> SourceResult<Volume> {
        self.lock()
            .volumes
            .get(volume_id)
            .map(|stored| stored.volume.clone())
            .ok_or_else(|| SourceError::not_found(format!("volume {volume_id} does not exist")))
    }

    async fn create_snapshot(&self, volume_id: &str, _description: &str) -> SourceResult<Snapshot> {
        let mut inner = self.lock();
        let stored = inner
            .volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| SourceError::not_found(format!("volume {volume_id} does not exist")))?;

        inner.next_snapshot += 1;
        let id = format!("snap-{:017x}", inner.next_snapshot);
        inner.snapshots.insert(
            id.clone(),
            StoredSnapshot {
                volume_id: volume_id.to_string(),
                populated: stored.populated,
                size_bytes: stored.volume.size_bytes,
                polls: 0,
            },
        );
        inner.created.push(id.clone());

        Ok(Snapshot {
            id,
            volume_id: volume_id.to_string(),
            state: SnapshotState::Pending,
            ephemeral: true,
        })
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> SourceResult<Snapshot> {
        let mut inner = self.lock();
        let pending_polls = inner.pending_polls;
        let snapshot_error = inner.snapshot_error;
        let stored = inner
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| SourceError::not_found(format!("snapshot {snapshot_id} does not exist")))?;
        stored.polls = stored.polls.saturating_add(1);

        let state = if snapshot_error {
            SnapshotState::Error
        } else if stored.polls > pending_polls {
            SnapshotState::Completed
        } else {
            SnapshotState::Pending
        };
        Ok(Snapshot {
            id: snapshot_id.to_string(),
            volume_id: stored.volume_id.clone(),
            state,
            ephemeral: false,
        })
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> SourceResult<()> {
        let mut inner = self.lock();
        inner.deleted.push(snapshot_id.to_string());
        if inner.delete_fails {
            return Err(SourceError::new(SourceErrorKind::Unavailable, "delete rejected"));
        }
        inner
            .snapshots
            .remove(snapshot_id)
            .map(|_| ())
            .ok_or_else(|| SourceError::not_found(format!("snapshot {snapshot_id} does not exist")))
    }

    fn region(&self) -> Option<String> {
        Some("memory-1".to_string())
    }
}

#[async_trait]
impl BlockSource for MemoryVolumeStore {
    async fn list_blocks(
        &self,
        snapshot_id: &str,
        page_token: Option<&str>,
    ) -> SourceResult<BlockPage> {
        let mut inner = self.lock();
        if inner.listing_failures > 0 {
            inner.listing_failures -= 1;
            return Err(SourceError::new(SourceErrorKind::Unavailable, "listing unavailable"));
        }
        let snapshot = inner
            .snapshots
            .get(snapshot_id)
            .ok_or_else(|| SourceError::not_found(format!("snapshot {snapshot_id} does not exist")))?;

        let start = match page_token {
            Some(token) => token.parse::<u64>().map_err(|_| {
                SourceError::new(SourceErrorKind::InvalidInput, format!("bad token {token}"))
            })?,
            None => 0,
        };
        let mut page: Vec<u64> = snapshot
            .populated
            .range(start..)
            .take(self.page_size + 1)
            .copied()
            .collect();
        let next_token = (page.len() > self.page_size).then(|| {
            let next = page[self.page_size];
            page.truncate(self.page_size);
            next.to_string()
        });

        let blocks = page
            .into_iter()
            .map(|index| BlockDescriptor {
                index,
                token: format!("{snapshot_id}/{index}"),
                checksum: None,
            })
            .collect();
        Ok(BlockPage {
            blocks,
            next_token,
            block_size: self.block_size,
            volume_size_bytes: Some(snapshot.size_bytes),
        })
    }

    async fn get_block(&self, snapshot_id: &str, index: u64, token: &str) -> SourceResult<BlockData> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }

        let (volume_id, len, attempt, permanent) = {
            let mut inner = self.lock();
            *inner.fetches.entry(index).or_default() += 1;
            if token != format!("{snapshot_id}/{index}") {
                return Err(SourceError::new(SourceErrorKind::InvalidInput, "token mismatch"));
            }
            let snapshot = inner.snapshots.get(snapshot_id).ok_or_else(|| {
                SourceError::not_found(format!("snapshot {snapshot_id} does not exist"))
            })?;
            if !snapshot.populated.contains(&index) {
                return Err(SourceError::not_found(format!("block {index} is not listed")));
            }
            let volume_id = snapshot.volume_id.clone();
            let len = block_len(snapshot.size_bytes, self.block_size, index);
            let attempt = inner.attempts.get_mut(&index).and_then(VecDeque::pop_front);
            (volume_id, len, attempt, inner.permanent.contains(&index))
        };

        if permanent {
            debug!(index, "injecting permanent fetch failure");
            return Err(SourceError::new(SourceErrorKind::PermissionDenied, "block access denied"));
        }

        let bytes = block_bytes(&volume_id, index, len);
        let checksum = checksum::compute(&bytes, ChecksumAlgorithm::Sha256);
        match attempt {
            Some(Attempt::Throttle) => {
                debug!(index, "injecting throttled fetch");
                Err(SourceError::new(SourceErrorKind::Throttled, "rate exceeded"))
            }
            Some(Attempt::Corrupt) => {
                debug!(index, "injecting corrupted block");
                let mut corrupted = bytes;
                corrupted[0] ^= 0xFF;
                Ok(BlockData {
                    bytes: corrupted,
                    checksum,
                    algorithm: ChecksumAlgorithm::Sha256,
                })
            }
            None => Ok(BlockData {
                bytes,
                checksum,
                algorithm: ChecksumAlgorithm::Sha256,
            }),
        }
    }
}
