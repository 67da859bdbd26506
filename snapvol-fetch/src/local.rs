// SPDX-License-Identifier: GPL-3.0-only

//! Directory-backed snapshot service
//!
//! Layout under the store root:
//!
//! ```text
//! volumes/<volume-id>.json     volume record
//! volumes/<volume-id>.img      raw volume contents
//! snapshots/<snapshot-id>.json snapshot record
//! snapshots/<snapshot-id>.img  frozen copy of the volume
//! ```
//!
//! Listing reports only blocks that contain data, the way a remote block API
//! omits never-written regions.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use snapvol_contracts::{BlockSource, SnapshotApi, SourceError, SourceErrorKind};
use snapvol_types::{
    BlockData, BlockDescriptor, BlockPage, ChecksumAlgorithm, DEFAULT_BLOCK_SIZE, LIST_PAGE_SIZE,
    Snapshot, SnapshotState, Volume, VolumeState,
};

use crate::checksum;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "available")]
    pub state: VolumeState,
    #[serde(default)]
    pub attached_instance: Option<String>,
}

fn available() -> VolumeState {
    VolumeState::Available
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotRecord {
    volume_id: String,
    state: SnapshotState,
    description: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    block_size: u32,
    page_size: usize,
    region: Option<String>,
}

type SourceResult<T> = std::result::Result<T, SourceError>;

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            page_size: LIST_PAGE_SIZE,
            region: None,
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a volume whose contents are copied from `image`.
    pub async fn import_volume(
        &self,
        volume_id: &str,
        record: &VolumeRecord,
        image: &Path,
    ) -> SourceResult<()> {
        let (json, img) = self.volume_paths(volume_id)?;
        tokio::fs::create_dir_all(self.root.join("volumes")).await?;
        tokio::fs::copy(image, &img).await?;
        write_json(&json, record).await
    }

    fn volume_paths(&self, volume_id: &str) -> SourceResult<(PathBuf, PathBuf)> {
        check_id(volume_id)?;
        let dir = self.root.join("volumes");
        Ok((
            dir.join(format!("{volume_id}.json")),
            dir.join(format!("{volume_id}.img")),
        ))
    }

    fn snapshot_paths(&self, snapshot_id: &str) -> SourceResult<(PathBuf, PathBuf)> {
        check_id(snapshot_id)?;
        let dir = self.root.join("snapshots");
        Ok((
            dir.join(format!("{snapshot_id}.json")),
            dir.join(format!("{snapshot_id}.img")),
        ))
    }

    async fn snapshot_record(&self, snapshot_id: &str) -> SourceResult<SnapshotRecord> {
        let (json, _) = self.snapshot_paths(snapshot_id)?;
        read_json(&json)
            .await
            .map_err(|e| missing(e.into(), format!("snapshot {snapshot_id} does not exist")))
    }
}

#[async_trait]
impl SnapshotApi for LocalStore {
    async fn describe_volume(&self, volume_id: &str) -> SourceResult<Volume> {
        let (json, img) = self.volume_paths(volume_id)?;
        let record: VolumeRecord = read_json(&json)
            .await
            .map_err(|e| missing(e, format!("volume {volume_id} does not exist")))?;
        let size_bytes = tokio::fs::metadata(&img).await?.len();

        Ok(Volume {
            id: volume_id.to_string(),
            name: record.name,
            size_bytes,
            state: record.state,
            attached_instance: record.attached_instance,
        })
    }

    async fn create_snapshot(&self, volume_id: &str, description: &str) -> SourceResult<Snapshot> {
        let (_, volume_img) = self.volume_paths(volume_id)?;
        if !tokio::fs::try_exists(&volume_img).await? {
            return Err(SourceError::not_found(format!(
                "volume {volume_id} does not exist"
            )));
        }

        let simple = Uuid::new_v4().simple().to_string();
        let snapshot_id = format!("snap-{}", &simple[..17]);
        let (json, img) = self.snapshot_paths(&snapshot_id)?;

        tokio::fs::create_dir_all(self.root.join("snapshots")).await?;
        tokio::fs::copy(&volume_img, &img).await?;
        let record = SnapshotRecord {
            volume_id: volume_id.to_string(),
            state: SnapshotState::Completed,
            description: description.to_string(),
            created_at: Utc::now(),
        };
        write_json(&json, &record).await?;
        debug!(snapshot = %snapshot_id, volume = %volume_id, "copied volume into snapshot");

        Ok(Snapshot {
            id: snapshot_id,
            volume_id: volume_id.to_string(),
            state: record.state,
            ephemeral: true,
        })
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> SourceResult<Snapshot> {
        let record = self.snapshot_record(snapshot_id).await?;
        Ok(Snapshot {
            id: snapshot_id.to_string(),
            volume_id: record.volume_id,
            state: record.state,
            ephemeral: false,
        })
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> SourceResult<()> {
        let (json, img) = self.snapshot_paths(snapshot_id)?;
        tokio::fs::remove_file(&json)
            .await
            .map_err(|e| missing(e.into(), format!("snapshot {snapshot_id} does not exist")))?;
        match tokio::fs::remove_file(&img).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn region(&self) -> Option<String> {
        self.region.clone()
    }
}

#[async_trait]
impl BlockSource for LocalStore {
    async fn list_blocks(
        &self,
        snapshot_id: &str,
        page_token: Option<&str>,
    ) -> SourceResult<BlockPage> {
        self.snapshot_record(snapshot_id).await?;
        let (_, img) = self.snapshot_paths(snapshot_id)?;
        let start = match page_token {
            None => 0,
            Some(token) => token.parse::<u64>().map_err(|_| {
                SourceError::new(SourceErrorKind::InvalidInput, format!("bad page token {token}"))
            })?,
        };

        let block_size = self.block_size;
        let page_size = self.page_size;
        tokio::task::spawn_blocking(move || scan_page(&img, block_size, start, page_size))
            .await
            .map_err(|e| SourceError::new(SourceErrorKind::Internal, e.to_string()))?
    }

    async fn get_block(&self, snapshot_id: &str, index: u64, token: &str) -> SourceResult<BlockData> {
        if token != block_token(snapshot_id, index) {
            return Err(SourceError::new(
                SourceErrorKind::InvalidInput,
                format!("token does not match block {index}"),
            ));
        }
        let (_, img) = self.snapshot_paths(snapshot_id)?;
        let block_size = self.block_size;

        let bytes = tokio::task::spawn_blocking(move || read_block(&img, block_size, index))
            .await
            .map_err(|e| SourceError::new(SourceErrorKind::Internal, e.to_string()))??;
        let checksum = checksum::compute(&bytes, ChecksumAlgorithm::Sha256);

        Ok(BlockData {
            bytes,
            checksum,
            algorithm: ChecksumAlgorithm::Sha256,
        })
    }
}

fn block_token(snapshot_id: &str, index: u64) -> String {
    format!("{snapshot_id}:{index}")
}

fn scan_page(img: &Path, block_size: u32, start: u64, page_size: usize) -> SourceResult<BlockPage> {
    let file = File::open(img)?;
    let size = file.metadata()?.len();
    let block_count = size.div_ceil(block_size as u64);
    let snapshot_id = img
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut blocks = Vec::new();
    let mut index = start;
    while index < block_count && blocks.len() < page_size {
        let bytes = read_block_from(&file, size, block_size, index)?;
        if bytes.iter().any(|&b| b != 0) {
            blocks.push(BlockDescriptor {
                index,
                token: block_token(&snapshot_id, index),
                checksum: Some(checksum::compute(&bytes, ChecksumAlgorithm::Sha256)),
            });
        }
        index += 1;
    }

    Ok(BlockPage {
        blocks,
        next_token: (index < block_count).then(|| index.to_string()),
        block_size,
        volume_size_bytes: Some(size),
    })
}

fn read_block(img: &Path, block_size: u32, index: u64) -> SourceResult<Vec<u8>> {
    let file = File::open(img)?;
    let size = file.metadata()?.len();
    read_block_from(&file, size, block_size, index)
}

fn read_block_from(file: &File, size: u64, block_size: u32, index: u64) -> SourceResult<Vec<u8>> {
    let offset = index
        .checked_mul(block_size as u64)
        .filter(|offset| *offset < size)
        .ok_or_else(|| SourceError::not_found(format!("block {index} is beyond the volume")))?;
    let len = (size - offset).min(block_size as u64) as usize;
    let mut bytes = vec![0u8; len];
    file.read_exact_at(&mut bytes, offset)?;
    Ok(bytes)
}

fn check_id(id: &str) -> SourceResult<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SourceError::new(
            SourceErrorKind::InvalidInput,
            format!("invalid identifier {id:?}"),
        ))
    }
}

fn missing(e: SourceError, message: String) -> SourceError {
    match e.kind {
        SourceErrorKind::NotFound => SourceError::not_found(message),
        _ => e,
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> SourceResult<T> {
    let content = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&content).map_err(|e| {
        SourceError::new(
            SourceErrorKind::Internal,
            format!("{}: {e}", path.display()),
        )
    })
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> SourceResult<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| SourceError::new(SourceErrorKind::Internal, e.to_string()))?;
    tokio::fs::write(path, content).await?;
    Ok(())
}
