// SPDX-License-Identifier: GPL-3.0-only

//! Snapshot acquisition and guaranteed release
//!
//! A snapshot created for a download is ephemeral: whatever happens to the
//! download, it must be deleted again. [`SnapshotHandle::release`] performs the
//! deletion exactly once; a handle dropped without being released schedules the
//! deletion on the current runtime instead.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use snapvol_contracts::{SnapshotApi, SourceErrorKind};
use snapvol_types::{Snapshot, SnapshotState, Volume};

use crate::error::{DownloadError, Result};
use crate::retry::exponential;

/// Decides whether a volume that is attached to an instance may be snapshotted.
///
/// The answer is raced against cancellation, so an implementation may wait on
/// a person without holding up shutdown.
#[async_trait]
pub trait InUseGate: Send + Sync {
    async fn confirm(&self, volume: &Volume) -> bool;
}

/// Proceeds with in-use volumes without asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForceInUse;

#[async_trait]
impl InUseGate for ForceInUse {
    async fn confirm(&self, _volume: &Volume) -> bool {
        true
    }
}

/// Refuses in-use volumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefuseInUse;

#[async_trait]
impl InUseGate for RefuseInUse {
    async fn confirm(&self, _volume: &Volume) -> bool {
        false
    }
}

/// Polling schedule while a snapshot is pending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(3600),
        }
    }
}

/// What a download needs to know about the snapshot it reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub volume: Volume,
    pub snapshot: Snapshot,
    pub captured_while_in_use: bool,
}

/// A completed snapshot owned by the current operation
pub struct SnapshotHandle {
    info: SnapshotInfo,
    api: Arc<dyn SnapshotApi>,
    released: bool,
}

impl std::fmt::Debug for SnapshotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotHandle")
            .field("info", &self.info)
            .field("released", &self.released)
            .finish()
    }
}

impl SnapshotHandle {
    pub fn info(&self) -> &SnapshotInfo {
        &self.info
    }

    pub fn snapshot_id(&self) -> &str {
        &self.info.snapshot.id
    }

    pub fn volume(&self) -> &Volume {
        &self.info.volume
    }

    pub fn captured_while_in_use(&self) -> bool {
        self.info.captured_while_in_use
    }

    /// Delete the snapshot if this operation created it.
    ///
    /// Deletion failures are logged and swallowed so they never mask the
    /// outcome of the download itself.
    pub async fn release(mut self) {
        self.released = true;
        if !self.info.snapshot.ephemeral {
            debug!(snapshot = %self.info.snapshot.id, "keeping adopted snapshot");
            return;
        }

        let id = &self.info.snapshot.id;
        match self.api.delete_snapshot(id).await {
            Ok(()) => info!(snapshot = %id, "deleted snapshot"),
            Err(e) => warn!(snapshot = %id, "failed to delete snapshot: {e}"),
        }
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        if self.released || !self.info.snapshot.ephemeral {
            return;
        }

        let id = self.info.snapshot.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(snapshot = %id, "snapshot handle dropped without release; deleting");
                let api = Arc::clone(&self.api);
                runtime.spawn(async move {
                    if let Err(e) = api.delete_snapshot(&id).await {
                        warn!(snapshot = %id, "failed to delete snapshot: {e}");
                    }
                });
            }
            Err(_) => {
                error!(snapshot = %id, "snapshot handle dropped outside a runtime; snapshot leaked");
            }
        }
    }
}

pub struct SnapshotLifecycle {
    api: Arc<dyn SnapshotApi>,
    policy: ReadinessPolicy,
}

impl SnapshotLifecycle {
    pub fn new(api: Arc<dyn SnapshotApi>, policy: ReadinessPolicy) -> Self {
        Self { api, policy }
    }

    /// Create an ephemeral snapshot of `volume_id` and wait until it completes.
    pub async fn acquire(
        &self,
        volume_id: &str,
        gate: &dyn InUseGate,
        cancel: &CancellationToken,
    ) -> Result<SnapshotHandle> {
        let volume = self.describe_volume(volume_id).await?;
        info!(
            volume = %volume.display_name(),
            size = volume.size_bytes,
            state = volume.state.as_str(),
            "described volume"
        );

        let captured_while_in_use = volume.is_in_use();
        if captured_while_in_use {
            warn!(
                volume = %volume.id,
                instance = volume.attached_instance.as_deref().unwrap_or("unknown"),
                "volume is attached; the snapshot may not be crash-consistent"
            );
            let confirmed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                confirmed = gate.confirm(&volume) => confirmed,
            };
            if !confirmed {
                return Err(DownloadError::UserDeclined(volume.id));
            }
            info!(volume = %volume.id, "proceeding with in-use volume");
        }

        let description = format!("Snapshot for download of {volume_id}");
        let snapshot = self.api.create_snapshot(volume_id, &description).await?;
        info!(snapshot = %snapshot.id, volume = %volume_id, "created snapshot");

        let snapshot = match self.wait_ready(snapshot.id.clone(), cancel).await {
            Ok(mut ready) => {
                ready.ephemeral = true;
                ready
            }
            Err(e) => {
                self.discard(&snapshot.id).await;
                return Err(e);
            }
        };

        Ok(SnapshotHandle {
            info: SnapshotInfo {
                volume,
                snapshot,
                captured_while_in_use,
            },
            api: Arc::clone(&self.api),
            released: false,
        })
    }

    /// Use an existing snapshot. It is never deleted by this operation.
    pub async fn adopt(
        &self,
        snapshot_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SnapshotHandle> {
        let mut snapshot = self.wait_ready(snapshot_id.to_string(), cancel).await?;
        snapshot.ephemeral = false;
        let volume = self.describe_volume(&snapshot.volume_id).await?;
        info!(snapshot = %snapshot.id, volume = %volume.id, "using existing snapshot");

        Ok(SnapshotHandle {
            info: SnapshotInfo {
                volume,
                snapshot,
                captured_while_in_use: false,
            },
            api: Arc::clone(&self.api),
            released: false,
        })
    }

    pub async fn release(&self, handle: SnapshotHandle) {
        handle.release().await;
    }

    /// Acquire a snapshot, run `body` against it and release it whatever the
    /// outcome of `body`.
    pub async fn scoped<F, Fut, T>(
        &self,
        volume_id: &str,
        gate: &dyn InUseGate,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(SnapshotInfo) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.acquire(volume_id, gate, cancel).await?;
        let outcome = body(handle.info().clone()).await;
        handle.release().await;
        outcome
    }

    async fn describe_volume(&self, volume_id: &str) -> Result<Volume> {
        self.api
            .describe_volume(volume_id)
            .await
            .map_err(|e| match e.kind {
                SourceErrorKind::NotFound => DownloadError::VolumeNotFound(volume_id.to_string()),
                _ => DownloadError::Source(e),
            })
    }

    async fn wait_ready(&self, snapshot_id: String, cancel: &CancellationToken) -> Result<Snapshot> {
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.api.describe_snapshot(&snapshot_id).await {
                Ok(snapshot) => match snapshot.state {
                    SnapshotState::Completed => {
                        info!(snapshot = %snapshot_id, polls, "snapshot completed");
                        return Ok(snapshot);
                    }
                    SnapshotState::Error => {
                        return Err(DownloadError::SnapshotFailed(snapshot_id));
                    }
                    SnapshotState::Pending => {
                        debug!(snapshot = %snapshot_id, polls, "snapshot pending");
                    }
                },
                Err(e) if e.is_retryable() => {
                    warn!(snapshot = %snapshot_id, "describe snapshot failed, will poll again: {e}");
                }
                Err(e) => return Err(DownloadError::Source(e)),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DownloadError::SnapshotTimeout {
                    snapshot_id,
                    waited: now - started,
                });
            }

            let delay = exponential(self.policy.initial_delay, self.policy.max_delay, polls)
                .min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn discard(&self, snapshot_id: &str) {
        if let Err(e) = self.api.delete_snapshot(snapshot_id).await {
            warn!(snapshot = %snapshot_id, "failed to delete snapshot: {e}");
        } else {
            info!(snapshot = %snapshot_id, "deleted snapshot");
        }
    }
}
