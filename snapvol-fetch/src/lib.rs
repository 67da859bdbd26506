// SPDX-License-Identifier: GPL-3.0-only

//! Snapshot download engine for snapvol
//!
//! Turns a volume into a local sparse image:
//! - [`lifecycle`] creates a point-in-time snapshot and guarantees its deletion
//! - [`scheduler`] lists and fetches blocks concurrently with bounded retries
//! - [`pipeline`] ties both to the image writer and the metadata sidecar
//!
//! [`local::LocalStore`] implements the service contracts over a directory.

pub mod checksum;
pub mod error;
pub mod lifecycle;
pub mod local;
pub mod metadata;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod scheduler;

pub use error::{DownloadError, Result};
pub use lifecycle::{
    ForceInUse, InUseGate, ReadinessPolicy, RefuseInUse, SnapshotHandle, SnapshotInfo,
    SnapshotLifecycle,
};
pub use local::{LocalStore, VolumeRecord};
pub use pipeline::{DownloadReport, DownloadRequest, VolumeDownload};
pub use progress::{EtaEstimator, Progress, ProgressSnapshot};
pub use retry::RetryPolicy;
pub use scheduler::{DownloadConfig, DownloadStats, Downloader};
