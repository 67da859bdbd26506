// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

use snapvol_sys::SysError;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Image {0} does not exist")]
    ImageNotFound(PathBuf),

    #[error("Image {0} is locked by another snapvol process")]
    Locked(PathBuf),

    #[error("Failed to attach {image} to a loop device: {reason}")]
    LoopAttachFailed { image: PathBuf, reason: String },

    #[error("Partition {0} not found")]
    PartitionNotFound(u32),

    #[error("No mountable filesystem found in {image} (tried {tried})")]
    NoMountableFilesystem { image: PathBuf, tried: String },

    #[error("Resolver cannot {action} in state {state}")]
    InvalidState { state: &'static str, action: &'static str },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Host operation failed: {0}")]
    Host(#[from] SysError),
}

pub type Result<T> = std::result::Result<T, ResolveError>;
