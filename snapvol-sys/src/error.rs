// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Required tool not found: {0}")]
    ToolMissing(String),

    #[error("command failed: {command}; stderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("Block {index} does not fit in an image of {size_bytes} bytes")]
    BlockOutOfRange { index: u64, size_bytes: u64 },

    #[error("Block {index} is {len} bytes, only the final block may be shorter than {block_size}")]
    ShortBlock {
        index: u64,
        len: usize,
        block_size: u32,
    },

    #[error("Block {0} was already written")]
    DuplicateBlock(u64),

    #[error("Image size mismatch: {0}")]
    SizeMismatch(String),

    #[error("{} is locked by another snapvol process", .0.display())]
    Locked(PathBuf),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
