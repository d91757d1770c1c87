//! Error taxonomy for storage operations.
//!
//! Malformed volume-table lines and missing restore artifacts are recovered
//! at their call sites (skip with a warning) and never surface here.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no volume declared for path {0}")]
    UnknownVolume(PathBuf),

    #[error("failed to mount {mount_point}: {reason}")]
    Mount { mount_point: String, reason: String },

    #[error("failed to unmount {mount_point}: {reason}")]
    Unmount { mount_point: String, reason: String },

    #[error("failed to format {target}: {reason}")]
    Format { target: String, reason: String },

    #[error("{tool} failed: {reason}")]
    Encoding { tool: String, reason: String },

    #[error("job cancelled by user")]
    Cancelled,

    #[error("manifest verification failed: {0}")]
    Checksum(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn mount(mount_point: impl Into<String>, reason: impl ToString) -> Self {
        Self::Mount {
            mount_point: mount_point.into(),
            reason: reason.to_string(),
        }
    }

    pub fn format(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Format {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn encoding(tool: impl Into<String>, reason: impl ToString) -> Self {
        Self::Encoding {
            tool: tool.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
