//! Error types for library operations

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Download corrupt: expected {expected} bytes, got {actual}")]
    DownloadCorrupt { expected: u64, actual: u64 },

    #[error(
        "Insufficient disk space. Available: {}, Required: {}",
        human(*available),
        human(*required)
    )]
    InsufficientDiskSpace { available: u64, required: u64 },

    #[error("Download already in progress: {0}")]
    AlreadyDownloading(String),

    #[error("Archive already exists: {0}")]
    AlreadyExists(String),

    #[error("Download server unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("No update available, check for updates first")]
    NoUpdateAvailable,

    #[error("Archive {0} not found")]
    NotFound(i64),

    #[error("Archive {0} is not quarantined")]
    NotQuarantined(i64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to finalize update: {0}")]
    UpdateFinalization(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LibraryError {
    /// Shortfall reported by a failed disk preflight
    pub fn shortfall(&self) -> Option<u64> {
        match self {
            Self::InsufficientDiskSpace {
                available,
                required,
            } => Some(required.saturating_sub(*available)),
            _ => None,
        }
    }
}

pub type Result<T, E = LibraryError> = std::result::Result<T, E>;

/// Render a byte count in binary units, e.g. `4.7 GiB`
pub fn human(bytes: u64) -> String {
    bytesize::to_string(bytes, true)
}
