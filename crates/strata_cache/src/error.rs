//! Cache backend errors.

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a cache backend operation.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Filesystem failure on a persistent entry.
    #[error("cache I/O failed at {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A persistent entry could not be decoded.
    #[error("corrupt cache entry at {path}: {reason}")]
    Corrupt {
        /// Offending file.
        path: PathBuf,
        /// What failed to decode.
        reason: String,
    },

    /// Namespace or key cannot be stored.
    #[error("invalid cache key: {0}")]
    InvalidKey(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
