//! # Error Types
//!
//! Every failure that can cross a STRATA crate boundary.
//!
//! ## Taxonomy
//!
//! | Kind                 | Recovery                                   |
//! |----------------------|--------------------------------------------|
//! | capacity exceeded    | retried with backoff, then sequential lane |
//! | slice failure        | surfaced on the batch handle               |
//! | resource unavailable | downgraded to the default path             |
//! | host not ready       | tick-end drain remains the guaranteed path |

use std::any::Any;

use thiserror::Error;

use crate::config::ConfigError;

/// Error produced by a single slice closure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SliceError {
    /// The closure reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The closure panicked. The payload message is preserved when it is a string.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl SliceError {
    /// Builds a `Failed` error from anything displayable.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    /// Builds a `Panicked` error from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::Panicked(panic_message(payload))
    }
}

/// Extracts a readable message from a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Errors surfaced by the STRATA engine.
#[derive(Error, Debug)]
pub enum StrataError {
    /// A slice closure failed and no fallback path could recover it.
    #[error("slice {index} of batch '{batch}' failed: {source}")]
    SliceFailed {
        /// Batch name.
        batch: String,
        /// Index of the failing slice within the batch.
        index: usize,
        /// The closure's error.
        #[source]
        source: SliceError,
    },

    /// The execution backend has no free capacity.
    #[error("execution backend saturated")]
    CapacityExceeded,

    /// The execution backend rejected the batch for a reason other than capacity.
    #[error("execution failed for batch '{batch}': {reason}")]
    ExecutionFailed {
        /// Batch name.
        batch: String,
        /// Backend's description of the failure.
        reason: String,
    },

    /// An optional resource (accelerator, cache directory) is absent.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The host cannot accept out-of-band work yet.
    #[error("host not ready")]
    HostNotReady,

    /// The component was shut down before the work could complete.
    #[error("engine shut down")]
    ShutDown,

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for STRATA operations.
pub type StrataResult<T> = Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(payload.as_ref()), "owned boom");

        let payload: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_slice_failed_display() {
        let err = StrataError::SliceFailed {
            batch: "terrain".to_string(),
            index: 3,
            source: SliceError::failed("bad seed"),
        };
        assert_eq!(err.to_string(), "slice 3 of batch 'terrain' failed: bad seed");
    }
}
