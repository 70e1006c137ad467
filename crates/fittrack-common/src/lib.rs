//! # FitTrack Common
//!
//! Shared pieces of the FitTrack worker crates: the worker-level error
//! type, logging setup, the install retry policy, and the epoch clock
//! every deadline is computed against.

use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, RetryPolicy};

/// Worker-level errors: client-facing failures the event loop logs and
/// drops rather than crashing on. The cache and notification internals
/// carry their own error types.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// A page posted a message the worker does not understand.
    #[error("Invalid client message: {message}")]
    InvalidMessage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A referenced resource (client window, cache entry) is gone.
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl WorkerError {
    /// Wrap a decode failure as an invalid client message.
    pub fn invalid_message<E: std::error::Error + Send + Sync + 'static>(source: E) -> Self {
        Self::InvalidMessage {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| WorkerError::NotFound(resource.into()))
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Client messages carry absolute epoch-millisecond deadlines, so every
/// crate computes delays against this clock.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
