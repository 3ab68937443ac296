//! Error types for crawltail.
//!
//! Library crates use [`CrawlTailError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all crawltail operations.
#[derive(Debug, thiserror::Error)]
pub enum CrawlTailError {
    /// A poller was asked to tail while it is already tailing.
    #[error("this storage link is already tailing")]
    AlreadyTailing,

    /// A client referenced a subscription handle that does not exist.
    #[error("subscription not found: {handle}")]
    UnknownSubscription { handle: String },

    /// The store query failed this cycle. Recovered by the poller's idle/retry path.
    #[error("transient fetch error: {0}")]
    TransientFetch(String),

    /// Subscription criteria could not be turned into a predicate.
    #[error("malformed criteria: {message}")]
    MalformedCriteria { message: String },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad document shape, invalid payload, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CrawlTailError>;

impl CrawlTailError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a malformed-criteria error from any displayable message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedCriteria {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an unknown-subscription error for `handle`.
    pub fn unknown_subscription(handle: impl Into<String>) -> Self {
        Self::UnknownSubscription {
            handle: handle.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure is worth retrying after the idle interval.
    ///
    /// Store-level failures are treated as transient: a tailing loop should
    /// degrade to its idle path instead of dropping the subscription.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFetch(_) | Self::Storage(_))
    }
}
