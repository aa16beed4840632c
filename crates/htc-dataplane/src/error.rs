//! Dataplane error taxonomy
//!
//! The synchronizer's retry policy hangs off these variants: conflicts
//! retry in place, transient errors retry with backoff, permanent errors
//! fail the pod for this cycle.

/// Result type alias for Dataplane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the Dataplane API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transaction's base version is stale (HTTP 409).
    #[error("version conflict: configuration is now at version {current}")]
    VersionConflict {
        /// Version the configuration moved to
        current: i64,
    },

    /// 5xx or a transport failure; worth retrying with backoff.
    #[error("transient dataplane error ({status}): {message}")]
    Transient {
        /// HTTP status, 0 for transport failures
        status: u16,
        /// Response body or transport diagnostic
        message: String,
    },

    /// Non-409 4xx; retrying the same request will not help.
    #[error("permanent dataplane error ({status}): {message}")]
    Permanent {
        /// HTTP status
        status: u16,
        /// Response body
        message: String,
    },

    /// The response body did not parse as the expected shape.
    #[error("unexpected dataplane response: {0}")]
    Decode(String),
}

impl Error {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Transient { status: 0, message: err.to_string() }
    }
}
