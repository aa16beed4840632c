//! Synchronizer errors

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from a per-pod sync attempt.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The Dataplane API rejected or failed a call.
    #[error(transparent)]
    Dataplane(#[from] htc_dataplane::Error),

    /// Live state could not be decoded into the structured model. The
    /// executor treats this as "compare impossible" and falls back to a
    /// raw push.
    #[error("cannot decode live {path}: {message}")]
    Decode {
        /// Configuration path that failed to decode
        path: String,
        /// Serde diagnostic
        message: String,
    },

    /// A model could not be transformed into an API body; source and
    /// target type names are logged at the call site.
    #[error("transform produced no API model for {context}")]
    Transform {
        /// Element the transform was attempted for
        context: String,
    },

    /// Version conflicts persisted past the retry cap.
    #[error("version conflict retries exhausted after {retries} attempts")]
    RetriesExhausted {
        /// Attempts consumed
        retries: u32,
    },
}

impl Error {
    /// Whether the whole attempt is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Dataplane(e) if e.is_transient())
    }
}
