//! Error types shared by the store and event bus

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A store operation was called with the wrong number of key components.
    #[error("wrong key arity: store is indexed by {expected} components, got {got}")]
    WrongArity {
        /// Arity the store was created with
        expected: usize,
        /// Number of components the caller passed
        got: usize,
    },

    /// A JSONPath expression could not be parsed.
    #[error("invalid JSONPath {path:?}: {message}")]
    JsonPath {
        /// The offending expression
        path: String,
        /// Parser diagnostic
        message: String,
    },

    /// An `indexBy` expression produced no usable key component.
    #[error("key extraction failed for {path:?} on {namespace}/{name}: {message}")]
    KeyExtraction {
        /// The `indexBy` expression
        path: String,
        /// Namespace of the payload
        namespace: String,
        /// Name of the payload
        name: String,
        /// What went wrong
        message: String,
    },

    /// The on-demand backend failed to fetch a payload from the API server.
    #[error("fetch of {namespace}/{name} failed: {message}")]
    Fetch {
        /// Namespace of the referenced object
        namespace: String,
        /// Name of the referenced object
        name: String,
        /// Transport-level diagnostic
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
