//! Parser and transform errors

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing or transforming configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration text could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A model could not be converted to the Dataplane API JSON shape.
    /// This is a signal for the raw-push fallback, not a crash.
    #[error("cannot transform {source_type} into {target_type}")]
    Transform {
        /// Rust type being serialized
        source_type: &'static str,
        /// API model it was aimed at
        target_type: &'static str,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A syntax error with the offending line.
#[derive(Debug, thiserror::Error)]
#[error("parse error at line {line}: {message}")]
pub struct ParseError {
    /// 1-based line number in the configuration text
    pub line: usize,
    /// What the parser objected to
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(line: usize, message: impl Into<String>) -> Self {
        Self { line, message: message.into() }
    }
}
