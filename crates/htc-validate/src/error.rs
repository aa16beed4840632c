//! Validation error taxonomy

use htc_haproxy::ParseError;

/// Result type alias for validation.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the three validation phases and the template tests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Phase 1: the rendered text is not parseable configuration.
    #[error("syntax error at line {line}: {message}")]
    Syntax {
        /// 1-based line in the rendered config
        line: usize,
        /// Parser diagnostic
        message: String,
    },

    /// Phase 2: one or more elements violate the Dataplane schema.
    /// Every violation is accumulated before failing.
    #[error("schema validation failed:\n{}", errors.join("\n"))]
    Schema {
        /// One line per violation, with element-path context
        errors: Vec<String>,
    },

    /// Phase 3: `haproxy -c` rejected the configuration.
    #[error("semantic validation failed:\n{message}")]
    Semantic {
        /// Alert blocks with surrounding config context
        message: String,
    },

    /// A configured validation test failed.
    #[error("validation test {name:?} failed: {message}")]
    Test {
        /// Test name from the spec
        name: String,
        /// What the assertion expected
        message: String,
    },

    /// Sandbox preparation or binary execution failed outright.
    #[error("validation setup failed: {0}")]
    Setup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn from_parse(err: ParseError) -> Self {
        Self::Syntax { line: err.line, message: err.message }
    }
}
