//! Render errors

/// Result type alias for rendering.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from template evaluation or post-processing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The template engine rejected or failed to evaluate a template.
    #[error("template {name:?}: {source}")]
    Template {
        /// Which template failed (main config, map name, ...)
        name: String,
        /// Engine diagnostic
        #[source]
        source: minijinja::Error,
    },

    /// A `regexReplace` post-processor carries an invalid pattern.
    #[error("post-processor pattern {pattern:?}: {source}")]
    PostProcessor {
        /// The offending pattern
        pattern: String,
        /// Regex diagnostic
        #[source]
        source: regex::Error,
    },
}
