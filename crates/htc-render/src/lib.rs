//! Template rendering
//!
//! A pure function from (config spec, store snapshots) to a
//! [`RenderedArtifact`]. The engine is Jinja-compatible; templates see
//! `resources.<alias>` store views, `controller.haproxy_pods`,
//! `template_snippets` and the config's `extraContext` keys. Equal inputs
//! produce byte-identical output.

pub mod context;
pub mod error;
pub mod renderer;

pub use context::StoreView;
pub use error::{Error, Result};
pub use renderer::Renderer;
