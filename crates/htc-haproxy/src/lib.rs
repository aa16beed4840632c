//! HAProxy configuration parsing and modeling
//!
//! The parser turns rendered configuration text into a structured [`Config`]
//! whose section types serialize to the JSON shapes the Dataplane API
//! expects. The same model is produced when reading live state back from the
//! API, so the synchronizer compares desired and live configuration as plain
//! struct equality. Directives the structured model does not cover are kept
//! verbatim per section; a difference in those forces the raw-push fallback.

pub mod error;
pub mod model;
pub mod parser;
pub mod transform;
pub mod version;

pub use error::{Error, ParseError, Result};
pub use model::Config;
pub use parser::parse;
pub use transform::{metadata_from_api, metadata_to_api, strip_nulls, to_api_model};
pub use version::DataplaneVersion;
