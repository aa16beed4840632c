//! Dataplane API client
//!
//! A version-aware wrapper over the HAProxy Dataplane REST API. All
//! configuration mutations go through transactions opened against an
//! optimistic-concurrency version; a `409` surfaces as
//! [`Error::VersionConflict`] carrying the current version so the caller
//! can reopen and retry. The raw-config endpoint is the escape hatch for
//! configurations the structured endpoints cannot express.

pub mod client;
pub mod error;
pub mod types;

pub use client::{Credentials, DataplaneClient};
pub use error::{Error, Result};
pub use types::{CommitOutcome, StorageKind, Transaction};
