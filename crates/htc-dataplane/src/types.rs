//! Wire types for the transaction lifecycle

use serde::{Deserialize, Serialize};

/// An open Dataplane transaction. Every mutating call references its id;
/// the caller must commit or abort it on every exit path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Server-assigned transaction id
    pub id: String,
    /// Configuration version the transaction was opened against
    #[serde(rename = "_version")]
    pub version: i64,
}

/// Result of committing a transaction (or of a raw push).
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    /// Configuration version after the commit
    pub version: i64,
    /// Whether HAProxy schedules a reload (HTTP 202)
    pub reload_required: bool,
    /// Reload id from the `Reload-ID` header, when a reload was scheduled
    pub reload_id: Option<String>,
}

/// Dataplane storage families for auxiliary files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Map files (`/services/haproxy/storage/maps`)
    Map,
    /// SSL certificates (`/services/haproxy/storage/ssl_certificates`)
    SslCertificate,
    /// General-purpose files (`/services/haproxy/storage/general`)
    General,
}

impl StorageKind {
    /// URL path segment of this storage family.
    pub fn path(self) -> &'static str {
        match self {
            Self::Map => "storage/maps",
            Self::SslCertificate => "storage/ssl_certificates",
            Self::General => "storage/general",
        }
    }
}
