//! Per-pod deployment records shared by `HAProxyCfg` and `HAProxyMapFile`

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// What happened the last time the synchronizer touched one pod.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// Pod name
    pub pod: String,
    /// Checksum of the configuration the pod converged to
    pub checksum: String,
    /// When the artifact was last actually deployed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    /// When the pod was last compared against the artifact (drift checks
    /// update this without touching `deployed_at`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    /// When the last HAProxy reload happened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reload_at: Option<DateTime<Utc>>,
    /// Reload id reported by the Dataplane API
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reload_id: Option<String>,
    /// Wall-clock duration of the last sync attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_duration_millis: Option<u64>,
    /// Version-conflict retries consumed by the last sync
    #[serde(default)]
    pub version_conflict_retries: u32,
    /// Whether the last sync pushed the raw config instead of structured ops
    #[serde(default)]
    pub fallback_used: bool,
    /// Operation counts of the last sync
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_summary: Option<OperationSummary>,
    /// Last error text, if the most recent attempt failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Consecutive failed attempts
    #[serde(default)]
    pub consecutive_errors: u32,
    /// When the last error occurred
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Counts of Dataplane API operations in one sync.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    /// Create operations executed
    pub creates: u32,
    /// Update operations executed
    pub updates: u32,
    /// Delete operations executed
    pub deletes: u32,
    /// Total API operations (zero for an idempotent re-apply)
    pub total: u32,
}

impl OperationSummary {
    /// Tally from individual counts.
    pub fn new(creates: u32, updates: u32, deletes: u32) -> Self {
        Self { creates, updates, deletes, total: creates + updates + deletes }
    }
}
