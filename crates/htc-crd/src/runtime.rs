//! The published runtime configuration CRD

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::deployment::DeploymentStatus;

/// Spec of the `HAProxyCfg` custom resource: the rendered main
/// configuration as deployed, published by the controller. A sibling
/// instance with a `-invalid` name suffix is published instead when
/// validation fails.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "haproxy-template-ic.github.io",
    version = "v1alpha1",
    kind = "HAProxyCfg",
    plural = "haproxycfgs",
    namespaced
)]
#[kube(status = "HAProxyCfgStatus")]
#[serde(rename_all = "camelCase")]
pub struct HAProxyCfgSpec {
    /// Path the config file occupies on the HAProxy pods
    pub path: String,
    /// Full rendered configuration text
    pub content: String,
    /// `sha256:<hex>` of the content
    pub checksum: String,
}

/// Status of a `HAProxyCfg`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HAProxyCfgStatus {
    /// Per-pod deployment records
    #[serde(default)]
    pub deployed_to_pods: Vec<DeploymentStatus>,
    /// References to the auxiliary resources published alongside
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auxiliary_files: Option<AuxiliaryFiles>,
    /// Artifact size and timing metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ArtifactMetadata>,
    /// Full validation error text on the `-invalid` sibling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
}

/// Names of the owned auxiliary resources.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuxiliaryFiles {
    /// `HAProxyMapFile` resource names
    #[serde(default)]
    pub map_files: Vec<String>,
    /// Certificate `Secret` names
    #[serde(default)]
    pub secrets: Vec<String>,
}

/// Size and timing metadata about the rendered artifact.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    /// Bytes in the main configuration
    pub main_config_bytes: u64,
    /// Rendered map file count
    pub map_count: u32,
    /// Rendered certificate count
    pub cert_count: u32,
    /// Rendered general file count
    pub file_count: u32,
    /// When the artifact was rendered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered_at: Option<DateTime<Utc>>,
}

/// Name of the `-invalid` sibling for a given config name.
pub fn invalid_name(name: &str) -> String {
    format!("{name}-invalid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sibling_name() {
        assert_eq!(invalid_name("edge"), "edge-invalid");
    }
}
