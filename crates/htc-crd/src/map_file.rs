//! Map file CRD, one per rendered HAProxy map

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::deployment::DeploymentStatus;

/// Spec of the `HAProxyMapFile` custom resource.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "haproxy-template-ic.github.io",
    version = "v1alpha1",
    kind = "HAProxyMapFile",
    plural = "haproxymapfiles",
    namespaced
)]
#[kube(status = "HAProxyMapFileStatus")]
#[serde(rename_all = "camelCase")]
pub struct HAProxyMapFileSpec {
    /// Map name as referenced from the HAProxy configuration
    pub map_name: String,
    /// Path of the map file on the HAProxy pods
    pub path: String,
    /// Ordered map entries (first match wins in HAProxy)
    #[serde(default)]
    pub entries: Vec<MapEntry>,
    /// `sha256:<hex>` of the rendered file content
    pub checksum: String,
}

/// One `key value` line of a map file.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MapEntry {
    /// Lookup key
    pub key: String,
    /// Mapped value
    pub value: String,
}

/// Status of a `HAProxyMapFile`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HAProxyMapFileStatus {
    /// Per-pod deployment records, cross-updated with the owning config
    #[serde(default)]
    pub deployed_to_pods: Vec<DeploymentStatus>,
}

/// Parse rendered map content into entries. Blank lines and `#` comments
/// are skipped; the first whitespace splits key from value.
pub fn parse_entries(content: &str) -> Vec<MapEntry> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once(char::is_whitespace) {
            Some((key, value)) => MapEntry {
                key: key.to_string(),
                value: value.trim().to_string(),
            },
            None => MapEntry { key: line.to_string(), value: String::new() },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines() {
        let entries = parse_entries("# hosts\nexample.com be_web\n\napi.example.com   be_api\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], MapEntry { key: "example.com".into(), value: "be_web".into() });
        assert_eq!(entries[1], MapEntry { key: "api.example.com".into(), value: "be_api".into() });
    }

    #[test]
    fn key_only_lines_get_empty_value() {
        let entries = parse_entries("standalone\n");
        assert_eq!(entries[0], MapEntry { key: "standalone".into(), value: String::new() });
    }
}
