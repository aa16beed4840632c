//! The primary configuration CRD
//!
//! `HAProxyTemplateConfig` is the single human-owned resource: it selects the
//! target HAProxy pods, declares which resource kinds feed the templates, and
//! carries the templates themselves plus the operational tunables.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::{Result, SpecError};

/// Spec of the `HAProxyTemplateConfig` custom resource.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "haproxy-template-ic.github.io",
    version = "v1alpha1",
    kind = "HAProxyTemplateConfig",
    plural = "haproxytemplateconfigs",
    shortname = "htc",
    namespaced
)]
#[kube(status = "HAProxyTemplateConfigStatus")]
#[serde(rename_all = "camelCase")]
pub struct HAProxyTemplateConfigSpec {
    /// Label selector for the HAProxy pods this config drives.
    pub pod_selector: PodSelector,

    /// Reference to the secret carrying Dataplane credentials.
    pub credentials: CredentialsRef,

    /// Watched resource kinds, keyed by the alias exposed to templates.
    pub watched_resources: BTreeMap<String, WatchedResource>,

    /// Template for the main HAProxy configuration file.
    pub haproxy_config: Template,

    /// Templates for map files, keyed by file name.
    #[serde(default)]
    pub maps: BTreeMap<String, Template>,

    /// Templates for general-purpose files (error pages etc.).
    #[serde(default)]
    pub files: BTreeMap<String, Template>,

    /// Templates for SSL certificates (PEM output).
    #[serde(default)]
    pub ssl_certificates: BTreeMap<String, Template>,

    /// Reusable named fragments, includable from any template.
    #[serde(default)]
    pub template_snippets: BTreeMap<String, Snippet>,

    /// Opaque JSON merged into the top level of every render context.
    #[serde(default)]
    pub extra_context: BTreeMap<String, serde_json::Value>,

    /// Template unit tests run after validation and in webhook dry-runs.
    #[serde(default)]
    pub validation_tests: Vec<ValidationTest>,

    /// Operational tunables.
    #[serde(default)]
    pub operational: OperationalConfig,
}

/// Label match for target pods.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSelector {
    /// Labels a pod must carry to be a deployment target.
    pub match_labels: BTreeMap<String, String>,
}

impl PodSelector {
    /// Selector in `k=v,k2=v2` form for watch list params.
    pub fn to_label_selector(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Secret reference for Dataplane API credentials. The secret must carry
/// `dataplane_username`/`dataplane_password` for the production endpoints
/// and `validation_username`/`validation_password` for validation sidecars.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsRef {
    /// Name of the secret
    pub secret_name: String,
    /// Namespace of the secret; defaults to the config's namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_namespace: Option<String>,
}

/// One watched Kubernetes resource kind.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatchedResource {
    /// `group/version` (or `v1` for the core group)
    pub api_version: String,
    /// Plural resource name, e.g. `ingresses`
    pub resources: String,
    /// Whether candidate objects of this kind are dry-run validated by the
    /// admission webhook
    #[serde(default)]
    pub enable_validation_webhook: bool,
    /// Ordered JSONPath expressions producing the index key tuple; its
    /// length fixes the store arity
    pub index_by: Vec<String>,
    /// Optional label selector for the watch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    /// Optional field selector for the watch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<String>,
    /// Restrict the watch to one namespace; all namespaces when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<String>,
    /// Storage strategy for this kind
    #[serde(default)]
    pub store: StoreStrategy,
    /// Payload cache TTL for the on-demand strategy
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

fn default_cache_ttl() -> u64 {
    300
}

/// How payloads of a watched kind are held in memory.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum StoreStrategy {
    /// Keep whole (field-pruned) payloads in memory.
    #[default]
    Full,
    /// Keep references only; fetch payloads on access with a TTL cache.
    OnDemand,
}

/// A template body with optional output post-processing.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Template source text
    pub template: String,
    /// Applied to the rendered output, in order
    #[serde(default)]
    pub post_processors: Vec<PostProcessor>,
}

/// One output post-processing step.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum PostProcessor {
    /// Replace every match of `pattern` with `replace`.
    #[serde(rename_all = "camelCase")]
    RegexReplace {
        /// Regular expression to search for
        pattern: String,
        /// Replacement text (capture groups allowed)
        replace: String,
    },
}

/// A named reusable fragment with an inclusion priority.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    /// Template source text
    pub template: String,
    /// Ordering priority, 0–1000; lower sorts first
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    500
}

/// A template unit test: render against fixture stores, assert snippets.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationTest {
    /// Unique test name
    pub name: String,
    /// Free-form description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Fixture objects per watched-resource alias
    #[serde(default)]
    pub fixtures: BTreeMap<String, Vec<serde_json::Value>>,
    /// Substrings the rendered main config must contain
    #[serde(default)]
    pub expect_contains: Vec<String>,
    /// Substrings the rendered main config must not contain
    #[serde(default)]
    pub expect_not_contains: Vec<String>,
}

/// Operational tunables with production defaults.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationalConfig {
    /// Leader election parameters
    pub leader_election: LeaderElectionConfig,
    /// Dataplane API port on the HAProxy pods
    pub dataplane_port: u16,
    /// Floor between successive deploys of the same artifact to one pod
    pub min_deploy_interval_seconds: u64,
    /// Read-only drift check interval when no deploy happened
    pub drift_prevention_interval_seconds: u64,
    /// Coalescing window for `ResourcesChanged` bursts
    pub debounce_millis: u64,
    /// Structured-operation count beyond which the sync falls back to a
    /// raw config push
    pub max_structured_operations: usize,
    /// In-place retries on Dataplane version conflicts
    pub max_version_conflict_retries: u32,
    /// Filesystem layout the rendered artifacts are validated against
    pub resource_dirs: ResourceDirs,
    /// Fields stripped from watched payloads before storing/rendering
    pub watched_resources_ignore_fields: Vec<String>,
}

impl Default for OperationalConfig {
    fn default() -> Self {
        Self {
            leader_election: LeaderElectionConfig::default(),
            dataplane_port: 5555,
            min_deploy_interval_seconds: 5,
            drift_prevention_interval_seconds: 60,
            debounce_millis: 500,
            max_structured_operations: 50,
            max_version_conflict_retries: 3,
            resource_dirs: ResourceDirs::default(),
            watched_resources_ignore_fields: vec!["metadata.managedFields".to_string()],
        }
    }
}

/// Lease-based leader election parameters.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaderElectionConfig {
    /// Disabled means perpetual leadership
    pub enabled: bool,
    /// Name of the coordination Lease
    pub lease_name: String,
    /// How long a lease is valid without renewal
    pub lease_duration_seconds: u64,
    /// How long the holder keeps trying to renew before giving up
    pub renew_deadline_seconds: u64,
    /// Poll interval for non-holders
    pub retry_period_seconds: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_name: "haproxy-template-controller".to_string(),
            lease_duration_seconds: 60,
            renew_deadline_seconds: 15,
            retry_period_seconds: 5,
        }
    }
}

/// Directory layout shared by validation sandbox and the real pods.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceDirs {
    /// Map file directory
    pub maps_dir: String,
    /// SSL certificate directory
    pub ssl_certs_dir: String,
    /// General file storage directory
    pub general_storage_dir: String,
    /// Main configuration file path
    pub config_file: String,
}

impl Default for ResourceDirs {
    fn default() -> Self {
        Self {
            maps_dir: "/etc/haproxy/maps".to_string(),
            ssl_certs_dir: "/etc/haproxy/ssl".to_string(),
            general_storage_dir: "/etc/haproxy/general".to_string(),
            config_file: "/etc/haproxy/haproxy.cfg".to_string(),
        }
    }
}

/// Status of a `HAProxyTemplateConfig`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HAProxyTemplateConfigStatus {
    /// Generation last acted upon
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// When validation last completed (either way)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_validated: Option<DateTime<Utc>>,
    /// Outcome of the last validation
    #[serde(default)]
    pub validation_status: ValidationStatus,
    /// Error text when invalid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_message: Option<String>,
    /// Standard conditions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/// Validation outcome reflected in the config status.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq)]
pub enum ValidationStatus {
    /// Candidate passed all phases
    Valid,
    /// Candidate failed a phase
    Invalid,
    /// Nothing validated yet
    #[default]
    Unknown,
}

impl HAProxyTemplateConfigSpec {
    /// Enforce the structural invariants that do not need a render.
    pub fn validate(&self) -> Result<()> {
        if self.watched_resources.is_empty() {
            return Err(SpecError::NoWatchedResources);
        }
        if self.haproxy_config.template.trim().is_empty() {
            return Err(SpecError::EmptyMainTemplate);
        }
        for (alias, watched) in &self.watched_resources {
            if watched.index_by.is_empty() {
                return Err(SpecError::EmptyIndexBy { alias: alias.clone() });
            }
        }
        for (name, snippet) in &self.template_snippets {
            if !(0..=1000).contains(&snippet.priority) {
                return Err(SpecError::SnippetPriorityOutOfRange {
                    name: name.clone(),
                    priority: snippet.priority,
                });
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for test in &self.validation_tests {
            if !seen.insert(test.name.as_str()) {
                return Err(SpecError::DuplicateTestName { name: test.name.clone() });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec() -> HAProxyTemplateConfigSpec {
        let mut watched = BTreeMap::new();
        watched.insert(
            "ingresses".to_string(),
            WatchedResource {
                api_version: "networking.k8s.io/v1".into(),
                resources: "ingresses".into(),
                enable_validation_webhook: false,
                index_by: vec!["metadata.namespace".into(), "metadata.name".into()],
                label_selector: None,
                field_selector: None,
                namespace_selector: None,
                store: StoreStrategy::Full,
                cache_ttl_seconds: 300,
            },
        );
        HAProxyTemplateConfigSpec {
            pod_selector: PodSelector::default(),
            credentials: CredentialsRef {
                secret_name: "dataplane-auth".into(),
                secret_namespace: None,
            },
            watched_resources: watched,
            haproxy_config: Template {
                template: "global\n  maxconn {{ maxconn | default(2000) }}\n".into(),
                post_processors: Vec::new(),
            },
            maps: BTreeMap::new(),
            files: BTreeMap::new(),
            ssl_certificates: BTreeMap::new(),
            template_snippets: BTreeMap::new(),
            extra_context: BTreeMap::new(),
            validation_tests: Vec::new(),
            operational: OperationalConfig::default(),
        }
    }

    #[test]
    fn minimal_spec_is_valid() {
        assert!(minimal_spec().validate().is_ok());
    }

    #[test]
    fn rejects_empty_watched_resources() {
        let mut spec = minimal_spec();
        spec.watched_resources.clear();
        assert!(matches!(spec.validate(), Err(SpecError::NoWatchedResources)));
    }

    #[test]
    fn rejects_empty_main_template() {
        let mut spec = minimal_spec();
        spec.haproxy_config.template = "  \n".into();
        assert!(matches!(spec.validate(), Err(SpecError::EmptyMainTemplate)));
    }

    #[test]
    fn rejects_out_of_range_snippet_priority() {
        let mut spec = minimal_spec();
        spec.template_snippets.insert(
            "late".into(),
            Snippet { template: "# tail\n".into(), priority: 1001 },
        );
        assert!(matches!(
            spec.validate(),
            Err(SpecError::SnippetPriorityOutOfRange { priority: 1001, .. })
        ));
    }

    #[test]
    fn rejects_duplicate_test_names() {
        let mut spec = minimal_spec();
        for _ in 0..2 {
            spec.validation_tests.push(ValidationTest {
                name: "smoke".into(),
                ..ValidationTest::default()
            });
        }
        assert!(matches!(spec.validate(), Err(SpecError::DuplicateTestName { .. })));
    }

    #[test]
    fn operational_defaults_match_documented_values() {
        let op = OperationalConfig::default();
        assert_eq!(op.dataplane_port, 5555);
        assert_eq!(op.leader_election.lease_duration_seconds, 60);
        assert_eq!(op.leader_election.renew_deadline_seconds, 15);
        assert_eq!(op.leader_election.retry_period_seconds, 5);
        assert_eq!(op.resource_dirs.config_file, "/etc/haproxy/haproxy.cfg");
    }

    #[test]
    fn snippet_priority_defaults_to_500() {
        let snippet: Snippet = serde_json::from_value(serde_json::json!({
            "template": "# x"
        }))
        .unwrap();
        assert_eq!(snippet.priority, 500);
    }

    #[test]
    fn pod_selector_renders_label_selector() {
        let mut selector = PodSelector::default();
        selector.match_labels.insert("app".into(), "haproxy".into());
        selector.match_labels.insert("tier".into(), "edge".into());
        assert_eq!(selector.to_label_selector(), "app=haproxy,tier=edge");
    }
}
