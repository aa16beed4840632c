//! Custom resources for the HAProxy template controller
//!
//! Three kinds under the `haproxy-template-ic.github.io` group:
//! [`HAProxyTemplateConfig`] (human-owned configuration),
//! [`HAProxyCfg`] (published runtime configuration with deployment status)
//! and [`HAProxyMapFile`] (one per rendered map file). The latter two are
//! owner-referenced to the template config so deletion cascades.

pub mod condition;
pub mod config;
pub mod deployment;
pub mod map_file;
pub mod runtime;

pub use condition::{upsert_condition, Condition};
pub use config::{
    CredentialsRef, HAProxyTemplateConfig, HAProxyTemplateConfigSpec, HAProxyTemplateConfigStatus,
    LeaderElectionConfig, OperationalConfig, PodSelector, PostProcessor, ResourceDirs, Snippet,
    StoreStrategy, Template, ValidationStatus, ValidationTest, WatchedResource,
};
pub use deployment::{DeploymentStatus, OperationSummary};
pub use map_file::{HAProxyMapFile, HAProxyMapFileSpec, HAProxyMapFileStatus, MapEntry};
pub use runtime::{
    invalid_name, ArtifactMetadata, AuxiliaryFiles, HAProxyCfg, HAProxyCfgSpec, HAProxyCfgStatus,
};

/// API group shared by all three kinds.
pub const API_GROUP: &str = "haproxy-template-ic.github.io";

/// API version of the group.
pub const API_VERSION: &str = "v1alpha1";

/// Result alias for spec validation.
pub type Result<T> = std::result::Result<T, SpecError>;

/// Structural invariant violations in a `HAProxyTemplateConfig` spec.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("spec.watchedResources must declare at least one resource")]
    NoWatchedResources,

    #[error("spec.haproxyConfig.template must not be empty")]
    EmptyMainTemplate,

    #[error("watched resource {alias:?}: indexBy must not be empty")]
    EmptyIndexBy {
        /// Alias of the offending entry
        alias: String,
    },

    #[error("template snippet {name:?}: priority {priority} outside [0, 1000]")]
    SnippetPriorityOutOfRange {
        /// Snippet name
        name: String,
        /// Declared priority
        priority: i32,
    },

    #[error("validation test {name:?} is declared more than once")]
    DuplicateTestName {
        /// Duplicated test name
        name: String,
    },
}
