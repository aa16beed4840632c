//! Controller runtime
//!
//! Wires the pipeline together: dynamic watchers feed indexed stores, the
//! orchestrator consumes the event bus and drives render → validate →
//! publish → sync, leader election gates the write path, the publisher
//! projects state into CRDs, and the admission webhook dry-runs candidate
//! objects on every replica.

pub mod controller;
pub mod credentials;
pub mod debug;
pub mod leader;
pub mod orchestrator;
pub mod publisher;
pub mod watch;
pub mod webhook;

pub use controller::{Controller, ControllerSettings};
pub use orchestrator::{Orchestrator, State};

/// Result alias for controller operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Controller-level error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The `HAProxyTemplateConfig` cannot be parsed or converted.
    #[error("invalid controller config: {0}")]
    ConfigInvalid(#[from] htc_crd::SpecError),

    /// An informer failed its initial sync.
    #[error("watch init failed for {alias:?}: {message}")]
    WatchInit {
        /// Watched-resource alias
        alias: String,
        /// What went wrong
        message: String,
    },

    /// GVR discovery failed for a watched resource.
    #[error("cannot resolve {api_version}/{resources}: {message}")]
    Discovery {
        /// Declared apiVersion
        api_version: String,
        /// Declared plural
        resources: String,
        /// What went wrong
        message: String,
    },

    /// The credentials secret is missing or incomplete.
    #[error("credentials secret {name:?}: {message}")]
    Credentials {
        /// Secret name
        name: String,
        /// Which key is missing or unreadable
        message: String,
    },

    /// Webhook TLS material is missing or expired.
    #[error("webhook certificate: {0}")]
    WebhookCert(String),

    #[error(transparent)]
    Render(#[from] htc_render::Error),

    #[error(transparent)]
    Validation(#[from] htc_validate::Error),

    #[error(transparent)]
    Sync(#[from] htc_sync::Error),

    #[error(transparent)]
    Core(#[from] htc_core::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
