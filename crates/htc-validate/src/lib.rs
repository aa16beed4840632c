//! Three-phase configuration validation
//!
//! Phase 1 parses the rendered text. Phase 2 checks every structural
//! element against the version-appropriate Dataplane schema document.
//! Phase 3 writes the artifacts into a filesystem sandbox and runs
//! `haproxy -c` — the binary check is the only globally serialized step;
//! phases 1 and 2 run freely per candidate.
//!
//! Any phase failure is terminal for the candidate. Configured validation
//! tests (template unit tests) run after phase 3.

pub mod error;
pub mod schema;
pub mod semantic;
pub mod tests_runner;

use std::collections::BTreeMap;
use std::path::PathBuf;

use htc_core::{RenderedArtifact, StoreSnapshot};
use htc_crd::{HAProxyTemplateConfigSpec, ResourceDirs};
use htc_haproxy::{Config, DataplaneVersion};
use tracing::debug;

pub use error::{Error, Result};
pub use semantic::Sandbox;

/// Validator for rendered artifacts.
#[derive(Debug, Clone)]
pub struct Validator {
    /// HAProxy binary used for the semantic check.
    pub haproxy_bin: String,
    /// Root the sandbox directory layout is created under. `/` on a
    /// controller pod with its own `/etc/haproxy`; a temp dir in tests.
    pub sandbox_root: PathBuf,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            haproxy_bin: "haproxy".to_string(),
            sandbox_root: PathBuf::from("/"),
        }
    }
}

impl Validator {
    /// Run phases 1–3. Returns the parsed configuration for the
    /// synchronizer to diff against.
    pub async fn validate(
        &self,
        artifact: &RenderedArtifact,
        dirs: &ResourceDirs,
        version: DataplaneVersion,
    ) -> Result<Config> {
        let config = htc_haproxy::parse(&artifact.main_config).map_err(Error::from_parse)?;
        debug!(checksum = %artifact.checksum, "phase 1 (syntax) passed");

        schema::check(&config, version)?;
        debug!(%version, "phase 2 (schema) passed");

        semantic::check(self, artifact, dirs).await?;
        debug!("phase 3 (semantic) passed");

        Ok(config)
    }

    /// Run the spec's template unit tests (fixture render + substring
    /// assertions). Used after a successful validation and by webhook
    /// dry-runs.
    pub fn run_validation_tests(
        &self,
        spec: &HAProxyTemplateConfigSpec,
        haproxy_pods: &StoreSnapshot,
    ) -> Result<()> {
        tests_runner::run(spec, haproxy_pods)
    }

    /// Validate a config file offline (the CLI `validate` subcommand):
    /// phases 1–3 over a bare artifact with no auxiliary files.
    pub async fn validate_offline(
        &self,
        main_config: String,
        dirs: &ResourceDirs,
    ) -> Result<Config> {
        let artifact = RenderedArtifact::new(
            main_config,
            BTreeMap::new(),
            BTreeMap::new(),
            BTreeMap::new(),
        );
        self.validate(&artifact, dirs, DataplaneVersion::OLDEST).await
    }
}
