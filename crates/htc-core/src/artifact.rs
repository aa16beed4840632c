//! Rendered configuration artifacts

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::checksum::content_checksum;

/// Everything one render pass produces. Immutable once constructed; the
/// orchestrator caches the last artifact and the publisher and synchronizer
/// only ever read it.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedArtifact {
    /// The main HAProxy configuration file.
    pub main_config: String,
    /// Rendered map files, keyed by map name.
    pub maps: BTreeMap<String, String>,
    /// Rendered general-purpose files, keyed by file name.
    pub files: BTreeMap<String, String>,
    /// Rendered SSL certificates (PEM), keyed by certificate name.
    pub certs: BTreeMap<String, String>,
    /// `sha256:<hex>` of the main configuration.
    pub checksum: String,
    /// When the render completed.
    pub rendered_at: DateTime<Utc>,
}

impl RenderedArtifact {
    /// Build an artifact, computing the main-config checksum.
    pub fn new(
        main_config: String,
        maps: BTreeMap<String, String>,
        files: BTreeMap<String, String>,
        certs: BTreeMap<String, String>,
    ) -> Self {
        let checksum = content_checksum(&main_config);
        Self {
            main_config,
            maps,
            files,
            certs,
            checksum,
            rendered_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_covers_main_config_only() {
        let a = RenderedArtifact::new("global\n".into(), BTreeMap::new(), BTreeMap::new(), BTreeMap::new());
        let mut maps = BTreeMap::new();
        maps.insert("hosts.map".to_string(), "example.com backend1\n".to_string());
        let b = RenderedArtifact::new("global\n".into(), maps, BTreeMap::new(), BTreeMap::new());
        assert_eq!(a.checksum, b.checksum);
    }
}
