//! Dataplane API version handling

use std::fmt;

/// Supported Dataplane API versions. Selected from the HAProxy version
/// string reported by the pod; unknown or unparsable versions fall back to
/// the oldest supported release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataplaneVersion {
    /// HAProxy 3.0
    V3_0,
    /// HAProxy 3.1
    V3_1,
    /// HAProxy 3.2
    V3_2,
}

impl DataplaneVersion {
    /// Oldest supported version, the fallback for unknown releases.
    pub const OLDEST: Self = Self::V3_0;

    /// Map a HAProxy version string (e.g. `3.1.2-abcdef`) to the matching
    /// API version.
    pub fn from_haproxy_version(version: &str) -> Self {
        let mut parts = version.split(['.', '-']);
        let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        match (major, minor) {
            (3, 0) => Self::V3_0,
            (3, 1) => Self::V3_1,
            (3, minor) if minor >= 2 => Self::V3_2,
            (major, _) if major > 3 => Self::V3_2,
            _ => Self::OLDEST,
        }
    }

    /// Whether crt-store sections can be managed inside transactions.
    pub fn supports_transactional_crt_stores(self) -> bool {
        self >= Self::V3_2
    }

    /// Whether map file entries can be changed at runtime without a reload.
    pub fn supports_runtime_maps(self) -> bool {
        // Runtime map updates exist across all supported versions.
        true
    }
}

impl fmt::Display for DataplaneVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V3_0 => write!(f, "3.0"),
            Self::V3_1 => write!(f, "3.1"),
            Self::V3_2 => write!(f, "3.2"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_versions() {
        assert_eq!(DataplaneVersion::from_haproxy_version("3.0.5"), DataplaneVersion::V3_0);
        assert_eq!(DataplaneVersion::from_haproxy_version("3.1.2-d5f8a9"), DataplaneVersion::V3_1);
        assert_eq!(DataplaneVersion::from_haproxy_version("3.2.0"), DataplaneVersion::V3_2);
        assert_eq!(DataplaneVersion::from_haproxy_version("3.4.1"), DataplaneVersion::V3_2);
    }

    #[test]
    fn unknown_versions_fall_back_to_oldest() {
        assert_eq!(DataplaneVersion::from_haproxy_version("2.8.1"), DataplaneVersion::OLDEST);
        assert_eq!(DataplaneVersion::from_haproxy_version("garbage"), DataplaneVersion::OLDEST);
    }

    #[test]
    fn capability_table_is_version_dependent() {
        assert!(!DataplaneVersion::V3_0.supports_transactional_crt_stores());
        assert!(DataplaneVersion::V3_2.supports_transactional_crt_stores());
    }
}
