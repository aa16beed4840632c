//! Content digests in the `sha256:<hex>` format used across the CRDs

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the input.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Digest in the `sha256:<hex>` form carried by `HAProxyCfg` and
/// `HAProxyMapFile` specs and compared against per-pod deployment status.
pub fn content_checksum(content: &str) -> String {
    format!("sha256:{}", sha256_hex(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_has_prefix_and_hex_digest() {
        let sum = content_checksum("global\n  maxconn 2000\n");
        assert!(sum.starts_with("sha256:"));
        assert_eq!(sum.len(), "sha256:".len() + 64);
    }

    #[test]
    fn checksum_is_stable() {
        assert_eq!(content_checksum("abc"), content_checksum("abc"));
        assert_ne!(content_checksum("abc"), content_checksum("abd"));
    }
}
