//! Deployment admission
//!
//! A floor between successive deploys of the same artifact to the same pod.
//! A changed artifact deploys immediately; re-deploying the identical
//! artifact inside the window is vetoed so render storms cannot hammer the
//! Dataplane API.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct PodRecord {
    checksum: String,
    deployed_at: Instant,
}

/// Per-pod deploy bookkeeping.
pub struct DeployGate {
    min_interval: Duration,
    inner: Mutex<HashMap<String, PodRecord>>,
}

impl DeployGate {
    /// Gate with the configured minimum deploy interval.
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, inner: Mutex::new(HashMap::new()) }
    }

    /// Whether a sync of `checksum` to `pod` should be vetoed right now.
    pub fn should_skip(&self, pod: &str, checksum: &str) -> bool {
        let inner = self.inner.lock();
        match inner.get(pod) {
            Some(record) => {
                record.checksum == checksum && record.deployed_at.elapsed() < self.min_interval
            }
            None => false,
        }
    }

    /// Record a completed deploy.
    pub fn record(&self, pod: &str, checksum: &str) {
        self.inner.lock().insert(
            pod.to_string(),
            PodRecord { checksum: checksum.to_string(), deployed_at: Instant::now() },
        );
    }

    /// Checksum last deployed to `pod`, if any.
    pub fn last_checksum(&self, pod: &str) -> Option<String> {
        self.inner.lock().get(pod).map(|r| r.checksum.clone())
    }

    /// Drop bookkeeping for a terminated pod.
    pub fn forget(&self, pod: &str) {
        self.inner.lock().remove(pod);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_pod_is_never_skipped() {
        let gate = DeployGate::new(Duration::from_secs(5));
        assert!(!gate.should_skip("haproxy-0", "sha256:aa"));
    }

    #[test]
    fn same_checksum_inside_window_is_vetoed() {
        let gate = DeployGate::new(Duration::from_secs(60));
        gate.record("haproxy-0", "sha256:aa");
        assert!(gate.should_skip("haproxy-0", "sha256:aa"));
        // A different artifact deploys immediately.
        assert!(!gate.should_skip("haproxy-0", "sha256:bb"));
    }

    #[test]
    fn zero_interval_never_vetoes() {
        let gate = DeployGate::new(Duration::ZERO);
        gate.record("haproxy-0", "sha256:aa");
        assert!(!gate.should_skip("haproxy-0", "sha256:aa"));
    }

    #[test]
    fn forget_clears_the_record() {
        let gate = DeployGate::new(Duration::from_secs(60));
        gate.record("haproxy-0", "sha256:aa");
        gate.forget("haproxy-0");
        assert!(!gate.should_skip("haproxy-0", "sha256:aa"));
        assert_eq!(gate.last_checksum("haproxy-0"), None);
    }
}
