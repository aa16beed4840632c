//! Per-pod sync execution
//!
//! Owns the transaction lifecycle, the version-conflict retry loop and the
//! raw-push fallback. Per-pod attempts are serialized by a keyed mutex so
//! one pod never has two racing transactions from this process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use htc_core::RenderedArtifact;
use htc_crd::OperationSummary;
use htc_dataplane::{CommitOutcome, DataplaneClient, StorageKind, Transaction};
use htc_haproxy::Config;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::admission::DeployGate;
use crate::comparator::compare;
use crate::error::{Error, Result};
use crate::live;
use crate::plan::{OpKind, Operation};

/// The Dataplane surface the executor needs. [`DataplaneClient`]
/// implements it; tests drive the executor with a scripted stub.
#[async_trait]
pub trait DataplaneApi: Send + Sync {
    /// Current configuration version.
    async fn configuration_version(&self) -> htc_dataplane::Result<i64>;
    /// Open a transaction at `version`.
    async fn open_transaction(&self, version: i64) -> htc_dataplane::Result<Transaction>;
    /// Commit the transaction.
    async fn commit_transaction(&self, txn: &Transaction) -> htc_dataplane::Result<CommitOutcome>;
    /// Abort the transaction.
    async fn abort_transaction(&self, txn: &Transaction) -> htc_dataplane::Result<()>;
    /// Read the live configuration inside the transaction.
    async fn read_live(&self, txn: &Transaction) -> Result<Config>;
    /// Execute one structured operation inside the transaction.
    async fn apply(&self, op: &Operation, txn: &Transaction) -> htc_dataplane::Result<()>;
    /// Push the whole configuration, bypassing structured endpoints.
    async fn raw_push(&self, config: &str, version: i64) -> htc_dataplane::Result<CommitOutcome>;
    /// Upload auxiliary files (maps, certs, general storage); returns the
    /// number of API operations performed.
    async fn sync_auxiliary(&self, artifact: &RenderedArtifact) -> htc_dataplane::Result<u32>;
}

#[async_trait]
impl DataplaneApi for DataplaneClient {
    async fn configuration_version(&self) -> htc_dataplane::Result<i64> {
        Self::configuration_version(self).await
    }

    async fn open_transaction(&self, version: i64) -> htc_dataplane::Result<Transaction> {
        Self::open_transaction(self, version).await
    }

    async fn commit_transaction(&self, txn: &Transaction) -> htc_dataplane::Result<CommitOutcome> {
        Self::commit_transaction(self, txn).await
    }

    async fn abort_transaction(&self, txn: &Transaction) -> htc_dataplane::Result<()> {
        Self::abort_transaction(self, txn).await
    }

    async fn read_live(&self, txn: &Transaction) -> Result<Config> {
        live::read_live(self, txn).await
    }

    async fn apply(&self, op: &Operation, txn: &Transaction) -> htc_dataplane::Result<()> {
        match op.kind {
            OpKind::Create => {
                self.create(&op.path, op.body.as_ref().unwrap_or(&serde_json::Value::Null), txn)
                    .await
            }
            OpKind::Update => {
                self.replace(&op.path, op.body.as_ref().unwrap_or(&serde_json::Value::Null), txn)
                    .await
            }
            OpKind::Delete => self.remove(&op.path, txn).await,
        }
    }

    async fn raw_push(&self, config: &str, version: i64) -> htc_dataplane::Result<CommitOutcome> {
        Self::raw_push(self, config, version).await
    }

    async fn sync_auxiliary(&self, artifact: &RenderedArtifact) -> htc_dataplane::Result<u32> {
        let mut ops = 0;
        for (kind, files) in [
            (StorageKind::Map, &artifact.maps),
            (StorageKind::SslCertificate, &artifact.certs),
            (StorageKind::General, &artifact.files),
        ] {
            let live_names = self.list_storage(kind).await?;
            for (name, content) in files {
                self.put_storage(kind, name, content).await?;
                ops += 1;
            }
            for stale in live_names.iter().filter(|n| !files.contains_key(*n)) {
                self.delete_storage(kind, stale).await?;
                ops += 1;
            }
        }
        Ok(ops)
    }
}

/// How a sync attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Vetoed by the min-deploy interval; nothing touched.
    Skipped,
    /// Live state already matched; empty plan, no reload.
    Converged,
    /// Structured operations applied and committed.
    Applied,
    /// Whole config pushed through the raw endpoint.
    RawPushed,
}

/// Result of one per-pod sync attempt.
#[derive(Debug, Clone)]
pub struct PodSyncReport {
    /// Pod name
    pub pod: String,
    /// How the attempt ended
    pub outcome: SyncOutcome,
    /// Artifact checksum the pod now matches
    pub checksum: String,
    /// API operation counts
    pub summary: OperationSummary,
    /// Version-conflict retries consumed
    pub version_conflict_retries: u32,
    /// Whether the raw fallback was used
    pub fallback_used: bool,
    /// Whether HAProxy scheduled a reload
    pub reload_required: bool,
    /// Reload id, when a reload was scheduled
    pub reload_id: Option<String>,
    /// Wall-clock duration of the attempt
    pub duration: Duration,
}

/// Synchronizer tunables, taken from the operational config.
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// In-place retries on version conflicts
    pub max_version_conflict_retries: u32,
    /// Structured-operation budget before raw fallback
    pub max_structured_operations: usize,
    /// Floor between identical deploys to one pod
    pub min_deploy_interval: Duration,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            max_version_conflict_retries: 3,
            max_structured_operations: 50,
            min_deploy_interval: Duration::from_secs(5),
        }
    }
}

/// The per-pod differential synchronizer.
pub struct Synchronizer {
    config: SynchronizerConfig,
    gate: DeployGate,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Synchronizer {
    /// Build from tunables.
    pub fn new(config: SynchronizerConfig) -> Self {
        let gate = DeployGate::new(config.min_deploy_interval);
        Self { config, gate, locks: Mutex::new(HashMap::new()) }
    }

    /// The deploy gate (shared with pod-termination cleanup).
    pub fn gate(&self) -> &DeployGate {
        &self.gate
    }

    fn pod_lock(&self, pod: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(pod.to_string()).or_default())
    }

    /// Sync one pod, retrying the whole attempt with exponential backoff on
    /// transient Dataplane errors.
    pub async fn sync_pod_with_backoff(
        &self,
        api: &dyn DataplaneApi,
        pod: &str,
        desired: &Config,
        artifact: &RenderedArtifact,
    ) -> Result<PodSyncReport> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..ExponentialBackoff::default()
        };
        backoff::future::retry(policy, || async {
            self.sync_pod(api, pod, desired, artifact).await.map_err(|e| {
                if e.is_transient() {
                    warn!(pod, error = %e, "transient dataplane error, backing off");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    /// One sync attempt (with the in-place version-conflict retry loop).
    pub async fn sync_pod(
        &self,
        api: &dyn DataplaneApi,
        pod: &str,
        desired: &Config,
        artifact: &RenderedArtifact,
    ) -> Result<PodSyncReport> {
        let lock = self.pod_lock(pod);
        let _guard = lock.lock().await;
        let start = Instant::now();

        if self.gate.should_skip(pod, &artifact.checksum) {
            debug!(pod, "deploy vetoed by min-deploy interval");
            return Ok(self.report(pod, SyncOutcome::Skipped, artifact, OperationSummary::default(), 0, None, start));
        }

        let mut retries = 0u32;
        loop {
            let version = api.configuration_version().await?;
            let txn = api.open_transaction(version).await?;

            let live = match api.read_live(&txn).await {
                Ok(live) => live,
                Err(Error::Decode { path, message }) => {
                    warn!(pod, %path, %message, "live state undecodable, falling back to raw push");
                    let _ = api.abort_transaction(&txn).await;
                    return self.raw(api, pod, artifact, retries, start).await;
                }
                Err(e) => {
                    let _ = api.abort_transaction(&txn).await;
                    return Err(e);
                }
            };

            let plan = compare(desired, &live);
            if plan.is_empty() {
                let _ = api.abort_transaction(&txn).await;
                debug!(pod, checksum = %artifact.checksum, "live state already converged");
                return Ok(self.report(pod, SyncOutcome::Converged, artifact, OperationSummary::default(), retries, None, start));
            }
            if plan.requires_raw || plan.ops.len() > self.config.max_structured_operations {
                info!(
                    pod,
                    ops = plan.ops.len(),
                    requires_raw = plan.requires_raw,
                    "structured path abandoned, pushing raw configuration"
                );
                let _ = api.abort_transaction(&txn).await;
                return self.raw(api, pod, artifact, retries, start).await;
            }

            let mut conflicted = false;
            for op in &plan.ops {
                match api.apply(op, &txn).await {
                    Ok(()) => {}
                    Err(htc_dataplane::Error::VersionConflict { current }) => {
                        debug!(pod, current, element = %op.describe, "conflict mid-transaction");
                        conflicted = true;
                        break;
                    }
                    Err(e) => {
                        let _ = api.abort_transaction(&txn).await;
                        return Err(e.into());
                    }
                }
            }
            if conflicted {
                let _ = api.abort_transaction(&txn).await;
                retries += 1;
                if retries > self.config.max_version_conflict_retries {
                    return Err(Error::RetriesExhausted { retries });
                }
                continue;
            }

            match api.commit_transaction(&txn).await {
                Ok(outcome) => {
                    let mut summary = plan.summary();
                    let aux_ops = api.sync_auxiliary(artifact).await?;
                    summary.updates += aux_ops;
                    summary.total += aux_ops;
                    self.gate.record(pod, &artifact.checksum);
                    info!(
                        pod,
                        checksum = %artifact.checksum,
                        ops = summary.total,
                        reload = outcome.reload_required,
                        retries,
                        "configuration applied"
                    );
                    return Ok(self.report(pod, SyncOutcome::Applied, artifact, summary, retries, Some(outcome), start));
                }
                Err(htc_dataplane::Error::VersionConflict { current }) => {
                    debug!(pod, current, "commit hit a version conflict, reopening");
                    retries += 1;
                    if retries > self.config.max_version_conflict_retries {
                        return Err(Error::RetriesExhausted { retries });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read-only drift probe: open, read, compare, abort.
    pub async fn check_drift(
        &self,
        api: &dyn DataplaneApi,
        pod: &str,
        desired: &Config,
    ) -> Result<bool> {
        let lock = self.pod_lock(pod);
        let _guard = lock.lock().await;
        let version = api.configuration_version().await?;
        let txn = api.open_transaction(version).await?;
        let result = api.read_live(&txn).await.map(|live| !compare(desired, &live).is_empty());
        let _ = api.abort_transaction(&txn).await;
        result
    }

    async fn raw(
        &self,
        api: &dyn DataplaneApi,
        pod: &str,
        artifact: &RenderedArtifact,
        mut retries: u32,
        start: Instant,
    ) -> Result<PodSyncReport> {
        loop {
            let version = api.configuration_version().await?;
            match api.raw_push(&artifact.main_config, version).await {
                Ok(outcome) => {
                    let aux_ops = api.sync_auxiliary(artifact).await?;
                    let summary = OperationSummary::new(0, 1 + aux_ops, 0);
                    self.gate.record(pod, &artifact.checksum);
                    info!(pod, checksum = %artifact.checksum, "raw configuration pushed");
                    let mut report = self.report(pod, SyncOutcome::RawPushed, artifact, summary, retries, Some(outcome), start);
                    report.fallback_used = true;
                    return Ok(report);
                }
                Err(htc_dataplane::Error::VersionConflict { current }) => {
                    debug!(pod, current, "raw push hit a version conflict");
                    retries += 1;
                    if retries > self.config.max_version_conflict_retries {
                        return Err(Error::RetriesExhausted { retries });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        pod: &str,
        outcome: SyncOutcome,
        artifact: &RenderedArtifact,
        summary: OperationSummary,
        retries: u32,
        commit: Option<CommitOutcome>,
        start: Instant,
    ) -> PodSyncReport {
        PodSyncReport {
            pod: pod.to_string(),
            outcome,
            checksum: artifact.checksum.clone(),
            summary,
            version_conflict_retries: retries,
            fallback_used: false,
            reload_required: commit.as_ref().is_some_and(|c| c.reload_required),
            reload_id: commit.and_then(|c| c.reload_id),
            duration: start.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    use super::*;
    use htc_haproxy::parse;

    struct StubApi {
        live: Mutex<Config>,
        version: AtomicI64,
        commit_conflicts: AtomicU32,
        applied: Mutex<Vec<Operation>>,
        raw_pushes: AtomicU32,
        open_transactions: AtomicI64,
    }

    impl StubApi {
        fn with_live(live: Config) -> Self {
            Self {
                live: Mutex::new(live),
                version: AtomicI64::new(42),
                commit_conflicts: AtomicU32::new(0),
                applied: Mutex::new(Vec::new()),
                raw_pushes: AtomicU32::new(0),
                open_transactions: AtomicI64::new(0),
            }
        }
    }

    #[async_trait]
    impl DataplaneApi for StubApi {
        async fn configuration_version(&self) -> htc_dataplane::Result<i64> {
            Ok(self.version.load(Ordering::SeqCst))
        }

        async fn open_transaction(&self, version: i64) -> htc_dataplane::Result<Transaction> {
            self.open_transactions.fetch_add(1, Ordering::SeqCst);
            Ok(Transaction { id: format!("txn-{version}"), version })
        }

        async fn commit_transaction(
            &self,
            txn: &Transaction,
        ) -> htc_dataplane::Result<CommitOutcome> {
            self.open_transactions.fetch_sub(1, Ordering::SeqCst);
            if self.commit_conflicts.load(Ordering::SeqCst) > 0 {
                self.commit_conflicts.fetch_sub(1, Ordering::SeqCst);
                let current = self.version.fetch_add(1, Ordering::SeqCst) + 1;
                return Err(htc_dataplane::Error::VersionConflict { current });
            }
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = txn;
            Ok(CommitOutcome { version, reload_required: true, reload_id: Some("r1".into()) })
        }

        async fn abort_transaction(&self, _txn: &Transaction) -> htc_dataplane::Result<()> {
            self.open_transactions.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn read_live(&self, _txn: &Transaction) -> Result<Config> {
            Ok(self.live.lock().clone())
        }

        async fn apply(&self, op: &Operation, _txn: &Transaction) -> htc_dataplane::Result<()> {
            self.applied.lock().push(op.clone());
            Ok(())
        }

        async fn raw_push(
            &self,
            _config: &str,
            version: i64,
        ) -> htc_dataplane::Result<CommitOutcome> {
            self.raw_pushes.fetch_add(1, Ordering::SeqCst);
            Ok(CommitOutcome { version: version + 1, reload_required: true, reload_id: None })
        }

        async fn sync_auxiliary(&self, _artifact: &RenderedArtifact) -> htc_dataplane::Result<u32> {
            Ok(0)
        }
    }

    fn artifact(text: &str) -> RenderedArtifact {
        RenderedArtifact::new(text.to_string(), BTreeMap::new(), BTreeMap::new(), BTreeMap::new())
    }

    fn sync() -> Synchronizer {
        Synchronizer::new(SynchronizerConfig {
            min_deploy_interval: Duration::ZERO,
            ..SynchronizerConfig::default()
        })
    }

    const DESIRED_TEXT: &str = "global\n  maxconn 4000\n";

    #[tokio::test]
    async fn version_conflict_reopens_and_records_one_retry() {
        let desired = parse(DESIRED_TEXT).unwrap();
        let api = StubApi::with_live(parse("global\n  maxconn 2000\n").unwrap());
        api.commit_conflicts.store(1, Ordering::SeqCst);

        let report = sync()
            .sync_pod(&api, "haproxy-0", &desired, &artifact(DESIRED_TEXT))
            .await
            .unwrap();

        assert_eq!(report.outcome, SyncOutcome::Applied);
        assert_eq!(report.version_conflict_retries, 1);
        assert!(!report.fallback_used);
        assert_eq!(api.raw_pushes.load(Ordering::SeqCst), 0);
        // No dangling transactions on any path.
        assert_eq!(api.open_transactions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn conflicts_beyond_the_cap_fail_the_cycle() {
        let desired = parse(DESIRED_TEXT).unwrap();
        let api = StubApi::with_live(Config::default());
        api.commit_conflicts.store(10, Ordering::SeqCst);

        let err = sync()
            .sync_pod(&api, "haproxy-0", &desired, &artifact(DESIRED_TEXT))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { retries: 4 }));
    }

    #[tokio::test]
    async fn converged_pod_yields_empty_summary_and_no_reload() {
        let desired = parse(DESIRED_TEXT).unwrap();
        let api = StubApi::with_live(parse(DESIRED_TEXT).unwrap());

        let report = sync()
            .sync_pod(&api, "haproxy-0", &desired, &artifact(DESIRED_TEXT))
            .await
            .unwrap();

        assert_eq!(report.outcome, SyncOutcome::Converged);
        assert_eq!(report.summary.total, 0);
        assert!(!report.reload_required);
        assert!(report.reload_id.is_none());
        assert_eq!(api.open_transactions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_plans_fall_back_to_raw_push() {
        let desired = parse(DESIRED_TEXT).unwrap();
        let api = StubApi::with_live(Config::default());
        let synchronizer = Synchronizer::new(SynchronizerConfig {
            max_structured_operations: 0,
            min_deploy_interval: Duration::ZERO,
            ..SynchronizerConfig::default()
        });

        let report = synchronizer
            .sync_pod(&api, "haproxy-0", &desired, &artifact(DESIRED_TEXT))
            .await
            .unwrap();

        assert_eq!(report.outcome, SyncOutcome::RawPushed);
        assert!(report.fallback_used);
        assert_eq!(api.raw_pushes.load(Ordering::SeqCst), 1);
        assert!(api.applied.lock().is_empty());
    }

    #[tokio::test]
    async fn unstructured_config_falls_back_to_raw_push() {
        let text = "backend b\n  stick-table type ip size 1m\n  server s 10.0.0.1:80\n";
        let desired = parse(text).unwrap();
        let api = StubApi::with_live(Config::default());

        let report = sync().sync_pod(&api, "haproxy-0", &desired, &artifact(text)).await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::RawPushed);
        assert!(report.fallback_used);
    }

    #[tokio::test]
    async fn identical_redeploy_is_vetoed_inside_the_window() {
        let desired = parse(DESIRED_TEXT).unwrap();
        let api = StubApi::with_live(parse("global\n  maxconn 2000\n").unwrap());
        let synchronizer = Synchronizer::new(SynchronizerConfig {
            min_deploy_interval: Duration::from_secs(3600),
            ..SynchronizerConfig::default()
        });
        let art = artifact(DESIRED_TEXT);

        let first = synchronizer.sync_pod(&api, "haproxy-0", &desired, &art).await.unwrap();
        assert_eq!(first.outcome, SyncOutcome::Applied);

        let second = synchronizer.sync_pod(&api, "haproxy-0", &desired, &art).await.unwrap();
        assert_eq!(second.outcome, SyncOutcome::Skipped);
        assert_eq!(second.summary.total, 0);
    }

    #[tokio::test]
    async fn drift_check_is_read_only() {
        let desired = parse(DESIRED_TEXT).unwrap();
        let api = StubApi::with_live(parse("global\n  maxconn 2000\n").unwrap());

        let drifted = sync().check_drift(&api, "haproxy-0", &desired).await.unwrap();
        assert!(drifted);
        assert!(api.applied.lock().is_empty());
        assert_eq!(api.raw_pushes.load(Ordering::SeqCst), 0);
        assert_eq!(api.open_transactions.load(Ordering::SeqCst), 0);

        let api = StubApi::with_live(parse(DESIRED_TEXT).unwrap());
        assert!(!sync().check_drift(&api, "haproxy-0", &desired).await.unwrap());
    }

    #[tokio::test]
    async fn applied_ops_follow_plan_order() {
        let text = "global\n  maxconn 2000\nfrontend www\n  bind *:80\n  use_backend api if TRUE\nbackend api\n  server s1 10.0.0.1:80 check\n";
        let desired = parse(text).unwrap();
        let api = StubApi::with_live(Config::default());

        sync().sync_pod(&api, "haproxy-0", &desired, &artifact(text)).await.unwrap();
        let applied = api.applied.lock();
        let backend_pos = applied.iter().position(|op| op.path == "backends").unwrap();
        let rule_pos = applied
            .iter()
            .position(|op| op.path.contains("backend_switching_rules"))
            .unwrap();
        assert!(backend_pos < rule_pos);
    }
}
