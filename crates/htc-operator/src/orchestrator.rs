//! Reconciliation orchestrator
//!
//! A single consumer of the event bus driving the pipeline:
//! `Initializing → CachesSyncing → Idle → Rendering → Validating →
//! Publishing → Syncing → Idle`, with `Standby` for non-leaders.
//! `ResourcesChanged` bursts are coalesced through a debounce window; a
//! drift timer re-compares pods when nothing deployed for a while.
//! Losing the lease clears the cached render state before any further
//! write can happen.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use htc_core::{Event, EventBus, RenderedArtifact, Store, StoreSnapshot, Subscription};
use htc_crd::{HAProxyTemplateConfig, ValidationStatus};
use htc_dataplane::DataplaneClient;
use htc_haproxy::{Config, DataplaneVersion};
use htc_observability::ControllerMetrics;
use htc_render::Renderer;
use htc_sync::{SyncOutcome, Synchronizer};
use htc_validate::Validator;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::credentials::DataplaneCredentials;
use crate::debug::DebugState;
use crate::publisher::Publisher;
use crate::watch::{pod_endpoints, PodEndpoint, WatcherHandle};
use crate::Result;

const DATAPLANE_TIMEOUT: Duration = Duration::from_secs(10);

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Process started, nothing loaded yet
    Initializing,
    /// Waiting for every watcher's initial list
    CachesSyncing,
    /// Leader at rest
    Idle,
    /// Building snapshots and rendering templates
    Rendering,
    /// Running the three validation phases
    Validating,
    /// Writing output resources
    Publishing,
    /// Converging target pods
    Syncing,
    /// Not the leader
    Standby,
}

impl State {
    /// Losing the lease sends every state to `Standby`; active pipeline
    /// states are interrupted at their next suspension point.
    pub fn on_leadership_lost(self) -> Self {
        Self::Standby
    }

    /// Acquiring the lease resumes through a cache re-sync.
    pub fn on_leadership_acquired(self) -> Self {
        match self {
            Self::Standby | Self::Initializing => Self::CachesSyncing,
            other => other,
        }
    }
}

/// State shared between the controller, orchestrator and webhook refresh.
pub struct SharedState {
    /// Current controller config
    pub config: RwLock<Option<Arc<HAProxyTemplateConfig>>>,
    /// Live watchers by alias
    pub watchers: RwLock<BTreeMap<String, WatcherHandle>>,
    /// The built-in HAProxy pod store
    pub pod_store: Arc<htc_core::FullStore>,
    /// Dataplane credentials (absent until the secret loads)
    pub credentials: RwLock<Option<DataplaneCredentials>>,
}

struct CachedRender {
    artifact: RenderedArtifact,
    parsed: Config,
}

/// The single-consumer reconciliation loop.
pub struct Orchestrator {
    bus: EventBus,
    shared: Arc<SharedState>,
    publisher: Publisher,
    validator: Validator,
    renderer: Renderer,
    synchronizer: Arc<Synchronizer>,
    metrics: ControllerMetrics,
    is_leader: watch::Receiver<bool>,
    debug: Option<Arc<DebugState>>,
    state: State,
    cached: Option<CachedRender>,
}

impl Orchestrator {
    /// Wire up the orchestrator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: EventBus,
        shared: Arc<SharedState>,
        publisher: Publisher,
        validator: Validator,
        synchronizer: Arc<Synchronizer>,
        metrics: ControllerMetrics,
        is_leader: watch::Receiver<bool>,
        debug: Option<Arc<DebugState>>,
    ) -> Self {
        Self {
            bus,
            shared,
            publisher,
            validator,
            renderer: Renderer::new(),
            synchronizer,
            metrics,
            is_leader,
            debug,
            state: State::Initializing,
            cached: None,
        }
    }

    fn leader(&self) -> bool {
        *self.is_leader.borrow()
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "orchestrator transition");
            self.state = state;
        }
    }

    /// Run until the bus shuts down. `events` must have been subscribed
    /// before any component started publishing.
    pub async fn run(mut self, mut events: Subscription) {
        let mut render_deadline: Option<Instant> = None;
        let mut drift_deadline = Instant::now() + Duration::from_secs(60);

        loop {
            let config = self.shared.config.read().await.clone();
            let (debounce, drift_interval) = match &config {
                Some(config) => (
                    Duration::from_millis(config.spec.operational.debounce_millis),
                    Duration::from_secs(config.spec.operational.drift_prevention_interval_seconds),
                ),
                None => (Duration::from_millis(500), Duration::from_secs(60)),
            };
            // Copies for the select futures, so the arms can mutate the
            // originals.
            let current_render_deadline = render_deadline;
            let current_drift_deadline = drift_deadline;

            let debounce_fires = async move {
                match current_render_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                maybe_event = events.recv() => {
                    let Some(event) = maybe_event else { break };
                    if let Some(debug_state) = &self.debug {
                        debug_state.record_event(&event);
                    }
                    self.metrics.event_bus_subscribers.set(self.bus.subscriber_count() as i64);
                    self.handle_event(event, debounce, &mut render_deadline).await;
                }
                () = debounce_fires => {
                    render_deadline = None;
                    if self.leader() && self.caches_ready().await {
                        self.run_pipeline().await;
                        drift_deadline = Instant::now() + drift_interval;
                    }
                }
                () = tokio::time::sleep_until(current_drift_deadline) => {
                    if self.leader() && self.state == State::Idle && self.cached.is_some() {
                        self.drift_cycle().await;
                    }
                    drift_deadline = Instant::now() + drift_interval;
                }
            }
        }
    }

    async fn handle_event(
        &mut self,
        event: Event,
        debounce: Duration,
        render_deadline: &mut Option<Instant>,
    ) {
        match event {
            Event::ConfigLoaded { generation } => {
                info!(generation, "controller config (re)loaded");
                if self.leader() {
                    *render_deadline = Some(Instant::now() + debounce);
                }
            }
            Event::ResourcesChanged { alias } => {
                debug!(alias, "resources changed");
                if self.leader() && self.state != State::Standby {
                    // Coalesce bursts into one render.
                    *render_deadline = Some(Instant::now() + debounce);
                }
            }
            Event::AcquiredLeadership => {
                self.set_state(self.state.on_leadership_acquired());
                if self.caches_ready().await {
                    self.set_state(State::Idle);
                }
                *render_deadline = Some(Instant::now() + debounce);
            }
            Event::LostLeadership => {
                // Observe the loss before any further write: drop cached
                // render state and stop scheduling work.
                self.cached = None;
                *render_deadline = None;
                self.set_state(self.state.on_leadership_lost());
            }
            Event::HAProxyPodTerminated { pod } => {
                self.synchronizer.gate().forget(&pod);
                if self.leader() {
                    if let Some(config) = self.shared.config.read().await.clone() {
                        if let Err(e) = self.publisher.remove_pod(&config, &pod).await {
                            warn!(pod, error = %e, "failed to clean up terminated pod status");
                        }
                    }
                }
            }
            // Events this loop publishes itself carry no transitions here.
            _ => {}
        }
    }

    async fn caches_ready(&mut self) -> bool {
        let watchers = self.shared.watchers.read().await;
        let all_synced = watchers.values().all(|w| *w.synced.borrow());
        drop(watchers);
        if all_synced {
            if self.state == State::CachesSyncing {
                self.set_state(State::Idle);
            }
            true
        } else {
            self.set_state(State::CachesSyncing);
            false
        }
    }

    async fn snapshots(&self) -> Result<BTreeMap<String, StoreSnapshot>> {
        let watchers = self.shared.watchers.read().await;
        let mut snapshots = BTreeMap::new();
        for (alias, handle) in watchers.iter() {
            snapshots.insert(alias.clone(), handle.store.snapshot().await?);
        }
        Ok(snapshots)
    }

    async fn run_pipeline(&mut self) {
        let Some(config) = self.shared.config.read().await.clone() else {
            return;
        };
        self.metrics.reconciliations_total.inc();
        let timer = self
            .metrics
            .reconciliation_duration_seconds
            .with_label_values(&["pipeline"])
            .start_timer();

        self.set_state(State::Rendering);
        let outcome = self.render_validate_publish(&config).await;
        match outcome {
            Ok((artifact, parsed)) => {
                self.set_state(State::Syncing);
                self.sync_pods(&config, &artifact, &parsed).await;
                self.cached = Some(CachedRender { artifact, parsed });
            }
            Err(e) => {
                self.metrics.reconciliation_errors_total.with_label_values(&["pipeline"]).inc();
                error!(error = %e, "reconcile cycle failed");
            }
        }
        timer.observe_duration();
        if self.state != State::Standby {
            self.set_state(State::Idle);
        }
    }

    async fn render_validate_publish(
        &mut self,
        config: &Arc<HAProxyTemplateConfig>,
    ) -> Result<(RenderedArtifact, Config)> {
        let spec = &config.spec;
        spec.validate()?;

        let snapshots = self.snapshots().await?;
        let pods_snapshot = self.shared.pod_store.snapshot().await?;

        let artifact = match self.renderer.render(spec, &snapshots, &pods_snapshot) {
            Ok(artifact) => artifact,
            Err(e) => {
                self.fail_validation(config, "render", &e.to_string()).await;
                return Err(e.into());
            }
        };
        self.bus.publish(Event::TemplateRendered { checksum: artifact.checksum.clone() });
        if let Some(debug_state) = &self.debug {
            *debug_state.rendered.write().await = Some(artifact.clone());
        }

        self.set_state(State::Validating);
        self.metrics.validations_total.inc();
        let version = self.dataplane_version(spec).await;
        let parsed = match self
            .validator
            .validate(&artifact, &spec.operational.resource_dirs, version)
            .await
        {
            Ok(parsed) => parsed,
            Err(e) => {
                let phase = validation_phase(&e);
                self.metrics.record_validation_error(phase);
                self.fail_validation(config, phase, &e.to_string()).await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.validator.run_validation_tests(spec, &pods_snapshot) {
            self.metrics.record_validation_error("tests");
            self.fail_validation(config, "tests", &e.to_string()).await;
            return Err(e.into());
        }
        self.bus.publish(Event::ValidationCompleted { checksum: artifact.checksum.clone() });

        self.set_state(State::Publishing);
        match self
            .publisher
            .publish_valid(
                config,
                &artifact,
                &spec.operational.resource_dirs.maps_dir,
                &spec.operational.resource_dirs.config_file,
            )
            .await
        {
            Ok(()) => {
                self.bus.publish(Event::ConfigPublished { checksum: artifact.checksum.clone() });
            }
            Err(e) => {
                self.bus.publish(Event::ConfigPublishFailed { error: e.to_string() });
                return Err(e);
            }
        }
        if let Err(e) =
            self.publisher.update_config_status(config, ValidationStatus::Valid, None).await
        {
            warn!(error = %e, "failed to update config status");
        }

        Ok((artifact, parsed))
    }

    async fn fail_validation(
        &self,
        config: &Arc<HAProxyTemplateConfig>,
        phase: &str,
        error_text: &str,
    ) {
        warn!(phase, "validation failed: {error_text}");
        self.bus.publish(Event::ValidationFailed { error: error_text.to_string() });
        if let Err(e) = self.publisher.publish_invalid(config, error_text).await {
            warn!(error = %e, "failed to publish invalid runtime config");
        }
        if let Err(e) = self
            .publisher
            .update_config_status(
                config,
                ValidationStatus::Invalid,
                Some(error_text.to_string()),
            )
            .await
        {
            warn!(error = %e, "failed to update config status");
        }
    }

    async fn dataplane_version(&self, spec: &htc_crd::HAProxyTemplateConfigSpec) -> DataplaneVersion {
        let endpoints = pod_endpoints(&self.shared.pod_store).await;
        let Some(endpoint) = endpoints.first() else {
            return DataplaneVersion::OLDEST;
        };
        let Some(client) =
            self.dataplane_client(spec, endpoint, DataplaneVersion::OLDEST).await
        else {
            return DataplaneVersion::OLDEST;
        };
        match client.haproxy_version().await {
            Ok(version) => DataplaneVersion::from_haproxy_version(&version),
            Err(_) => DataplaneVersion::OLDEST,
        }
    }

    async fn dataplane_client(
        &self,
        spec: &htc_crd::HAProxyTemplateConfigSpec,
        endpoint: &PodEndpoint,
        version: DataplaneVersion,
    ) -> Option<DataplaneClient> {
        let credentials = self.shared.credentials.read().await.clone()?;
        DataplaneClient::new(
            &endpoint.ip,
            spec.operational.dataplane_port,
            credentials.production,
            version,
            DATAPLANE_TIMEOUT,
        )
        .ok()
    }

    async fn sync_pods(
        &mut self,
        config: &Arc<HAProxyTemplateConfig>,
        artifact: &RenderedArtifact,
        parsed: &Config,
    ) {
        let spec = &config.spec;
        let endpoints = pod_endpoints(&self.shared.pod_store).await;
        if endpoints.is_empty() {
            debug!("no target pods selected, skipping sync");
            return;
        }
        let version = self.dataplane_version(spec).await;
        for endpoint in endpoints {
            // Leadership is re-checked before each pod so a lost lease
            // stops the write path mid-fleet.
            if !self.leader() {
                warn!("leadership lost during sync, aborting remaining pods");
                self.set_state(State::Standby);
                self.cached = None;
                return;
            }
            let Some(client) = self.dataplane_client(spec, &endpoint, version).await else {
                warn!(pod = %endpoint.name, "no dataplane credentials loaded, skipping pod");
                continue;
            };
            match self
                .synchronizer
                .sync_pod_with_backoff(&client, &endpoint.name, parsed, artifact)
                .await
            {
                Ok(report) => {
                    self.metrics.record_deployment(
                        &endpoint.name,
                        outcome_label(report.outcome),
                        report.duration.as_secs_f64(),
                    );
                    if matches!(report.outcome, SyncOutcome::Applied | SyncOutcome::RawPushed) {
                        self.bus.publish(Event::ConfigAppliedToPod {
                            pod: endpoint.name.clone(),
                            checksum: report.checksum.clone(),
                        });
                    }
                    if let Err(e) = self.publisher.record_pod_report(config, &report).await {
                        warn!(pod = %endpoint.name, error = %e, "failed to record pod status");
                    }
                }
                Err(e) => {
                    // One failing pod must not abort the rest of the fleet.
                    self.metrics.record_deployment_error(&endpoint.name);
                    error!(pod = %endpoint.name, error = %e, "pod sync failed");
                    if let Err(pe) =
                        self.publisher.record_pod_error(config, &endpoint.name, &e.to_string()).await
                    {
                        warn!(pod = %endpoint.name, error = %pe, "failed to record pod error");
                    }
                }
            }
        }
    }

    async fn drift_cycle(&mut self) {
        let Some(config) = self.shared.config.read().await.clone() else {
            return;
        };
        let Some(cached) = self.cached.take() else {
            return;
        };
        debug!("drift prevention cycle");
        self.set_state(State::Syncing);
        self.sync_pods(&config, &cached.artifact, &cached.parsed).await;
        if self.state != State::Standby {
            self.cached = Some(cached);
            self.set_state(State::Idle);
        }
    }
}

fn outcome_label(outcome: SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::Skipped => "skipped",
        SyncOutcome::Converged => "converged",
        SyncOutcome::Applied => "applied",
        SyncOutcome::RawPushed => "raw_pushed",
    }
}

fn validation_phase(error: &htc_validate::Error) -> &'static str {
    match error {
        htc_validate::Error::Syntax { .. } => "syntax",
        htc_validate::Error::Schema { .. } => "schema",
        htc_validate::Error::Semantic { .. } => "semantic",
        htc_validate::Error::Test { .. } => "tests",
        htc_validate::Error::Setup(_) | htc_validate::Error::Io(_) => "setup",
    }
}
