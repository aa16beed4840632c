//! Controller assembly and lifecycle
//!
//! Builds every long-running task (config watcher, resource watchers,
//! leader elector, orchestrator, webhook, metrics/health servers) and
//! runs until a termination signal. The webhook and metrics endpoints run
//! on every replica; only the leader drives writes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use htc_core::{Event, EventBus, Store, StoreSnapshot};
use htc_crd::HAProxyTemplateConfig;
use htc_observability::{metrics_router, ControllerMetrics};
use htc_sync::{Synchronizer, SynchronizerConfig};
use htc_validate::Validator;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::credentials;
use crate::debug::DebugState;
use crate::leader;
use crate::orchestrator::{Orchestrator, SharedState};
use crate::publisher::Publisher;
use crate::watch::{spawn_pod_watcher, spawn_watcher};
use crate::webhook::{self, WebhookState};
use crate::{Error, Result};

/// Everything the `run` subcommand configures.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Namespace the controller operates in
    pub namespace: String,
    /// Name of the `HAProxyTemplateConfig` to drive
    pub config_name: String,
    /// Prometheus metrics port
    pub metrics_port: u16,
    /// Health/readiness port
    pub healthz_port: u16,
    /// Debug endpoints port; disabled when unset
    pub debug_port: Option<u16>,
    /// Bearer token guarding the debug endpoints
    pub debug_token: Option<String>,
    /// Admission webhook port
    pub webhook_port: u16,
    /// Secret carrying `tls.crt`/`tls.key`/`ca.crt` for the webhook
    pub webhook_tls_secret: String,
    /// Service name the webhook configuration points at
    pub webhook_service_name: String,
    /// Whether leader election is enabled
    pub leader_elect: bool,
    /// HAProxy binary for phase 3 validation
    pub haproxy_bin: String,
    /// Sandbox root for phase 3 validation
    pub sandbox_root: PathBuf,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            config_name: "haproxy-template-config".to_string(),
            metrics_port: 9090,
            healthz_port: 8080,
            debug_port: None,
            debug_token: None,
            webhook_port: 9443,
            webhook_tls_secret: "haproxy-template-controller-webhook-tls".to_string(),
            webhook_service_name: "haproxy-template-controller".to_string(),
            leader_elect: true,
            haproxy_bin: "haproxy".to_string(),
            sandbox_root: PathBuf::from("/"),
        }
    }
}

/// The assembled controller.
pub struct Controller {
    settings: ControllerSettings,
}

impl Controller {
    /// Build a controller from settings.
    pub fn new(settings: ControllerSettings) -> Self {
        Self { settings }
    }

    /// Run until SIGTERM/ctrl-c. Fatal init errors return `Err`.
    pub async fn run(self) -> Result<()> {
        let settings = self.settings;
        let client = Client::try_default().await?;
        let metrics = ControllerMetrics::new()?;
        let bus = EventBus::new();
        // Subscribe before anything publishes so no startup event is lost.
        let orchestrator_events = bus.subscribe(256);
        let webhook_events = bus.subscribe(256);

        info!(
            namespace = %settings.namespace,
            config = %settings.config_name,
            "starting haproxy-template-controller"
        );

        // The initial config gates everything else (leader election
        // parameters and the pod selector come from it).
        let initial = wait_for_config(&client, &settings.namespace, &settings.config_name).await?;
        initial.spec.validate()?;

        let (pod_store, _pods_synced, _pod_task) = spawn_pod_watcher(
            &client,
            &settings.namespace,
            initial.spec.pod_selector.to_label_selector(),
            bus.clone(),
            metrics.clone(),
        );

        let shared = Arc::new(SharedState {
            config: RwLock::new(Some(Arc::new(initial.clone()))),
            watchers: RwLock::new(BTreeMap::new()),
            pod_store,
            credentials: RwLock::new(None),
        });
        reconcile_watchers(&client, &shared, &initial, &bus, &metrics).await;
        reload_credentials(&client, &settings.namespace, &shared, &initial).await;

        // Leader election (parameters fixed at startup).
        let mut election = initial.spec.operational.leader_election.clone();
        election.enabled = election.enabled && settings.leader_elect;
        let identity = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| "haproxy-template-controller".to_string());
        let (is_leader, _leader_task) = leader::spawn(
            client.clone(),
            settings.namespace.clone(),
            identity,
            election,
            bus.clone(),
            metrics.clone(),
        );

        // Config watcher keeps the shared snapshot and watchers current.
        let _config_task = tokio::spawn(config_watch_loop(
            client.clone(),
            settings.namespace.clone(),
            settings.config_name.clone(),
            Arc::clone(&shared),
            bus.clone(),
            metrics.clone(),
        ));

        let validator = Validator {
            haproxy_bin: settings.haproxy_bin.clone(),
            sandbox_root: settings.sandbox_root.clone(),
        };

        // Admission webhook (every replica).
        let webhook_state = Arc::new(WebhookState {
            config: RwLock::new(Some(Arc::new(initial.clone()))),
            snapshots: RwLock::new(BTreeMap::new()),
            pods: RwLock::new(StoreSnapshot::new(1)),
            validator: validator.clone(),
        });
        let _webhook_refresh = tokio::spawn(webhook_refresh_loop(
            webhook_events,
            Arc::clone(&shared),
            Arc::clone(&webhook_state),
        ));
        let webhook_task = start_webhook(
            &client,
            &settings,
            &initial,
            Arc::clone(&webhook_state),
        )
        .await;
        if let Err(e) = &webhook_task {
            warn!(error = %e, "admission webhook unavailable");
        }

        // Metrics, health and debug servers.
        let _metrics_task = serve_router(
            metrics_router(metrics.clone()),
            SocketAddr::from(([0, 0, 0, 0], settings.metrics_port)),
        );
        let _healthz_task = serve_router(
            healthz_router(Arc::clone(&shared)),
            SocketAddr::from(([0, 0, 0, 0], settings.healthz_port)),
        );
        let debug_state = match (&settings.debug_port, &settings.debug_token) {
            (Some(port), Some(token)) => {
                let state = Arc::new(DebugState::new(token.clone()));
                *state.config.write().await = Some(Arc::new(initial.clone()));
                let _debug_task = serve_router(
                    crate::debug::router(Arc::clone(&state)),
                    SocketAddr::from(([0, 0, 0, 0], *port)),
                );
                Some(state)
            }
            _ => None,
        };

        let synchronizer = Arc::new(Synchronizer::new(SynchronizerConfig {
            max_version_conflict_retries: initial.spec.operational.max_version_conflict_retries,
            max_structured_operations: initial.spec.operational.max_structured_operations,
            min_deploy_interval: Duration::from_secs(
                initial.spec.operational.min_deploy_interval_seconds,
            ),
        }));

        let orchestrator = Orchestrator::new(
            bus.clone(),
            Arc::clone(&shared),
            Publisher::new(client.clone()),
            validator,
            synchronizer,
            metrics.clone(),
            is_leader,
            debug_state,
        );
        bus.publish(Event::ConfigLoaded {
            generation: initial.metadata.generation.unwrap_or_default(),
        });

        tokio::select! {
            () = orchestrator.run(orchestrator_events) => {
                error!("orchestrator loop terminated unexpectedly");
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "signal handler failed");
                }
                info!("termination signal received, shutting down");
            }
        }

        // The webhook configuration must not outlive its endpoint.
        webhook::remove_configuration(&client, &settings.config_name).await?;
        Ok(())
    }
}

async fn wait_for_config(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<HAProxyTemplateConfig> {
    let api: Api<HAProxyTemplateConfig> = Api::namespaced(client.clone(), namespace);
    loop {
        match api.get_opt(name).await? {
            Some(config) => return Ok(config),
            None => {
                info!(name, "waiting for HAProxyTemplateConfig to appear");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// Align running watchers with the declared watched resources.
async fn reconcile_watchers(
    client: &Client,
    shared: &Arc<SharedState>,
    config: &HAProxyTemplateConfig,
    bus: &EventBus,
    metrics: &ControllerMetrics,
) {
    let ignore_fields = &config.spec.operational.watched_resources_ignore_fields;
    let mut watchers = shared.watchers.write().await;
    watchers.retain(|alias, _| config.spec.watched_resources.contains_key(alias));
    for (alias, watched) in &config.spec.watched_resources {
        if watchers.contains_key(alias) {
            continue;
        }
        match spawn_watcher(client, alias, watched, ignore_fields, bus.clone(), metrics.clone())
            .await
        {
            Ok(handle) => {
                watchers.insert(alias.clone(), handle);
            }
            Err(e) => {
                error!(alias, error = %e, "failed to start watcher");
            }
        }
    }
}

async fn reload_credentials(
    client: &Client,
    namespace: &str,
    shared: &Arc<SharedState>,
    config: &HAProxyTemplateConfig,
) {
    match credentials::load(client, namespace, &config.spec.credentials).await {
        Ok(creds) => *shared.credentials.write().await = Some(creds),
        Err(e) => warn!(error = %e, "dataplane credentials unavailable"),
    }
}

async fn config_watch_loop(
    client: Client,
    namespace: String,
    name: String,
    shared: Arc<SharedState>,
    bus: EventBus,
    metrics: ControllerMetrics,
) {
    let api: Api<HAProxyTemplateConfig> = Api::namespaced(client.clone(), &namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let mut stream = std::pin::pin!(watcher(api, config));
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(loaded)) => {
                apply_config(&client, &namespace, &shared, &bus, &metrics, loaded).await;
            }
            Ok(watcher::Event::Restarted(list)) => {
                if let Some(loaded) = list.into_iter().find(|c| c.name_any() == name) {
                    apply_config(&client, &namespace, &shared, &bus, &metrics, loaded).await;
                }
            }
            Ok(watcher::Event::Deleted(_)) => {
                warn!(name, "controller config deleted");
                *shared.config.write().await = None;
                shared.watchers.write().await.clear();
            }
            Err(e) => {
                error!(error = %e, "config watch error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn apply_config(
    client: &Client,
    namespace: &str,
    shared: &Arc<SharedState>,
    bus: &EventBus,
    metrics: &ControllerMetrics,
    loaded: HAProxyTemplateConfig,
) {
    let generation = loaded.metadata.generation.unwrap_or_default();
    let previous_generation = shared
        .config
        .read()
        .await
        .as_ref()
        .and_then(|c| c.metadata.generation)
        .unwrap_or(-1);
    if generation == previous_generation {
        // Status-only update; nothing to re-render.
        return;
    }
    let loaded = Arc::new(loaded);
    *shared.config.write().await = Some(Arc::clone(&loaded));
    reconcile_watchers(client, shared, &loaded, bus, metrics).await;
    reload_credentials(client, namespace, shared, &loaded).await;
    bus.publish(Event::ConfigLoaded { generation });
}

/// Keep the webhook's frozen snapshots roughly current.
async fn webhook_refresh_loop(
    mut events: htc_core::Subscription,
    shared: Arc<SharedState>,
    webhook_state: Arc<WebhookState>,
) {
    while let Some(event) = events.recv().await {
        match event {
            Event::ResourcesChanged { .. } | Event::ConfigLoaded { .. } => {
                let watchers = shared.watchers.read().await;
                let mut snapshots = BTreeMap::new();
                for (alias, handle) in watchers.iter() {
                    if let Ok(snapshot) = handle.store.snapshot().await {
                        snapshots.insert(alias.clone(), snapshot);
                    }
                }
                drop(watchers);
                *webhook_state.snapshots.write().await = snapshots;
                if let Ok(pods) = shared.pod_store.snapshot().await {
                    *webhook_state.pods.write().await = pods;
                }
                *webhook_state.config.write().await = shared.config.read().await.clone();
            }
            _ => {}
        }
    }
}

async fn start_webhook(
    client: &Client,
    settings: &ControllerSettings,
    config: &HAProxyTemplateConfig,
    state: Arc<WebhookState>,
) -> Result<()> {
    let secret_api: Api<Secret> = Api::namespaced(client.clone(), &settings.namespace);
    let secret = secret_api
        .get_opt(&settings.webhook_tls_secret)
        .await?
        .ok_or_else(|| Error::WebhookCert(format!("secret {} not found", settings.webhook_tls_secret)))?;
    let (cert, key, ca) = tls_material(&secret)?;

    webhook::ensure_configuration(
        client,
        config,
        &settings.namespace,
        &settings.webhook_service_name,
        settings.webhook_port,
        &ca,
    )
    .await?;

    let (rotate_tx, rotate_rx) = mpsc::channel(4);
    // Certificate rotation: re-read the secret on change.
    let rotation_api = secret_api.clone();
    let secret_name = settings.webhook_tls_secret.clone();
    tokio::spawn(async move {
        let config =
            watcher::Config::default().fields(&format!("metadata.name={secret_name}"));
        let mut stream = std::pin::pin!(watcher(rotation_api, config));
        while let Some(event) = stream.next().await {
            if let Ok(watcher::Event::Applied(secret)) = event {
                if let Ok((cert, key, _ca)) = tls_material(&secret) {
                    let _ = rotate_tx.send((cert, key)).await;
                }
            }
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.webhook_port));
    tokio::spawn(async move {
        if let Err(e) = webhook::serve(state, addr, cert, key, rotate_rx).await {
            error!(error = %e, "webhook server failed");
        }
    });
    Ok(())
}

fn tls_material(secret: &Secret) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| Error::WebhookCert("TLS secret has no data".to_string()))?;
    let get = |key: &str| -> Result<Vec<u8>> {
        data.get(key)
            .map(|b| b.0.clone())
            .ok_or_else(|| Error::WebhookCert(format!("TLS secret missing key {key:?}")))
    };
    let cert = get("tls.crt")?;
    let key = get("tls.key")?;
    let ca = get("ca.crt").unwrap_or_else(|_| cert.clone());
    Ok((cert, key, ca))
}

fn healthz_router(shared: Arc<SharedState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/readyz",
            get(move || {
                let shared = Arc::clone(&shared);
                async move {
                    let watchers = shared.watchers.read().await;
                    let ready = watchers.values().all(|w| *w.synced.borrow());
                    if ready {
                        (axum::http::StatusCode::OK, "ready")
                    } else {
                        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "caches syncing")
                    }
                }
            }),
        )
}

fn serve_router(router: Router, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(%addr, "http endpoint listening");
                if let Err(e) = axum::serve(listener, router).await {
                    error!(%addr, error = %e, "http endpoint failed");
                }
            }
            Err(e) => error!(%addr, error = %e, "cannot bind http endpoint"),
        }
    })
}
