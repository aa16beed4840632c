//! Dynamic watchers feeding the indexed stores
//!
//! One watcher task per declared watched resource, addressed by GVR
//! through API discovery, plus a built-in typed Pod watcher over the
//! config's pod selector. Each event prunes ignored fields, extracts the
//! `indexBy` key tuple, updates the store and publishes a coalesced
//! `ResourcesChanged(alias)` signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use htc_core::{
    Event, EventBus, FullStore, OnDemandStore, ResourceFetcher, Store, WatchedObject,
};
use htc_crd::{StoreStrategy, WatchedResource};
use htc_observability::ControllerMetrics;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio::sync::watch as watch_channel;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

/// A running watcher with its store and sync signal.
pub struct WatcherHandle {
    /// Alias the resource kind is exposed under
    pub alias: String,
    /// The store this watcher maintains
    pub store: Arc<dyn Store>,
    /// Flips to `true` once the initial list completed
    pub synced: watch_channel::Receiver<bool>,
    task: JoinHandle<()>,
    eviction: Option<JoinHandle<()>>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
        if let Some(eviction) = &self.eviction {
            eviction.abort();
        }
    }
}

/// Resolve the declared `apiVersion`/`resources` pair to an
/// [`ApiResource`] via discovery.
pub async fn resolve_api_resource(
    client: &Client,
    watched: &WatchedResource,
) -> Result<ApiResource> {
    let (group, version) = match watched.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", watched.api_version.as_str()),
    };
    let apigroup =
        kube::discovery::group(client, group).await.map_err(|e| Error::Discovery {
            api_version: watched.api_version.clone(),
            resources: watched.resources.clone(),
            message: e.to_string(),
        })?;
    apigroup
        .versioned_resources(version)
        .into_iter()
        .map(|(ar, _caps)| ar)
        .find(|ar| ar.plural == watched.resources)
        .ok_or_else(|| Error::Discovery {
            api_version: watched.api_version.clone(),
            resources: watched.resources.clone(),
            message: "no such resource in discovery".to_string(),
        })
}

struct DynamicFetcher {
    client: Client,
    ar: ApiResource,
}

#[async_trait]
impl ResourceFetcher for DynamicFetcher {
    async fn fetch(&self, namespace: &str, name: &str) -> htc_core::Result<Option<WatchedObject>> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.ar);
        match api.get_opt(name).await {
            Ok(Some(obj)) => {
                let value = serde_json::to_value(&obj)?;
                Ok(Some(WatchedObject::new(value)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(htc_core::Error::Fetch {
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

fn build_store(
    client: &Client,
    ar: &ApiResource,
    watched: &WatchedResource,
    ignore_fields: &[String],
) -> (Arc<dyn Store>, Option<JoinHandle<()>>) {
    let arity = watched.index_by.len();
    match watched.store {
        StoreStrategy::Full => {
            (Arc::new(FullStore::new(arity, ignore_fields.to_vec())), None)
        }
        StoreStrategy::OnDemand => {
            let ttl = Duration::from_secs(watched.cache_ttl_seconds);
            let store = Arc::new(OnDemandStore::new(
                arity,
                ttl,
                Arc::new(DynamicFetcher { client: client.clone(), ar: ar.clone() }),
            ));
            // Periodic eviction so payloads nobody reads fall out of the
            // cache.
            let eviction_store = Arc::clone(&store);
            let eviction = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ttl);
                loop {
                    ticker.tick().await;
                    eviction_store.evict_expired().await;
                }
            });
            (store, Some(eviction))
        }
    }
}

/// Spawn the watcher task for one watched resource.
pub async fn spawn_watcher(
    client: &Client,
    alias: &str,
    watched: &WatchedResource,
    ignore_fields: &[String],
    bus: EventBus,
    metrics: ControllerMetrics,
) -> Result<WatcherHandle> {
    let ar = resolve_api_resource(client, watched).await?;
    let (store, eviction) = build_store(client, &ar, watched, ignore_fields);

    let api: Api<DynamicObject> = match &watched.namespace_selector {
        Some(namespace) => Api::namespaced_with(client.clone(), namespace, &ar),
        None => Api::all_with(client.clone(), &ar),
    };
    let mut config = watcher::Config::default();
    if let Some(labels) = &watched.label_selector {
        config = config.labels(labels);
    }
    if let Some(fields) = &watched.field_selector {
        config = config.fields(fields);
    }

    let (synced_tx, synced_rx) = watch_channel::channel(false);
    let task = tokio::spawn(watch_loop(
        api,
        config,
        alias.to_string(),
        Arc::clone(&store),
        watched.index_by.clone(),
        ignore_fields.to_vec(),
        bus,
        metrics,
        synced_tx,
    ));

    Ok(WatcherHandle { alias: alias.to_string(), store, synced: synced_rx, task, eviction })
}

#[allow(clippy::too_many_arguments)]
async fn watch_loop(
    api: Api<DynamicObject>,
    config: watcher::Config,
    alias: String,
    store: Arc<dyn Store>,
    index_by: Vec<String>,
    ignore_fields: Vec<String>,
    bus: EventBus,
    metrics: ControllerMetrics,
    synced: watch_channel::Sender<bool>,
) {
    // Identity -> last key tuple, so key changes and deletions find the
    // entry the object currently occupies.
    let mut known_keys: HashMap<(String, String), Vec<String>> = HashMap::new();
    let mut stream = std::pin::pin!(watcher(api, config));

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Restarted(objects)) => {
                store.clear().await;
                known_keys.clear();
                for object in objects {
                    ingest(&store, &index_by, &ignore_fields, &alias, &mut known_keys, object)
                        .await;
                }
                if !*synced.borrow() {
                    let count = store.size().await;
                    info!(alias, count, "initial list complete");
                    let _ = synced.send(true);
                }
                metrics.set_resource_count(&alias, store.size().await as i64);
                bus.publish(Event::ResourcesChanged { alias: alias.clone() });
            }
            Ok(watcher::Event::Applied(object)) => {
                ingest(&store, &index_by, &ignore_fields, &alias, &mut known_keys, object).await;
                metrics.set_resource_count(&alias, store.size().await as i64);
                bus.publish(Event::ResourcesChanged { alias: alias.clone() });
            }
            Ok(watcher::Event::Deleted(object)) => {
                let ident = (object.namespace().unwrap_or_default(), object.name_any());
                if let Some(keys) = known_keys.remove(&ident) {
                    if let Err(e) = store.delete_named(&keys, &ident.0, &ident.1).await {
                        warn!(alias, error = %e, "store delete failed");
                    }
                }
                metrics.set_resource_count(&alias, store.size().await as i64);
                bus.publish(Event::ResourcesChanged { alias: alias.clone() });
            }
            Err(e) => {
                error!(alias, error = %e, "watch stream error, will resync");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn ingest(
    store: &Arc<dyn Store>,
    index_by: &[String],
    ignore_fields: &[String],
    alias: &str,
    known_keys: &mut HashMap<(String, String), Vec<String>>,
    object: DynamicObject,
) {
    let value = match serde_json::to_value(&object) {
        Ok(value) => value,
        Err(e) => {
            warn!(alias, error = %e, "cannot serialize watched object");
            return;
        }
    };
    let mut payload = WatchedObject::new(value);
    payload.prune_fields(ignore_fields);
    let ident = payload.ident();
    let keys = match payload.extract_keys(index_by) {
        Ok(keys) => keys,
        Err(e) => {
            debug!(alias, error = %e, "object not indexable, skipping");
            return;
        }
    };

    // Index keys may have moved (e.g. a label change); evict the stale slot.
    if let Some(previous) = known_keys.get(&ident) {
        if previous != &keys {
            if let Err(e) = store.delete_named(previous, &ident.0, &ident.1).await {
                warn!(alias, error = %e, "stale entry cleanup failed");
            }
        }
    }
    if let Err(e) = store.update(payload, keys.clone()).await {
        warn!(alias, error = %e, "store update failed");
        return;
    }
    known_keys.insert(ident, keys);
}

/// Spawn the built-in watcher over the target HAProxy pods. The store is
/// indexed by pod name; deletions additionally raise
/// `HAProxyPodTerminated`.
pub fn spawn_pod_watcher(
    client: &Client,
    namespace: &str,
    label_selector: String,
    bus: EventBus,
    metrics: ControllerMetrics,
) -> (Arc<FullStore>, watch_channel::Receiver<bool>, JoinHandle<()>) {
    let store = Arc::new(FullStore::new(1, Vec::new()));
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let config = watcher::Config::default().labels(&label_selector);
    let (synced_tx, synced_rx) = watch_channel::channel(false);

    let task_store = Arc::clone(&store);
    let task = tokio::spawn(async move {
        let mut stream = std::pin::pin!(watcher(api, config));
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Restarted(pods)) => {
                    task_store.clear().await;
                    for pod in pods {
                        ingest_pod(&task_store, pod).await;
                    }
                    if !*synced_tx.borrow() {
                        let _ = synced_tx.send(true);
                    }
                    metrics.set_resource_count("haproxy_pods", task_store.size().await as i64);
                    bus.publish(Event::ResourcesChanged { alias: "haproxy_pods".to_string() });
                }
                Ok(watcher::Event::Applied(pod)) => {
                    ingest_pod(&task_store, pod).await;
                    metrics.set_resource_count("haproxy_pods", task_store.size().await as i64);
                    bus.publish(Event::ResourcesChanged { alias: "haproxy_pods".to_string() });
                }
                Ok(watcher::Event::Deleted(pod)) => {
                    let name = pod.name_any();
                    let namespace = pod.namespace().unwrap_or_default();
                    let _ = task_store.delete_named(&[name.clone()], &namespace, &name).await;
                    metrics.set_resource_count("haproxy_pods", task_store.size().await as i64);
                    bus.publish(Event::HAProxyPodTerminated { pod: name });
                }
                Err(e) => {
                    error!(error = %e, "pod watch error, will resync");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    (store, synced_rx, task)
}

async fn ingest_pod(store: &Arc<FullStore>, pod: Pod) {
    let name = pod.name_any();
    let value = match serde_json::to_value(&pod) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "cannot serialize pod");
            return;
        }
    };
    if let Err(e) = store.update(WatchedObject::new(value), vec![name]).await {
        warn!(error = %e, "pod store update failed");
    }
}

/// A deployable endpoint extracted from the pod store.
#[derive(Debug, Clone, PartialEq)]
pub struct PodEndpoint {
    /// Pod name
    pub name: String,
    /// Pod IP
    pub ip: String,
}

/// Running pods with an assigned IP, in name order.
pub async fn pod_endpoints(store: &Arc<FullStore>) -> Vec<PodEndpoint> {
    let mut endpoints = Vec::new();
    if let Ok(pods) = store.list().await {
        for pod in pods {
            let Some(name) = pod.name() else { continue };
            let Some(ip) = pod.as_value().pointer("/status/podIP").and_then(|v| v.as_str())
            else {
                continue;
            };
            let deleted = pod.as_value().pointer("/metadata/deletionTimestamp").is_some();
            if !deleted {
                endpoints.push(PodEndpoint { name: name.to_string(), ip: ip.to_string() });
            }
        }
    }
    endpoints.sort_by(|a, b| a.name.cmp(&b.name));
    endpoints
}
