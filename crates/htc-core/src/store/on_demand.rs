//! On-demand backend with a TTL payload cache
//!
//! Keeps only `(namespace, name, keys)` references in memory and pulls
//! payloads through a [`ResourceFetcher`] when a template actually asks for
//! them. Suited to high-cardinality kinds (EndpointSlices in a large
//! cluster) where a full mirror would dominate controller memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{check_arity, check_prefix_arity, sort_snapshot, Store};
use crate::error::Result;
use crate::resource::WatchedObject;

/// Pulls a payload from the API server for the on-demand backend.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetch the current object, or `None` if it no longer exists.
    async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<WatchedObject>>;
}

type Ident = (String, String);

struct CacheEntry {
    payload: Arc<WatchedObject>,
    expires_at: Instant,
}

struct Inner {
    refs: HashMap<Vec<String>, Vec<Ident>>,
    cache: HashMap<Ident, CacheEntry>,
}

/// Reference-only store backend; cache misses cost one API round trip.
pub struct OnDemandStore {
    arity: usize,
    ttl: Duration,
    fetcher: Arc<dyn ResourceFetcher>,
    inner: RwLock<Inner>,
}

impl OnDemandStore {
    /// Create a store that resolves payloads through `fetcher`, caching
    /// each for `ttl` (reset on access).
    pub fn new(arity: usize, ttl: Duration, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self {
            arity,
            ttl,
            fetcher,
            inner: RwLock::new(Inner {
                refs: HashMap::new(),
                cache: HashMap::new(),
            }),
        }
    }

    /// Drop cache entries whose TTL has passed. Called periodically by the
    /// owning watcher.
    pub async fn evict_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.cache.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of currently cached payloads.
    pub async fn cached(&self) -> usize {
        self.inner.read().await.cache.len()
    }

    async fn resolve(&self, idents: Vec<Ident>) -> Result<Vec<Arc<WatchedObject>>> {
        let now = Instant::now();
        let mut found = Vec::with_capacity(idents.len());
        let mut misses = Vec::new();
        {
            let mut inner = self.inner.write().await;
            for ident in idents {
                match inner.cache.get_mut(&ident) {
                    Some(entry) if entry.expires_at > now => {
                        entry.expires_at = now + self.ttl;
                        found.push(Arc::clone(&entry.payload));
                    }
                    _ => misses.push(ident),
                }
            }
        }
        // Fetch outside the lock; cache hits for other callers proceed.
        for (namespace, name) in misses {
            let Some(payload) = self.fetcher.fetch(&namespace, &name).await? else {
                continue;
            };
            let payload = Arc::new(payload);
            let mut inner = self.inner.write().await;
            inner.cache.insert(
                (namespace, name),
                CacheEntry {
                    payload: Arc::clone(&payload),
                    expires_at: Instant::now() + self.ttl,
                },
            );
            found.push(payload);
        }
        sort_snapshot(&mut found);
        Ok(found)
    }
}

#[async_trait]
impl Store for OnDemandStore {
    fn arity(&self) -> usize {
        self.arity
    }

    async fn add(&self, payload: WatchedObject, keys: Vec<String>) -> Result<()> {
        check_arity(self.arity, keys.len())?;
        let ident = payload.ident();
        let mut inner = self.inner.write().await;
        let idents = inner.refs.entry(keys).or_default();
        if !idents.contains(&ident) {
            idents.push(ident);
        }
        Ok(())
    }

    async fn update(&self, payload: WatchedObject, keys: Vec<String>) -> Result<()> {
        check_arity(self.arity, keys.len())?;
        let ident = payload.ident();
        let mut inner = self.inner.write().await;
        let idents = inner.refs.entry(keys).or_default();
        if !idents.contains(&ident) {
            idents.push(ident.clone());
        }
        // The cached copy is stale now; next access re-fetches.
        inner.cache.remove(&ident);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        check_arity(self.arity, keys.len())?;
        let mut inner = self.inner.write().await;
        if let Some(idents) = inner.refs.remove(keys) {
            for ident in idents {
                inner.cache.remove(&ident);
            }
        }
        Ok(())
    }

    async fn delete_named(&self, keys: &[String], namespace: &str, name: &str) -> Result<()> {
        check_arity(self.arity, keys.len())?;
        let ident = (namespace.to_string(), name.to_string());
        let mut inner = self.inner.write().await;
        if let Some(idents) = inner.refs.get_mut(keys) {
            idents.retain(|i| i != &ident);
            if idents.is_empty() {
                inner.refs.remove(keys);
            }
        }
        inner.cache.remove(&ident);
        Ok(())
    }

    async fn get(&self, prefix: &[String]) -> Result<Vec<Arc<WatchedObject>>> {
        check_prefix_arity(self.arity, prefix.len())?;
        let idents: Vec<Ident> = {
            let inner = self.inner.read().await;
            if prefix.len() == self.arity {
                inner.refs.get(prefix).cloned().unwrap_or_default()
            } else {
                inner
                    .refs
                    .iter()
                    .filter(|(keys, _)| keys.starts_with(prefix))
                    .flat_map(|(_, idents)| idents.iter().cloned())
                    .collect()
            }
        };
        self.resolve(idents).await
    }

    async fn list(&self) -> Result<Vec<Arc<WatchedObject>>> {
        let idents: Vec<Ident> = {
            let inner = self.inner.read().await;
            inner.refs.values().flatten().cloned().collect()
        };
        self.resolve(idents).await
    }

    async fn snapshot(&self) -> Result<super::StoreSnapshot> {
        let refs: Vec<(Vec<String>, Ident)> = {
            let inner = self.inner.read().await;
            inner
                .refs
                .iter()
                .flat_map(|(keys, idents)| idents.iter().map(|i| (keys.clone(), i.clone())))
                .collect()
        };
        let mut snapshot = super::StoreSnapshot::new(self.arity);
        for (keys, ident) in refs {
            let resolved = self.resolve(vec![ident]).await?;
            for payload in resolved {
                snapshot.push(keys.clone(), payload);
            }
        }
        snapshot.sort();
        Ok(snapshot)
    }

    async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.refs.clear();
        inner.cache.clear();
    }

    async fn size(&self) -> usize {
        self.inner.read().await.refs.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use serde_json::json;

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResourceFetcher for CountingFetcher {
        async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<WatchedObject>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(WatchedObject::new(json!({
                "metadata": { "namespace": namespace, "name": name }
            }))))
        }
    }

    fn setup(ttl: Duration) -> (OnDemandStore, Arc<CountingFetcher>) {
        let fetcher = Arc::new(CountingFetcher { calls: AtomicUsize::new(0) });
        let store = OnDemandStore::new(1, ttl, Arc::clone(&fetcher) as Arc<dyn ResourceFetcher>);
        (store, fetcher)
    }

    fn obj(ns: &str, name: &str) -> WatchedObject {
        WatchedObject::new(json!({ "metadata": { "namespace": ns, "name": name } }))
    }

    #[tokio::test]
    async fn cache_hit_skips_fetch() {
        let (store, fetcher) = setup(Duration::from_secs(60));
        store.add(obj("default", "a"), vec!["svc".into()]).await.unwrap();

        let first = store.get(&["svc".into()]).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let second = store.get(&["svc".into()]).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_refetch_and_evict() {
        let (store, fetcher) = setup(Duration::from_secs(30));
        store.add(obj("default", "a"), vec!["svc".into()]).await.unwrap();
        store.get(&["svc".into()]).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        store.evict_expired().await;
        assert_eq!(store.cached().await, 0);

        store.get(&["svc".into()]).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn update_invalidates_cached_payload() {
        let (store, fetcher) = setup(Duration::from_secs(60));
        store.add(obj("default", "a"), vec!["svc".into()]).await.unwrap();
        store.get(&["svc".into()]).await.unwrap();
        store.update(obj("default", "a"), vec!["svc".into()]).await.unwrap();
        store.get(&["svc".into()]).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn size_counts_references_not_cache() {
        let (store, _) = setup(Duration::from_secs(60));
        store.add(obj("default", "a"), vec!["svc".into()]).await.unwrap();
        store.add(obj("default", "b"), vec!["svc".into()]).await.unwrap();
        assert_eq!(store.size().await, 2);
        assert_eq!(store.cached().await, 0);
    }
}
