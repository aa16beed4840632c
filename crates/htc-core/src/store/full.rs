//! Full in-memory backend

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_arity, check_prefix_arity, sort_snapshot, Store};
use crate::error::Result;
use crate::resource::WatchedObject;

struct Inner {
    map: HashMap<Vec<String>, Vec<Arc<WatchedObject>>>,
    // Invalidated by every mutation; rebuilt lazily by list().
    list_cache: Option<Arc<Vec<Arc<WatchedObject>>>>,
}

/// Stores whole payloads, field-pruned on the way in.
///
/// Exact lookups are O(1); prefix lookups scan all key tuples.
pub struct FullStore {
    arity: usize,
    ignore_fields: Vec<String>,
    inner: RwLock<Inner>,
}

impl FullStore {
    /// Create a store indexed by `arity` key components. `ignore_fields`
    /// is the controller-wide strip list (e.g. `metadata.managedFields`).
    pub fn new(arity: usize, ignore_fields: Vec<String>) -> Self {
        Self {
            arity,
            ignore_fields,
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                list_cache: None,
            }),
        }
    }

    fn prune(&self, mut payload: WatchedObject) -> Arc<WatchedObject> {
        payload.prune_fields(&self.ignore_fields);
        Arc::new(payload)
    }
}

#[async_trait]
impl Store for FullStore {
    fn arity(&self) -> usize {
        self.arity
    }

    async fn add(&self, payload: WatchedObject, keys: Vec<String>) -> Result<()> {
        check_arity(self.arity, keys.len())?;
        let payload = self.prune(payload);
        let mut inner = self.inner.write().await;
        inner.map.entry(keys).or_default().push(payload);
        inner.list_cache = None;
        Ok(())
    }

    async fn update(&self, payload: WatchedObject, keys: Vec<String>) -> Result<()> {
        check_arity(self.arity, keys.len())?;
        let payload = self.prune(payload);
        let ident = payload.ident();
        let mut inner = self.inner.write().await;
        let entries = inner.map.entry(keys).or_default();
        match entries.iter_mut().find(|e| e.ident() == ident) {
            Some(slot) => *slot = payload,
            None => entries.push(payload),
        }
        inner.list_cache = None;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        check_arity(self.arity, keys.len())?;
        let mut inner = self.inner.write().await;
        inner.map.remove(keys);
        inner.list_cache = None;
        Ok(())
    }

    async fn delete_named(&self, keys: &[String], namespace: &str, name: &str) -> Result<()> {
        check_arity(self.arity, keys.len())?;
        let mut inner = self.inner.write().await;
        if let Some(entries) = inner.map.get_mut(keys) {
            entries.retain(|e| {
                let (ns, n) = e.ident();
                !(ns == namespace && n == name)
            });
            if entries.is_empty() {
                inner.map.remove(keys);
            }
        }
        inner.list_cache = None;
        Ok(())
    }

    async fn get(&self, prefix: &[String]) -> Result<Vec<Arc<WatchedObject>>> {
        check_prefix_arity(self.arity, prefix.len())?;
        let inner = self.inner.read().await;
        let mut out = if prefix.len() == self.arity {
            inner.map.get(prefix).cloned().unwrap_or_default()
        } else {
            inner
                .map
                .iter()
                .filter(|(keys, _)| keys.starts_with(prefix))
                .flat_map(|(_, entries)| entries.iter().cloned())
                .collect()
        };
        drop(inner);
        sort_snapshot(&mut out);
        Ok(out)
    }

    async fn list(&self) -> Result<Vec<Arc<WatchedObject>>> {
        {
            let inner = self.inner.read().await;
            if let Some(cache) = &inner.list_cache {
                return Ok(cache.as_ref().clone());
            }
        }
        let mut inner = self.inner.write().await;
        let mut snapshot: Vec<_> = inner.map.values().flatten().cloned().collect();
        sort_snapshot(&mut snapshot);
        inner.list_cache = Some(Arc::new(snapshot.clone()));
        Ok(snapshot)
    }

    async fn snapshot(&self) -> Result<super::StoreSnapshot> {
        let inner = self.inner.read().await;
        let mut snapshot = super::StoreSnapshot::new(self.arity);
        for (keys, entries) in &inner.map {
            for entry in entries {
                snapshot.push(keys.clone(), Arc::clone(entry));
            }
        }
        drop(inner);
        snapshot.sort();
        Ok(snapshot)
    }

    async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.map.clear();
        inner.list_cache = None;
    }

    async fn size(&self) -> usize {
        self.inner.read().await.map.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(ns: &str, name: &str) -> WatchedObject {
        WatchedObject::new(json!({
            "metadata": { "namespace": ns, "name": name }
        }))
    }

    fn store() -> FullStore {
        FullStore::new(1, Vec::new())
    }

    #[tokio::test]
    async fn non_unique_keys_accumulate() {
        let store = store();
        for i in 1..=3 {
            store
                .add(obj("default", &format!("nginx-slice-{i}")), vec!["nginx".into()])
                .await
                .unwrap();
        }
        let entries = store.get(&["nginx".into()]).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name().unwrap().to_string()).collect();
        assert_eq!(names, vec!["nginx-slice-1", "nginx-slice-2", "nginx-slice-3"]);
    }

    #[tokio::test]
    async fn update_replaces_by_identity() {
        let store = store();
        store.add(obj("default", "a"), vec!["svc".into()]).await.unwrap();
        store.add(obj("default", "b"), vec!["svc".into()]).await.unwrap();

        let replacement = WatchedObject::new(json!({
            "metadata": { "namespace": "default", "name": "a", "labels": {"v": "2"} }
        }));
        store.update(replacement, vec!["svc".into()]).await.unwrap();

        let entries = store.get(&["svc".into()]).await.unwrap();
        assert_eq!(entries.len(), 2);
        let a = entries.iter().find(|e| e.name() == Some("a")).unwrap();
        assert_eq!(a.as_value().pointer("/metadata/labels/v"), Some(&json!("2")));
    }

    #[tokio::test]
    async fn update_appends_when_identity_absent() {
        let store = store();
        store.update(obj("default", "a"), vec!["svc".into()]).await.unwrap();
        assert_eq!(store.size().await, 1);
    }

    #[tokio::test]
    async fn prefix_get_is_superset_of_exact_get() {
        let store = FullStore::new(2, Vec::new());
        store
            .add(obj("default", "a"), vec!["default".into(), "a".into()])
            .await
            .unwrap();
        store
            .add(obj("default", "b"), vec!["default".into(), "b".into()])
            .await
            .unwrap();
        store
            .add(obj("other", "c"), vec!["other".into(), "c".into()])
            .await
            .unwrap();

        let exact = store.get(&["default".into(), "a".into()]).await.unwrap();
        let prefixed = store.get(&["default".into()]).await.unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(prefixed.len(), 2);
        for entry in &exact {
            assert!(prefixed.iter().any(|p| p.ident() == entry.ident()));
        }
    }

    #[tokio::test]
    async fn wrong_arity_is_rejected() {
        let store = FullStore::new(2, Vec::new());
        let err = store.add(obj("default", "a"), vec!["only-one".into()]).await.unwrap_err();
        assert!(matches!(err, crate::Error::WrongArity { expected: 2, got: 1 }));

        let err = store.get(&[]).await.unwrap_err();
        assert!(matches!(err, crate::Error::WrongArity { .. }));

        let err = store
            .get(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::WrongArity { .. }));
    }

    #[tokio::test]
    async fn delete_named_leaves_siblings() {
        let store = store();
        store.add(obj("default", "a"), vec!["svc".into()]).await.unwrap();
        store.add(obj("default", "b"), vec!["svc".into()]).await.unwrap();
        store.delete_named(&["svc".into()], "default", "a").await.unwrap();

        let entries = store.get(&["svc".into()]).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name(), Some("b"));
    }

    #[tokio::test]
    async fn delete_removes_all_at_keys() {
        let store = store();
        store.add(obj("default", "a"), vec!["svc".into()]).await.unwrap();
        store.add(obj("default", "b"), vec!["svc".into()]).await.unwrap();
        store.delete(&["svc".into()]).await.unwrap();
        assert_eq!(store.size().await, 0);
    }

    #[tokio::test]
    async fn list_cache_sees_mutations() {
        let store = store();
        store.add(obj("default", "a"), vec!["x".into()]).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
        // Cached snapshot must be invalidated by the next add.
        store.add(obj("default", "b"), vec!["y".into()]).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn payloads_are_pruned_on_ingest() {
        let store = FullStore::new(1, vec!["metadata.managedFields".into()]);
        let payload = WatchedObject::new(json!({
            "metadata": {
                "namespace": "default",
                "name": "a",
                "managedFields": [{"manager": "kubelet"}]
            }
        }));
        store.add(payload, vec!["x".into()]).await.unwrap();
        let entries = store.get(&["x".into()]).await.unwrap();
        assert!(entries[0].as_value().pointer("/metadata/managedFields").is_none());
    }
}
