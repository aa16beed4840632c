//! Store contract tests shared by both backends

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use htc_core::{FullStore, OnDemandStore, ResourceFetcher, Store, WatchedObject};
use serde_json::json;

struct EchoFetcher;

#[async_trait]
impl ResourceFetcher for EchoFetcher {
    async fn fetch(
        &self,
        namespace: &str,
        name: &str,
    ) -> htc_core::Result<Option<WatchedObject>> {
        Ok(Some(WatchedObject::new(json!({
            "metadata": { "namespace": namespace, "name": name }
        }))))
    }
}

fn slice(ns: &str, name: &str) -> WatchedObject {
    WatchedObject::new(json!({ "metadata": { "namespace": ns, "name": name } }))
}

fn backends() -> Vec<Arc<dyn Store>> {
    vec![
        Arc::new(FullStore::new(2, Vec::new())),
        Arc::new(OnDemandStore::new(2, Duration::from_secs(60), Arc::new(EchoFetcher))),
    ]
}

#[tokio::test]
async fn exact_get_is_a_subset_of_every_prefix_get() {
    for store in backends() {
        store
            .add(slice("default", "a"), vec!["default".into(), "a".into()])
            .await
            .unwrap();
        store
            .add(slice("default", "b"), vec!["default".into(), "b".into()])
            .await
            .unwrap();
        store
            .add(slice("other", "c"), vec!["other".into(), "c".into()])
            .await
            .unwrap();

        let exact = store.get(&["default".into(), "a".into()]).await.unwrap();
        let prefix = store.get(&["default".into()]).await.unwrap();
        for entry in &exact {
            assert!(
                prefix.iter().any(|p| p.ident() == entry.ident()),
                "exact result missing from prefix result"
            );
        }
        assert!(exact.len() <= prefix.len());
    }
}

#[tokio::test]
async fn multiple_slices_share_one_service_key() {
    // Three EndpointSlices indexed by the same service name.
    let store = FullStore::new(1, Vec::new());
    for i in 1..=3 {
        let slice = WatchedObject::new(json!({
            "metadata": {
                "namespace": "default",
                "name": format!("nginx-slice-{i}"),
                "labels": { "kubernetes.io/service-name": "nginx" },
            }
        }));
        let keys = slice
            .extract_keys(&["metadata.labels['kubernetes.io/service-name']".to_string()])
            .unwrap();
        store.add(slice, keys).await.unwrap();
    }

    let hits = store.get(&["nginx".into()]).await.unwrap();
    let names: Vec<_> = hits.iter().map(|h| h.name().unwrap().to_string()).collect();
    assert_eq!(names, vec!["nginx-slice-1", "nginx-slice-2", "nginx-slice-3"]);
}

#[tokio::test]
async fn snapshots_answer_the_same_queries_as_the_store() {
    for store in backends() {
        store
            .add(slice("default", "a"), vec!["default".into(), "a".into()])
            .await
            .unwrap();
        store
            .add(slice("other", "b"), vec!["other".into(), "b".into()])
            .await
            .unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), store.size().await);
        assert_eq!(
            snapshot.get(&["default".into()]).unwrap().len(),
            store.get(&["default".into()]).await.unwrap().len()
        );
        assert_eq!(snapshot.list().len(), store.list().await.unwrap().len());
    }
}
