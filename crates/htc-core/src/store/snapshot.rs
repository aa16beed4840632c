//! Materialized store state for synchronous consumers
//!
//! Rendering is CPU-bound and runs inline, so it cannot await store
//! lookups. A snapshot carries entries together with their key tuples and
//! answers the same `list`/`get` queries synchronously, in deterministic
//! `(namespace, name)` order.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::resource::WatchedObject;

/// One store's contents, frozen at render time.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    arity: usize,
    entries: Vec<(Vec<String>, Arc<WatchedObject>)>,
}

impl StoreSnapshot {
    /// Empty snapshot with the given key arity.
    pub fn new(arity: usize) -> Self {
        Self { arity, entries: Vec::new() }
    }

    /// Build from payloads by extracting keys with the `indexBy` list.
    /// Used for validation-test fixtures and webhook overlays.
    pub fn from_objects(index_by: &[String], objects: Vec<WatchedObject>) -> Result<Self> {
        let mut snapshot = Self::new(index_by.len());
        for object in objects {
            let keys = object.extract_keys(index_by)?;
            snapshot.push(keys, Arc::new(object));
        }
        snapshot.sort();
        Ok(snapshot)
    }

    /// Key arity.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Append an entry. Callers must [`sort`](Self::sort) before handing
    /// the snapshot to a renderer.
    pub fn push(&mut self, keys: Vec<String>, payload: Arc<WatchedObject>) {
        self.entries.push((keys, payload));
    }

    /// Establish the deterministic `(namespace, name)` order.
    pub fn sort(&mut self) {
        self.entries.sort_by_key(|(_, payload)| payload.ident());
    }

    /// All payloads.
    pub fn list(&self) -> Vec<Arc<WatchedObject>> {
        self.entries.iter().map(|(_, payload)| Arc::clone(payload)).collect()
    }

    /// Exact or prefix lookup, mirroring the async store contract.
    pub fn get(&self, prefix: &[String]) -> Result<Vec<Arc<WatchedObject>>> {
        if prefix.is_empty() || prefix.len() > self.arity {
            return Err(Error::WrongArity { expected: self.arity, got: prefix.len() });
        }
        Ok(self
            .entries
            .iter()
            .filter(|(keys, _)| keys.starts_with(prefix))
            .map(|(_, payload)| Arc::clone(payload))
            .collect())
    }

    /// Keep only entries the predicate accepts. Used by the admission
    /// webhook to overlay a candidate object into a frozen snapshot.
    pub fn retain(&mut self, mut keep: impl FnMut(&[String], &WatchedObject) -> bool) {
        self.entries.retain(|(keys, payload)| keep(keys, payload));
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
