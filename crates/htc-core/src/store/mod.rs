//! Indexed resource stores
//!
//! Watchers index resources by user-declared JSONPath tuples; templates read
//! them back with exact or prefix lookups. Keys are non-unique (several
//! EndpointSlices share one service name), so identity for update and
//! targeted delete is the payload's `(namespace, name)`, never the keys.
//!
//! Two backends share one contract: [`FullStore`] keeps field-pruned payloads
//! in memory, [`OnDemandStore`] keeps only references and fetches payloads
//! through a [`ResourceFetcher`] with a TTL cache.

mod full;
mod on_demand;
mod snapshot;

use std::sync::Arc;

use async_trait::async_trait;

pub use full::FullStore;
pub use on_demand::{OnDemandStore, ResourceFetcher};
pub use snapshot::StoreSnapshot;

use crate::error::{Error, Result};
use crate::resource::WatchedObject;

/// Common contract for both store backends.
#[async_trait]
pub trait Store: Send + Sync {
    /// Number of key components this store is indexed by.
    fn arity(&self) -> usize;

    /// Append a payload at the given key tuple. The keys may already exist.
    async fn add(&self, payload: WatchedObject, keys: Vec<String>) -> Result<()>;

    /// Replace the entry matching the payload's `(namespace, name)` among
    /// those at `keys`; append if none matches.
    async fn update(&self, payload: WatchedObject, keys: Vec<String>) -> Result<()>;

    /// Remove every entry at the key tuple.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Remove the single entry at `keys` whose payload identity matches.
    /// Watchers use this on delete events so sibling entries survive.
    async fn delete_named(&self, keys: &[String], namespace: &str, name: &str) -> Result<()>;

    /// Look up by 1..=arity key components. A full tuple returns exact
    /// matches; a shorter prefix returns every entry whose tuple starts
    /// with it. Results are ordered by `(namespace, name)`.
    async fn get(&self, prefix: &[String]) -> Result<Vec<Arc<WatchedObject>>>;

    /// Snapshot of all entries, ordered by `(namespace, name)`.
    async fn list(&self) -> Result<Vec<Arc<WatchedObject>>>;

    /// Materialize entries with their key tuples for synchronous consumers
    /// (the template renderer). On-demand backends resolve every payload.
    async fn snapshot(&self) -> Result<StoreSnapshot>;

    /// Drop everything.
    async fn clear(&self);

    /// Number of stored entries.
    async fn size(&self) -> usize;
}

fn check_arity(expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::WrongArity { expected, got })
    }
}

fn check_prefix_arity(expected: usize, got: usize) -> Result<()> {
    if got >= 1 && got <= expected {
        Ok(())
    } else {
        Err(Error::WrongArity { expected, got })
    }
}

fn sort_snapshot(entries: &mut [Arc<WatchedObject>]) {
    entries.sort_by_key(|e| e.ident());
}
