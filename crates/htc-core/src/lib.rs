//! Core building blocks for the HAProxy template controller
//!
//! This crate holds everything that does not need a Kubernetes client:
//! the indexed resource stores fed by the watchers, the in-process event
//! bus that sequences the reconciliation pipeline, the opaque payload
//! wrapper for dynamically-typed resources, and the rendered artifact type.

pub mod artifact;
pub mod checksum;
pub mod error;
pub mod events;
pub mod resource;
pub mod store;

pub use artifact::RenderedArtifact;
pub use error::{Error, Result};
pub use events::{Event, EventBus, Subscription};
pub use resource::WatchedObject;
pub use store::{FullStore, OnDemandStore, ResourceFetcher, Store, StoreSnapshot};
