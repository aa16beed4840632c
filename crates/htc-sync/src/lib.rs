//! Differential synchronization against the Dataplane API
//!
//! For each target pod: open a transaction, read the live configuration,
//! compute a dependency-ordered operation plan against the desired parsed
//! config, apply it inside the transaction, commit. Version conflicts
//! reopen and recompute; plans that cannot be expressed structurally (or
//! exceed the operation budget) fall back to a raw whole-config push.
//!
//! A successful re-application of an already-deployed artifact produces an
//! empty plan and no reload.

pub mod admission;
pub mod comparator;
pub mod error;
pub mod executor;
pub mod live;
pub mod plan;

pub use admission::DeployGate;
pub use comparator::compare;
pub use error::{Error, Result};
pub use executor::{DataplaneApi, PodSyncReport, SyncOutcome, Synchronizer, SynchronizerConfig};
pub use plan::{OpKind, Operation, Plan};
