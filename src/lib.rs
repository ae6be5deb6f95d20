//! Change notifications for an object graph store.
//!
//! A [`ChangeObserver`] attaches to one store session and lets any number of
//! observers subscribe to:
//!
//! - lifecycle events (inserted / updated / deleted / refreshed) of specific
//!   entities, with a normalized per-field diff;
//! - the value at a field path such as `parent.stringValue`, followed across
//!   entity references.
//!
//! Observers are held weakly and never kept alive by their subscriptions.
//! [`MemoryStore`] is a complete in-memory store to run against.

pub mod classify;
pub mod dispatch;
pub mod error;
pub mod keypath;
pub mod normalize;
pub mod observer;
pub mod registry;
pub mod stats;
pub mod store;
pub mod types;

pub use dispatch::DispatchReport;
pub use error::{ObserverError, Result, StoreError};
pub use normalize::{FromValue, ValueChange};
pub use observer::{ChangeObserver, ObserverOptions};
pub use stats::StatsSnapshot;
pub use store::{EntityHandle, MemoryEntity, MemoryStore, ObjectStore, Transaction};
pub use types::{
    ChangeBatch, ChangeSet, EntityId, FieldChange, FieldPath, LifecycleState, RawValue, StoreId,
    SubscriptionId, Value,
};
