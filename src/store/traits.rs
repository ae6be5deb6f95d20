//! Collaborator contract between the observer and an object graph store.
//!
//! The observer never owns entity data. Everything it needs from the store —
//! change batches, identity promotion, handle resolution, field reads, field
//! watches and a serialized execution context — goes through [`ObjectStore`].

use std::sync::Arc;

use crate::error::StoreError;
use crate::types::{ChangeBatch, EntityId, RawValue, StoreId, TransactionBoundary};

use super::feed::ListenerId;

/// A unit of work queued onto the store's serialized context.
pub type Task = Box<dyn FnOnce() + Send>;

/// Live, readable handle to one entity instance.
pub trait EntityHandle: Clone + Send + Sync + 'static {
    fn id(&self) -> &EntityId;
}

/// Tag carried by every low-level watch registration and echoed back in each
/// [`WatchEvent`], so a handler can tell its own registrations apart from
/// watches installed by other code on the same field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Installed by a field-path bridge.
    FieldPath,
    /// Installed by code outside this crate.
    External,
}

/// Handle to an installed watch; pass to [`ObjectStore::unwatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(pub u64);

/// One raw firing of a low-level field watch.
///
/// Stores may fire on a write that did not change the value.
#[derive(Debug, Clone)]
pub struct WatchEvent<E> {
    pub token: WatchToken,
    pub kind: WatchKind,
    pub entity: EntityId,
    pub field: String,
    pub old: Option<RawValue<E>>,
    pub new: Option<RawValue<E>>,
}

pub type WatchCallback<E> = Arc<dyn Fn(&WatchEvent<E>) + Send + Sync>;

/// Required capabilities of the underlying object graph store.
///
/// Implementors must be `Send + Sync`; the observer shares the store between
/// the caller's thread and the store's serialized context.
pub trait ObjectStore: Send + Sync + 'static {
    type Entity: EntityHandle;

    fn store_id(&self) -> StoreId;

    // -- identity ------------------------------------------------------------

    /// Promote `id` to its permanent identity. Permanent ids map to
    /// themselves; an id the store cannot promote is an error.
    fn obtain_permanent_id(&self, id: &EntityId) -> Result<EntityId, StoreError>;

    /// Resolve `id` to a live handle. Fails once the store has dropped the
    /// entity entirely.
    fn resolve(&self, id: &EntityId) -> Result<Self::Entity, StoreError>;

    /// Pull the latest committed values into `entity`.
    fn refresh(&self, entity: &Self::Entity);

    /// Current value of `field` on `entity`; [`RawValue::Null`] when unset.
    fn value(&self, entity: &Self::Entity, field: &str) -> RawValue<Self::Entity>;

    // -- serialized context --------------------------------------------------

    /// Queue `task` on the serialized context. The store may run it before
    /// returning, or later once an in-flight commit has finished.
    fn perform(&self, task: Task);

    /// Run `f` with exclusive access to the serialized context and return its
    /// result. Re-entrant from inside the context.
    fn perform_and_wait<R>(&self, f: impl FnOnce() -> R) -> R
    where
        Self: Sized;

    // -- watches -------------------------------------------------------------

    fn watch(
        &self,
        entity: &Self::Entity,
        field: &str,
        kind: WatchKind,
        callback: WatchCallback<Self::Entity>,
    ) -> Result<WatchToken, StoreError>;

    /// Remove a watch. Returns `false` when `token` is not installed.
    fn unwatch(&self, token: WatchToken) -> bool;

    // -- feeds ---------------------------------------------------------------

    /// Called once per committed transaction (and per refresh) with the
    /// affected entity sets and field deltas.
    fn subscribe_changes(
        &self,
        listener: impl Fn(&ChangeBatch<Self::Entity>) + Send + Sync + 'static,
    ) -> ListenerId
    where
        Self: Sized;

    /// Called after every commit once the store is safe to read again.
    fn subscribe_boundaries(
        &self,
        listener: impl Fn(&TransactionBoundary) + Send + Sync + 'static,
    ) -> ListenerId
    where
        Self: Sized;

    fn unsubscribe(&self, id: ListenerId) -> bool;
}
