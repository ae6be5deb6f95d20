//! Subscription registry — two independent indexes of weakly-held observers.
//!
//! - lifecycle subscriptions, keyed by entity identity;
//! - field-path subscriptions, keyed by root entity identity.
//!
//! Buckets preserve registration order. Subscriptions are stored as `Arc`s so
//! the dispatcher can snapshot a bucket under the registry lock and invoke
//! callbacks after releasing it. A callback therefore never sees a bucket
//! mid-mutation, and may itself add or remove subscriptions.
//!
//! The registry never tears watches down itself. Removal methods hand back a
//! [`Removed`] whose [`Removed::teardown`] must be called once the registry
//! lock has been released.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::keypath::FieldPathBridge;
use crate::store::traits::ObjectStore;
use crate::types::{ChangeSet, EntityId, FieldPath, LifecycleState, ObserverKey, SubscriptionId};

/// Outcome of handing a change to a subscription's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Fired,
    /// The observer was gone; nothing ran.
    Expired,
}

// ============================================================================
// Observer slots
// ============================================================================

/// Weak reference to an observer plus its identity key.
pub struct ObserverSlot {
    key: ObserverKey,
    weak: Weak<dyn Any + Send + Sync>,
}

impl ObserverSlot {
    pub fn new<O: Send + Sync + 'static>(observer: &Arc<O>) -> Self {
        let weak: Weak<O> = Arc::downgrade(observer);
        Self {
            key: ObserverKey::of(observer),
            weak,
        }
    }

    pub fn key(&self) -> ObserverKey {
        self.key
    }

    pub fn is_alive(&self) -> bool {
        self.weak.strong_count() > 0
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

type LifecycleCallback<E> = dyn Fn(&E, &ChangeSet, LifecycleState) -> Delivery + Send + Sync;

pub struct LifecycleSubscription<E> {
    pub id: SubscriptionId,
    pub entity: EntityId,
    pub mask: LifecycleState,
    observer: ObserverSlot,
    callback: Box<LifecycleCallback<E>>,
}

impl<E: 'static> LifecycleSubscription<E> {
    /// The callback receives the observer itself, upgraded for the duration
    /// of the call; if the upgrade fails the callback is skipped.
    pub fn new<O, F>(
        id: SubscriptionId,
        observer: &Arc<O>,
        entity: EntityId,
        mask: LifecycleState,
        callback: F,
    ) -> Self
    where
        O: Send + Sync + 'static,
        F: Fn(&O, &E, &ChangeSet, LifecycleState) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(observer);
        Self {
            id,
            entity,
            mask,
            observer: ObserverSlot::new(observer),
            callback: Box::new(move |entity, changes, state| match weak.upgrade() {
                Some(observer) => {
                    callback(&observer, entity, changes, state);
                    Delivery::Fired
                }
                None => Delivery::Expired,
            }),
        }
    }

    pub fn observer(&self) -> ObserverKey {
        self.observer.key()
    }

    pub fn is_alive(&self) -> bool {
        self.observer.is_alive()
    }

    pub fn matches(&self, state: LifecycleState) -> bool {
        self.mask.intersects(state)
    }

    pub fn deliver(&self, entity: &E, changes: &ChangeSet, state: LifecycleState) -> Delivery {
        (self.callback)(entity, changes, state)
    }
}

pub struct FieldPathSubscription<S: ObjectStore> {
    pub id: SubscriptionId,
    pub root: EntityId,
    observer: ObserverSlot,
    bridge: Arc<FieldPathBridge<S>>,
}

impl<S: ObjectStore> FieldPathSubscription<S> {
    pub fn new(
        id: SubscriptionId,
        observer: ObserverSlot,
        root: EntityId,
        bridge: Arc<FieldPathBridge<S>>,
    ) -> Self {
        Self {
            id,
            root,
            observer,
            bridge,
        }
    }

    pub fn observer(&self) -> ObserverKey {
        self.observer.key()
    }

    pub fn is_alive(&self) -> bool {
        self.observer.is_alive()
    }

    pub fn path(&self) -> &FieldPath {
        self.bridge.path()
    }

    pub fn bridge(&self) -> &Arc<FieldPathBridge<S>> {
        &self.bridge
    }
}

// ============================================================================
// Removed
// ============================================================================

/// Subscriptions taken out of the registry by one removal or sweep.
#[must_use = "field-path watches are only torn down by Removed::teardown"]
pub struct Removed<S: ObjectStore> {
    pub lifecycle: usize,
    pub field_paths: Vec<Arc<FieldPathSubscription<S>>>,
}

impl<S: ObjectStore> Removed<S> {
    fn none() -> Self {
        Self {
            lifecycle: 0,
            field_paths: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.lifecycle + self.field_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Uninstall the watches of removed field-path subscriptions. Returns the
    /// number of subscriptions removed.
    pub fn teardown(self) -> usize {
        for sub in &self.field_paths {
            sub.bridge.teardown();
        }
        self.total()
    }
}

// ============================================================================
// Registry
// ============================================================================

pub struct Registry<S: ObjectStore> {
    lifecycle: HashMap<EntityId, Vec<Arc<LifecycleSubscription<S::Entity>>>>,
    field_paths: HashMap<EntityId, Vec<Arc<FieldPathSubscription<S>>>>,
}

impl<S: ObjectStore> Registry<S> {
    pub fn new() -> Self {
        Self {
            lifecycle: HashMap::new(),
            field_paths: HashMap::new(),
        }
    }

    pub fn add_lifecycle(&mut self, sub: LifecycleSubscription<S::Entity>) {
        self.lifecycle
            .entry(sub.entity.clone())
            .or_default()
            .push(Arc::new(sub));
    }

    pub fn add_field_path(&mut self, sub: FieldPathSubscription<S>) {
        self.field_paths
            .entry(sub.root.clone())
            .or_default()
            .push(Arc::new(sub));
    }

    /// True if `id` has at least one subscription of either kind.
    pub fn has_subscriptions(&self, id: &EntityId) -> bool {
        self.lifecycle.contains_key(id) || self.field_paths.contains_key(id)
    }

    /// Snapshot of the lifecycle bucket for `id`, in registration order.
    pub fn lifecycle_bucket(&self, id: &EntityId) -> Vec<Arc<LifecycleSubscription<S::Entity>>> {
        self.lifecycle.get(id).cloned().unwrap_or_default()
    }

    /// Snapshot of every field-path subscription.
    pub fn field_path_subscriptions(&self) -> Vec<Arc<FieldPathSubscription<S>>> {
        self.field_paths.values().flatten().cloned().collect()
    }

    /// Remove everything registered by `observer`.
    pub fn remove_all(&mut self, observer: ObserverKey) -> Removed<S> {
        let mut removed = Removed::none();
        self.lifecycle.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.observer() != observer);
            removed.lifecycle += before - subs.len();
            !subs.is_empty()
        });
        self.field_paths.retain(|_, subs| {
            let (gone, kept): (Vec<_>, Vec<_>) =
                subs.drain(..).partition(|s| s.observer() == observer);
            removed.field_paths.extend(gone);
            *subs = kept;
            !subs.is_empty()
        });
        removed
    }

    /// Remove what `observer` registered for one entity.
    pub fn remove(&mut self, observer: ObserverKey, id: &EntityId) -> Removed<S> {
        let mut removed = Removed::none();
        if let Some(subs) = self.lifecycle.get_mut(id) {
            let before = subs.len();
            subs.retain(|s| s.observer() != observer);
            removed.lifecycle = before - subs.len();
            if subs.is_empty() {
                self.lifecycle.remove(id);
            }
        }
        if let Some(subs) = self.field_paths.get_mut(id) {
            let (gone, kept): (Vec<_>, Vec<_>) =
                subs.drain(..).partition(|s| s.observer() == observer);
            removed.field_paths = gone;
            *subs = kept;
            if subs.is_empty() {
                self.field_paths.remove(id);
            }
        }
        removed
    }

    /// Remove a single subscription by id.
    pub fn remove_subscription(&mut self, id: SubscriptionId) -> Removed<S> {
        let mut removed = Removed::none();
        self.lifecycle.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed.lifecycle += before - subs.len();
            !subs.is_empty()
        });
        self.field_paths.retain(|_, subs| {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                removed.field_paths.push(subs.remove(pos));
            }
            !subs.is_empty()
        });
        removed
    }

    /// Remove every subscription keyed by `id`, whoever registered it.
    pub fn forget_entity(&mut self, id: &EntityId) -> Removed<S> {
        Removed {
            lifecycle: self.lifecycle.remove(id).map_or(0, |subs| subs.len()),
            field_paths: self.field_paths.remove(id).unwrap_or_default(),
        }
    }

    /// Purge subscriptions whose observer has expired. Buckets left empty are
    /// deleted; no bucket keeps an expired entry.
    pub fn sweep(&mut self) -> Removed<S> {
        let mut removed = Removed::none();
        self.lifecycle.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.is_alive());
            removed.lifecycle += before - subs.len();
            !subs.is_empty()
        });
        self.field_paths.retain(|_, subs| {
            let (alive, expired): (Vec<_>, Vec<_>) = subs.drain(..).partition(|s| s.is_alive());
            removed.field_paths.extend(expired);
            *subs = alive;
            !subs.is_empty()
        });
        removed
    }

    /// Take everything out, e.g. when the owning session shuts down.
    pub fn clear(&mut self) -> Removed<S> {
        Removed {
            lifecycle: self.lifecycle.drain().map(|(_, subs)| subs.len()).sum(),
            field_paths: self.field_paths.drain().flat_map(|(_, subs)| subs).collect(),
        }
    }

    pub fn lifecycle_count(&self) -> usize {
        self.lifecycle.values().map(Vec::len).sum()
    }

    pub fn field_path_count(&self) -> usize {
        self.field_paths.values().map(Vec::len).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.lifecycle.len() + self.field_paths.len()
    }

    pub fn count_for(&self, observer: ObserverKey) -> usize {
        let lifecycle = self
            .lifecycle
            .values()
            .flatten()
            .filter(|s| s.observer() == observer)
            .count();
        let field_paths = self
            .field_paths
            .values()
            .flatten()
            .filter(|s| s.observer() == observer)
            .count();
        lifecycle + field_paths
    }
}

impl<S: ObjectStore> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}
