//! ChangeObserver<S> — one store session's change-notification dispatcher.
//!
//! Wires the store's change feed into classifier → dispatcher, and its
//! transaction-boundary feed into field-path re-arming. Both run as tasks on
//! the store's serialized context, so they see a fully committed store.
//!
//! # Threading model
//!
//! `ChangeObserver<S>` is `Send + Sync`. The registry sits behind a single
//! `parking_lot::Mutex`; it is held only to read or mutate buckets, never
//! while a callback, a watch install or a teardown runs. Callbacks may
//! therefore add or remove subscriptions freely, including their own.
//!
//! Observers are passed as `Arc<O>` and held weakly. Dropping the last strong
//! reference is enough to stop deliveries; the stale entries are swept on the
//! next dispatch that would have matched them, or by [`ChangeObserver::sweep`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::classify::Classifier;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{ObserverError, Result};
use crate::keypath::FieldPathBridge;
use crate::normalize::{FromValue, ValueChange};
use crate::registry::{
    Delivery, FieldPathSubscription, LifecycleSubscription, ObserverSlot, Registry,
};
use crate::stats::{ObserverStats, StatsSnapshot};
use crate::store::feed::ListenerId;
use crate::store::traits::{EntityHandle, ObjectStore};
use crate::types::{
    ChangeBatch, ChangeSet, EntityId, FieldChange, FieldPath, LifecycleState, ObserverKey,
    SubscriptionId,
};

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverOptions {
    /// Label attached to this observer's tracing events.
    pub name: Option<String>,
    /// Drop records whose only state is REFRESHED and that carry no changes.
    pub suppress_refresh_only: bool,
    /// Contain panics raised by callbacks instead of unwinding into the store.
    pub catch_callback_panics: bool,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            name: None,
            suppress_refresh_only: true,
            catch_callback_panics: true,
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

struct Inner<S: ObjectStore> {
    store: Arc<S>,
    registry: Mutex<Registry<S>>,
    classifier: Classifier,
    options: ObserverOptions,
    stats: Arc<ObserverStats>,
    next_id: AtomicU64,
}

impl<S: ObjectStore> Inner<S> {
    fn next_subscription(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn dispatcher(&self) -> Dispatcher<'_, S> {
        Dispatcher {
            store: &self.store,
            registry: &self.registry,
            stats: &self.stats,
            catch_panics: self.options.catch_callback_panics,
            name: self.options.name.as_deref(),
        }
    }

    /// Classify and dispatch one batch. Must run inside the store's
    /// serialized context.
    fn deliver(&self, batch: &ChangeBatch<S::Entity>) -> DispatchReport {
        self.stats.batch_seen();
        if batch.store != self.store.store_id() {
            self.stats.batch_ignored();
            tracing::debug!(
                observer = self.options.name.as_deref(),
                batch_store = %batch.store,
                store = %self.store.store_id(),
                "ignoring change batch from another store"
            );
            return DispatchReport::default();
        }

        let classification = {
            let registry = self.registry.lock();
            self.classifier
                .classify(batch, |id| registry.has_subscriptions(id))
        };
        self.stats.diffs(classification.diffs_computed);
        if classification.records.is_empty() {
            return DispatchReport::default();
        }
        self.dispatcher().dispatch(&classification.records)
    }

    /// Re-read every field path after a commit.
    fn rearm(&self) {
        let subscriptions = self.registry.lock().field_path_subscriptions();
        let mut expired = 0;
        for sub in subscriptions {
            if sub.is_alive() {
                sub.bridge().rearm();
            } else {
                expired += 1;
            }
        }
        if expired > 0 {
            self.sweep();
        }
    }

    fn sweep(&self) -> usize {
        let removed = self.registry.lock().sweep();
        let swept = removed.teardown();
        self.stats.sweep();
        tracing::debug!(observer = self.options.name.as_deref(), swept, "swept expired subscriptions");
        swept
    }

    fn promote(&self, id: &EntityId) -> Result<EntityId> {
        self.store
            .obtain_permanent_id(id)
            .map_err(|_| ObserverError::TemporaryIdentity { id: id.clone() })
    }
}

// ============================================================================
// ChangeObserver
// ============================================================================

pub struct ChangeObserver<S: ObjectStore> {
    inner: Arc<Inner<S>>,
    listeners: Vec<ListenerId>,
}

impl<S: ObjectStore> ChangeObserver<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_options(store, ObserverOptions::default())
    }

    pub fn with_options(store: Arc<S>, options: ObserverOptions) -> Self {
        let inner = Arc::new(Inner {
            store: Arc::clone(&store),
            registry: Mutex::new(Registry::new()),
            classifier: Classifier::new(options.suppress_refresh_only),
            options,
            stats: Arc::new(ObserverStats::new()),
            next_id: AtomicU64::new(1),
        });

        // Feeds hold the observer weakly; Drop unsubscribes them.
        let weak = Arc::downgrade(&inner);
        let changes = store.subscribe_changes(move |batch| {
            let Some(inner) = weak.upgrade() else { return };
            let task_inner: Weak<Inner<S>> = Arc::downgrade(&inner);
            let batch = batch.clone();
            inner.store.perform(Box::new(move || {
                if let Some(inner) = task_inner.upgrade() {
                    inner.deliver(&batch);
                }
            }));
        });

        let weak = Arc::downgrade(&inner);
        let boundaries = store.subscribe_boundaries(move |boundary| {
            let Some(inner) = weak.upgrade() else { return };
            if boundary.store != inner.store.store_id() {
                return;
            }
            let task_inner: Weak<Inner<S>> = Arc::downgrade(&inner);
            inner.store.perform(Box::new(move || {
                if let Some(inner) = task_inner.upgrade() {
                    inner.rearm();
                }
            }));
        });

        tracing::debug!(
            observer = inner.options.name.as_deref(),
            store = %store.store_id(),
            "change observer attached"
        );
        Self {
            inner,
            listeners: vec![changes, boundaries],
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn options(&self) -> &ObserverOptions {
        &self.inner.options
    }

    // -- lifecycle subscriptions ---------------------------------------------

    /// Call `callback` whenever `id` is inserted, updated or deleted, filtered
    /// by `mask`. Pass [`LifecycleState::ALL`] for the default set.
    ///
    /// `id` is promoted to its permanent identity first; registration fails
    /// if the store cannot do that.
    pub fn add_lifecycle<O, F>(
        &self,
        observer: &Arc<O>,
        id: &EntityId,
        mask: LifecycleState,
        callback: F,
    ) -> Result<SubscriptionId>
    where
        O: Send + Sync + 'static,
        F: Fn(&O, &S::Entity, &ChangeSet, LifecycleState) + Send + Sync + 'static,
    {
        let id = self.inner.promote(id)?;
        let sub_id = self.inner.next_subscription();
        tracing::trace!(
            observer = self.inner.options.name.as_deref(),
            entity = %id,
            subscription = %sub_id,
            mask = ?mask,
            "lifecycle subscription added"
        );
        self.inner
            .registry
            .lock()
            .add_lifecycle(LifecycleSubscription::new(sub_id, observer, id, mask, callback));
        Ok(sub_id)
    }

    /// [`ChangeObserver::add_lifecycle`] for an entity handle.
    pub fn add_lifecycle_for<O, F>(
        &self,
        observer: &Arc<O>,
        entity: &S::Entity,
        mask: LifecycleState,
        callback: F,
    ) -> Result<SubscriptionId>
    where
        O: Send + Sync + 'static,
        F: Fn(&O, &S::Entity, &ChangeSet, LifecycleState) + Send + Sync + 'static,
    {
        self.add_lifecycle(observer, entity.id(), mask, callback)
    }

    // -- field-path subscriptions --------------------------------------------

    /// Call `callback` whenever the value at `path` (dot-separated, may cross
    /// entity references) changes, starting from entity `id`.
    ///
    /// The current value is taken as the baseline; no callback fires for it.
    /// The watch is installed before this returns.
    pub fn add_field_path<O, F>(
        &self,
        observer: &Arc<O>,
        id: &EntityId,
        path: &str,
        callback: F,
    ) -> Result<SubscriptionId>
    where
        O: Send + Sync + 'static,
        F: Fn(&O, &FieldChange) + Send + Sync + 'static,
    {
        let path = FieldPath::parse(path)?;
        let id = self.inner.promote(id)?;
        let sub_id = self.inner.next_subscription();

        let weak = Arc::downgrade(observer);
        let bridge = Arc::new(FieldPathBridge::new(
            Arc::clone(&self.inner.store),
            id.clone(),
            path,
            move |change: &FieldChange| match weak.upgrade() {
                Some(observer) => {
                    callback(&observer, change);
                    Delivery::Fired
                }
                None => Delivery::Expired,
            },
            self.inner.options.catch_callback_panics,
            Arc::clone(&self.inner.stats),
        ));

        self.inner.store.perform_and_wait(|| -> Result<SubscriptionId> {
            bridge.install()?;
            tracing::trace!(
                observer = self.inner.options.name.as_deref(),
                entity = %id,
                path = %bridge.path(),
                subscription = %sub_id,
                "field path subscription added"
            );
            self.inner.registry.lock().add_field_path(FieldPathSubscription::new(
                sub_id,
                ObserverSlot::new(observer),
                id,
                bridge,
            ));
            Ok(sub_id)
        })
    }

    /// Typed variant of [`ChangeObserver::add_field_path`]. Values of another
    /// shape are delivered as absent.
    pub fn add_field_value<O, T, F>(
        &self,
        observer: &Arc<O>,
        id: &EntityId,
        path: &str,
        callback: F,
    ) -> Result<SubscriptionId>
    where
        O: Send + Sync + 'static,
        T: FromValue + 'static,
        F: Fn(&O, ValueChange<T>) + Send + Sync + 'static,
    {
        self.add_field_path(observer, id, path, move |observer: &O, change: &FieldChange| {
            callback(observer, ValueChange::from_change(change))
        })
    }

    // -- removal -------------------------------------------------------------

    /// Remove every subscription `observer` holds. Returns how many went.
    pub fn remove_all<O: ?Sized>(&self, observer: &Arc<O>) -> usize {
        let key = ObserverKey::of(observer);
        self.inner.store.perform_and_wait(|| {
            let removed = self.inner.registry.lock().remove_all(key);
            removed.teardown()
        })
    }

    /// Remove what `observer` registered for entity `id`.
    pub fn remove<O: ?Sized>(&self, observer: &Arc<O>, id: &EntityId) -> usize {
        let key = ObserverKey::of(observer);
        let id = self.inner.promote(id).unwrap_or_else(|_| id.clone());
        self.inner.store.perform_and_wait(|| {
            let removed = self.inner.registry.lock().remove(key, &id);
            removed.teardown()
        })
    }

    /// Remove one subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.store.perform_and_wait(|| {
            let removed = self.inner.registry.lock().remove_subscription(id);
            removed.teardown() > 0
        })
    }

    /// Purge subscriptions whose observer has been dropped.
    pub fn sweep(&self) -> usize {
        self.inner.store.perform_and_wait(|| self.inner.sweep())
    }

    // -- delivery ------------------------------------------------------------

    /// Classify and dispatch `batch` now, in the store's serialized context.
    ///
    /// Batches from the store's own feed are delivered automatically; this is
    /// for batches that arrive by other means.
    pub fn deliver(&self, batch: &ChangeBatch<S::Entity>) -> DispatchReport {
        self.inner.store.perform_and_wait(|| self.inner.deliver(batch))
    }

    // -- introspection -------------------------------------------------------

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn lifecycle_count(&self) -> usize {
        self.inner.registry.lock().lifecycle_count()
    }

    pub fn field_path_count(&self) -> usize {
        self.inner.registry.lock().field_path_count()
    }

    pub fn subscription_count_for<O: ?Sized>(&self, observer: &Arc<O>) -> usize {
        self.inner.registry.lock().count_for(ObserverKey::of(observer))
    }
}

impl<S: ObjectStore> Drop for ChangeObserver<S> {
    fn drop(&mut self) {
        for listener in self.listeners.drain(..) {
            self.inner.store.unsubscribe(listener);
        }
        let removed = self.inner.registry.lock().clear();
        let total = removed.teardown();
        tracing::debug!(
            observer = self.inner.options.name.as_deref(),
            subscriptions = total,
            "change observer detached"
        );
    }
}
