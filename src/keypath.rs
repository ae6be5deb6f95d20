//! Field-path bridge — live observation of one field path on one entity.
//!
//! A bridge installs a single low-level watch on the first field of its path
//! at the root entity. Watch firings and transaction boundaries both funnel
//! into one comparison against the last-known terminal value, so the callback
//! runs only when that value actually changes.
//!
//! - Single-hop paths trust the watch's own old/new pair.
//! - Multi-hop paths re-resolve the whole path on every firing; a redirected
//!   intermediate reference shows up as a changed terminal value.
//! - [`FieldPathBridge::rearm`] re-reads the path after each commit. That is
//!   what catches writes to an intermediate entity, which never touch the
//!   root's watched field.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{ObserverError, Result};
use crate::normalize::{normalize, normalize_change};
use crate::registry::Delivery;
use crate::stats::ObserverStats;
use crate::store::traits::{ObjectStore, WatchEvent, WatchKind, WatchToken};
use crate::types::{EntityId, FieldChange, FieldPath, RawChange, RawValue, Value};

type BridgeCallback = dyn Fn(&FieldChange) -> Delivery + Send + Sync;

struct BridgeState {
    last: Option<Value>,
    token: Option<WatchToken>,
    torn_down: bool,
}

pub struct FieldPathBridge<S: ObjectStore> {
    store: Arc<S>,
    root: EntityId,
    path: FieldPath,
    callback: Box<BridgeCallback>,
    catch_panics: bool,
    stats: Arc<ObserverStats>,
    state: Mutex<BridgeState>,
}

impl<S: ObjectStore> FieldPathBridge<S> {
    pub fn new(
        store: Arc<S>,
        root: EntityId,
        path: FieldPath,
        callback: impl Fn(&FieldChange) -> Delivery + Send + Sync + 'static,
        catch_panics: bool,
        stats: Arc<ObserverStats>,
    ) -> Self {
        Self {
            store,
            root,
            path,
            callback: Box::new(callback),
            catch_panics,
            stats,
            state: Mutex::new(BridgeState {
                last: None,
                token: None,
                torn_down: false,
            }),
        }
    }

    pub fn root(&self) -> &EntityId {
        &self.root
    }

    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Record the current terminal value as the baseline and install the
    /// watch. Must run inside the store's serialized context.
    pub fn install(self: &Arc<Self>) -> Result<()> {
        let entity = self
            .store
            .resolve(&self.root)
            .map_err(|_| ObserverError::EntityNotFound {
                id: self.root.clone(),
            })?;
        self.store.refresh(&entity);

        let baseline = self.resolve_terminal();
        let weak: Weak<Self> = Arc::downgrade(self);
        let token = self.store.watch(
            &entity,
            self.path.head(),
            WatchKind::FieldPath,
            Arc::new(move |event: &WatchEvent<S::Entity>| {
                if let Some(bridge) = weak.upgrade() {
                    bridge.on_watch(event);
                }
            }),
        )?;

        let mut state = self.state.lock();
        state.last = baseline;
        state.token = Some(token);
        tracing::trace!(root = %self.root, path = %self.path, token = token.0, "field path installed");
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.state.lock().token.is_some()
    }

    /// Last-known terminal value.
    pub fn last_value(&self) -> Option<Value> {
        self.state.lock().last.clone()
    }

    /// Handle one raw watch firing.
    pub fn on_watch(&self, event: &WatchEvent<S::Entity>) {
        if event.kind != WatchKind::FieldPath {
            return;
        }
        {
            let state = self.state.lock();
            if state.torn_down || state.token != Some(event.token) {
                return;
            }
        }

        if self.path.is_single_hop() {
            let change = normalize_change(&RawChange {
                old: event.old.clone(),
                new: event.new.clone(),
            });
            if change.is_noop() {
                return;
            }
            self.state.lock().last = change.new.clone();
            self.fire(change);
        } else {
            self.compare_and_fire();
        }
    }

    /// Re-read the path after a transaction boundary and fire if the terminal
    /// value moved since the last comparison.
    pub fn rearm(&self) {
        if self.state.lock().torn_down {
            return;
        }
        self.compare_and_fire();
    }

    /// Uninstall the watch. Only the first call does anything.
    pub fn teardown(&self) -> bool {
        let token = {
            let mut state = self.state.lock();
            if state.torn_down {
                return false;
            }
            state.torn_down = true;
            state.token.take()
        };
        if let Some(token) = token {
            self.store.unwatch(token);
            tracing::trace!(root = %self.root, path = %self.path, token = token.0, "field path torn down");
        }
        true
    }

    /// Walk the path from the root. Any hop that is not a single entity
    /// reference ends the walk with an absent value.
    pub fn resolve_terminal(&self) -> Option<Value> {
        let mut entity = self.store.resolve(&self.root).ok()?;
        let (terminal, hops) = self.path.segments().split_last()?;
        for field in hops {
            match self.store.value(&entity, field) {
                RawValue::Entity(next) => {
                    self.store.refresh(&next);
                    entity = next;
                }
                _ => return None,
            }
        }
        normalize(Some(&self.store.value(&entity, terminal)))
    }

    fn compare_and_fire(&self) {
        let current = self.resolve_terminal();
        let change = {
            let mut state = self.state.lock();
            if state.torn_down || state.last == current {
                return;
            }
            let old = std::mem::replace(&mut state.last, current.clone());
            FieldChange::new(old, current)
        };
        self.fire(change);
    }

    fn fire(&self, change: FieldChange) {
        let delivery = if self.catch_panics {
            match catch_unwind(AssertUnwindSafe(|| (self.callback)(&change))) {
                Ok(delivery) => delivery,
                Err(_) => {
                    self.stats.callback_fired();
                    self.stats.callback_panicked();
                    tracing::warn!(root = %self.root, path = %self.path, "field path callback panicked");
                    return;
                }
            }
        } else {
            (self.callback)(&change)
        };

        match delivery {
            Delivery::Fired => self.stats.callback_fired(),
            Delivery::Expired => {
                // The registry entry goes at the next sweep; stop watching now.
                tracing::trace!(root = %self.root, path = %self.path, "field path observer expired");
                self.teardown();
            }
        }
    }
}

impl<S: ObjectStore> Drop for FieldPathBridge<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}
