//! ChangeFeed<T> — the listener list behind a store's notification feeds.
//!
//! Listeners are stored as `Arc<dyn Fn(&T)>` so a publish can snapshot them
//! cheaply. Snapshot-on-publish semantics:
//!   - A listener removed *during* publication is still called in that round.
//!   - A listener added *during* publication is first called on the next one.
//!
//! The internal `parking_lot::Mutex` is never held while a listener runs, so
//! listeners may subscribe or unsubscribe from inside a callback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Process-wide counter so ids from different feeds never collide. A store
/// exposes a single `unsubscribe(ListenerId)` for all of its feeds.
static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

/// Returned by [`ChangeFeed::subscribe`]; pass to [`ChangeFeed::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Listener<T> = dyn Fn(&T) + Send + Sync;

/// Typed synchronous notification feed.
pub struct ChangeFeed<T> {
    listeners: Mutex<Vec<(ListenerId, Arc<Listener<T>>)>>,
}

impl<T> ChangeFeed<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if `id` was not registered here. Safe to repeat.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Deliver `item` to every listener registered when the call began, in
    /// registration order.
    pub fn publish(&self, item: &T) {
        let snapshot: Vec<Arc<Listener<T>>> = {
            let guard = self.listeners.lock();
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            listener(item);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

impl<T> Default for ChangeFeed<T> {
    fn default() -> Self {
        Self::new()
    }
}
