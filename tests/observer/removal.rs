//! Removal, observer expiry and sweeping.

use std::sync::{Arc, Mutex};

use graph_observer::{
    ChangeObserver, EntityId, FieldChange, LifecycleState, MemoryStore, ObserverOptions,
};

fn setup() -> (Arc<MemoryStore>, ChangeObserver<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let observer = ChangeObserver::new(Arc::clone(&store));
    (store, observer)
}

fn create(store: &MemoryStore) -> EntityId {
    store
        .transaction(|tx| {
            let id = tx.insert("Entity0");
            tx.obtain_permanent_id(&id)
        })
        .expect("create entity")
}

fn touch(store: &MemoryStore, id: &EntityId, value: &str) {
    store
        .transaction(|tx| tx.set(id, "stringValue", value))
        .expect("write");
}

/// Counts every lifecycle and field-path callback it receives.
#[derive(Default)]
struct Counter {
    hits: Mutex<usize>,
}

impl Counter {
    fn hit(&self) {
        *self.hits.lock().unwrap() += 1;
    }

    fn hits(&self) -> usize {
        *self.hits.lock().unwrap()
    }
}

fn subscribe_both(observer: &ChangeObserver<MemoryStore>, counter: &Arc<Counter>, id: &EntityId) {
    observer
        .add_lifecycle(counter, id, LifecycleState::ALL, |c: &Counter, _, _, _| c.hit())
        .unwrap();
    observer
        .add_field_path(counter, id, "stringValue", |c: &Counter, _: &FieldChange| c.hit())
        .unwrap();
}

#[test]
fn remove_all_clears_both_indexes() {
    let (store, observer) = setup();
    let a = create(&store);
    let b = create(&store);
    let counter = Arc::new(Counter::default());
    subscribe_both(&observer, &counter, &a);
    subscribe_both(&observer, &counter, &b);
    assert_eq!(observer.subscription_count_for(&counter), 4);

    assert_eq!(observer.remove_all(&counter), 4);

    assert_eq!(observer.lifecycle_count(), 0);
    assert_eq!(observer.field_path_count(), 0);
    assert_eq!(store.watch_count(), 0);
    touch(&store, &a, "x");
    touch(&store, &b, "y");
    assert_eq!(counter.hits(), 0);
}

#[test]
fn remove_all_twice_is_safe() {
    let (store, observer) = setup();
    let a = create(&store);
    let counter = Arc::new(Counter::default());
    subscribe_both(&observer, &counter, &a);

    assert_eq!(observer.remove_all(&counter), 2);
    assert_eq!(observer.remove_all(&counter), 0);
}

#[test]
fn remove_only_touches_one_entity() {
    let (store, observer) = setup();
    let a = create(&store);
    let b = create(&store);
    let counter = Arc::new(Counter::default());
    subscribe_both(&observer, &counter, &a);
    subscribe_both(&observer, &counter, &b);

    assert_eq!(observer.remove(&counter, &a), 2);
    touch(&store, &a, "x");
    touch(&store, &b, "y");

    // Lifecycle plus field path, for b only.
    assert_eq!(counter.hits(), 2);
}

#[test]
fn remove_leaves_other_observers_alone() {
    let (store, observer) = setup();
    let a = create(&store);
    let first = Arc::new(Counter::default());
    let second = Arc::new(Counter::default());
    subscribe_both(&observer, &first, &a);
    subscribe_both(&observer, &second, &a);

    observer.remove_all(&first);
    touch(&store, &a, "x");

    assert_eq!(first.hits(), 0);
    assert_eq!(second.hits(), 2);
}

#[test]
fn unsubscribed_field_path_uninstalls_its_watch() {
    let (store, observer) = setup();
    let a = create(&store);
    let counter = Arc::new(Counter::default());
    let sub = observer
        .add_field_path(&counter, &a, "stringValue", |c: &Counter, _: &FieldChange| c.hit())
        .unwrap();

    assert!(observer.unsubscribe(sub));
    assert!(!observer.unsubscribe(sub));
    assert_eq!(store.watch_count(), 0);
}

#[test]
fn dropped_observer_never_fires_and_is_swept_on_next_dispatch() {
    let (store, observer) = setup();
    let a = create(&store);
    let counter = Arc::new(Counter::default());
    observer
        .add_lifecycle(&counter, &a, LifecycleState::ALL, |_: &Counter, _, _, _| {
            panic!("dropped observer was called")
        })
        .unwrap();
    drop(counter);
    assert_eq!(observer.lifecycle_count(), 1, "nothing purges eagerly");

    touch(&store, &a, "x");

    assert_eq!(observer.lifecycle_count(), 0);
    assert_eq!(observer.stats().sweeps, 1);
    assert_eq!(observer.stats().callbacks_fired, 0);
}

#[test]
fn dropped_field_path_observer_stops_watching() {
    let (store, observer) = setup();
    let a = create(&store);
    let counter = Arc::new(Counter::default());
    observer
        .add_field_path(&counter, &a, "stringValue", |_: &Counter, _: &FieldChange| {
            panic!("dropped observer was called")
        })
        .unwrap();
    drop(counter);

    touch(&store, &a, "x");

    assert_eq!(store.watch_count(), 0);
    assert_eq!(observer.field_path_count(), 0, "swept after the boundary");
}

#[test]
fn explicit_sweep_purges_expired_entries() {
    let (store, observer) = setup();
    let a = create(&store);
    let keep = Arc::new(Counter::default());
    let gone = Arc::new(Counter::default());
    subscribe_both(&observer, &keep, &a);
    subscribe_both(&observer, &gone, &a);
    drop(gone);

    assert_eq!(observer.sweep(), 2);
    assert_eq!(observer.sweep(), 0);
    assert_eq!(observer.lifecycle_count(), 1);
    assert_eq!(observer.field_path_count(), 1);
    assert_eq!(store.watch_count(), 1);
}

#[test]
fn callback_may_remove_its_own_subscription() {
    let store = Arc::new(MemoryStore::new());
    let observer = Arc::new(ChangeObserver::with_options(
        Arc::clone(&store),
        ObserverOptions {
            name: Some("self-removing".into()),
            ..Default::default()
        },
    ));
    let a = create(&store);
    let counter = Arc::new(Counter::default());
    let handle = Arc::downgrade(&observer);
    let me = Arc::downgrade(&counter);
    observer
        .add_lifecycle(&counter, &a, LifecycleState::ALL, move |c: &Counter, _, _, _| {
            c.hit();
            if let (Some(observer), Some(me)) = (handle.upgrade(), me.upgrade()) {
                observer.remove_all(&me);
            }
        })
        .unwrap();

    touch(&store, &a, "x");
    touch(&store, &a, "y");

    assert_eq!(counter.hits(), 1);
    assert_eq!(observer.lifecycle_count(), 0);
}

#[test]
fn dropping_the_change_observer_stops_everything() {
    let (store, observer) = setup();
    let a = create(&store);
    let counter = Arc::new(Counter::default());
    subscribe_both(&observer, &counter, &a);

    drop(observer);
    touch(&store, &a, "x");

    assert_eq!(counter.hits(), 0);
    assert_eq!(store.watch_count(), 0);
    assert_eq!(store.listener_count(), 0);
}
