//! Field-path subscriptions, single- and multi-hop.

use std::sync::{Arc, Mutex};

use graph_observer::{
    ChangeObserver, EntityId, FieldChange, MemoryStore, ObjectStore, ObserverError, Value,
    ValueChange,
};

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
struct Recorder {
    changes: Mutex<Vec<FieldChange>>,
}

impl Recorder {
    fn record(&self, change: &FieldChange) {
        self.changes.lock().unwrap().push(change.clone());
    }

    fn changes(&self) -> Vec<FieldChange> {
        self.changes.lock().unwrap().clone()
    }
}

fn setup() -> (Arc<MemoryStore>, ChangeObserver<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let observer = ChangeObserver::new(Arc::clone(&store));
    (store, observer)
}

fn create(store: &MemoryStore, kind: &str) -> EntityId {
    store
        .transaction(|tx| {
            let id = tx.insert(kind);
            tx.obtain_permanent_id(&id)
        })
        .expect("create entity")
}

/// A → child → B, with B.stringValue unset.
fn parent_and_child(store: &MemoryStore) -> (EntityId, EntityId) {
    let a = create(store, "Entity0");
    let b = create(store, "Entity1");
    store
        .transaction(|tx| tx.set(&a, "child", Value::Entity(b.clone())))
        .unwrap();
    (a, b)
}

fn text(s: &str) -> Option<Value> {
    Some(Value::from(s))
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn multi_hop_fires_once_when_only_the_target_changes() {
    let (store, observer) = setup();
    let (a, b) = parent_and_child(&store);
    let recorder = Arc::new(Recorder::default());
    observer
        .add_field_path(&recorder, &a, "child.stringValue", Recorder::record)
        .unwrap();

    store.transaction(|tx| tx.set(&b, "stringValue", "Test")).unwrap();

    assert_eq!(recorder.changes(), vec![FieldChange::new(None, text("Test"))]);
}

#[test]
fn registration_takes_a_baseline_without_firing() {
    let (store, observer) = setup();
    let (a, b) = parent_and_child(&store);
    store.transaction(|tx| tx.set(&b, "stringValue", "initial")).unwrap();
    let recorder = Arc::new(Recorder::default());

    observer
        .add_field_path(&recorder, &a, "child.stringValue", Recorder::record)
        .unwrap();
    store.transaction(|tx| tx.set(&b, "stringValue", "next")).unwrap();

    assert_eq!(
        recorder.changes(),
        vec![FieldChange::new(text("initial"), text("next"))]
    );
}

#[test]
fn single_hop_ignores_same_value_writes() {
    let (store, observer) = setup();
    let a = create(&store, "Entity0");
    let recorder = Arc::new(Recorder::default());
    observer
        .add_field_path(&recorder, &a, "stringValue", Recorder::record)
        .unwrap();

    store.transaction(|tx| tx.set(&a, "stringValue", "same")).unwrap();
    store.transaction(|tx| tx.set(&a, "stringValue", "same")).unwrap();
    store.transaction(|tx| tx.clear(&a, "stringValue")).unwrap();

    assert_eq!(
        recorder.changes(),
        vec![
            FieldChange::new(None, text("same")),
            FieldChange::new(text("same"), None),
        ]
    );
}

#[test]
fn redirecting_an_intermediate_reference_fires() {
    let (store, observer) = setup();
    let (a, b) = parent_and_child(&store);
    let c = create(&store, "Entity1");
    store
        .transaction(|tx| {
            tx.set(&b, "stringValue", "from b")?;
            tx.set(&c, "stringValue", "from c")
        })
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    observer
        .add_field_path(&recorder, &a, "child.stringValue", Recorder::record)
        .unwrap();

    store
        .transaction(|tx| tx.set(&a, "child", Value::Entity(c.clone())))
        .unwrap();

    assert_eq!(
        recorder.changes(),
        vec![FieldChange::new(text("from b"), text("from c"))]
    );
}

#[test]
fn redirect_to_equal_value_does_not_fire() {
    let (store, observer) = setup();
    let (a, b) = parent_and_child(&store);
    let c = create(&store, "Entity1");
    store
        .transaction(|tx| {
            tx.set(&b, "stringValue", "same")?;
            tx.set(&c, "stringValue", "same")
        })
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    observer
        .add_field_path(&recorder, &a, "child.stringValue", Recorder::record)
        .unwrap();

    store
        .transaction(|tx| tx.set(&a, "child", Value::Entity(c.clone())))
        .unwrap();

    assert!(recorder.changes().is_empty());
}

#[test]
fn deleting_the_intermediate_entity_clears_the_value() {
    let (store, observer) = setup();
    let (a, b) = parent_and_child(&store);
    store.transaction(|tx| tx.set(&b, "stringValue", "Test")).unwrap();
    let recorder = Arc::new(Recorder::default());
    observer
        .add_field_path(&recorder, &a, "child.stringValue", Recorder::record)
        .unwrap();

    store.transaction(|tx| tx.delete(&b)).unwrap();

    assert_eq!(recorder.changes(), vec![FieldChange::new(text("Test"), None)]);
}

#[test]
fn deleting_the_root_tears_the_watch_down() {
    let (store, observer) = setup();
    let a = create(&store, "Entity0");
    let recorder = Arc::new(Recorder::default());
    observer
        .add_field_path(&recorder, &a, "stringValue", Recorder::record)
        .unwrap();
    assert_eq!(store.watch_count(), 1);

    store.transaction(|tx| tx.delete(&a)).unwrap();

    assert_eq!(observer.field_path_count(), 0);
    assert_eq!(store.watch_count(), 0);
    assert!(recorder.changes().is_empty());
}

#[test]
fn typed_field_value_delivers_converted_values() {
    let (store, observer) = setup();
    let a = create(&store, "Entity0");
    let seen: Arc<Mutex<Vec<ValueChange<i64>>>> = Arc::default();
    let listener = Arc::new(Arc::clone(&seen));
    observer
        .add_field_value(&listener, &a, "intValue", |log, change: ValueChange<i64>| {
            log.lock().unwrap().push(change)
        })
        .unwrap();

    store.transaction(|tx| tx.set(&a, "intValue", 7i64)).unwrap();
    store.transaction(|tx| tx.set(&a, "intValue", "seven")).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ValueChange { old: None, new: Some(7) },
            ValueChange { old: Some(7), new: None },
        ]
    );
}

#[test]
fn unknown_root_is_reported() {
    let (store, observer) = setup();
    let ghost = EntityId::permanent(store.store_id(), "Entity0", 4040);
    let recorder = Arc::new(Recorder::default());

    let result = observer.add_field_path(&recorder, &ghost, "stringValue", Recorder::record);

    assert!(matches!(result, Err(ObserverError::EntityNotFound { .. })));
    assert_eq!(store.watch_count(), 0);
}

#[test]
fn same_path_twice_fires_both_subscriptions() {
    let (store, observer) = setup();
    let a = create(&store, "Entity0");
    let recorder = Arc::new(Recorder::default());
    observer
        .add_field_path(&recorder, &a, "stringValue", Recorder::record)
        .unwrap();
    observer
        .add_field_path(&recorder, &a, "stringValue", Recorder::record)
        .unwrap();

    store.transaction(|tx| tx.set(&a, "stringValue", "x")).unwrap();

    assert_eq!(recorder.changes().len(), 2);
    assert_eq!(store.watch_count(), 2);
}

#[test]
fn non_reference_hop_resolves_to_absent() {
    let (store, observer) = setup();
    let a = create(&store, "Entity0");
    store.transaction(|tx| tx.set(&a, "child", "not an entity")).unwrap();
    let recorder = Arc::new(Recorder::default());
    observer
        .add_field_path(&recorder, &a, "child.stringValue", Recorder::record)
        .unwrap();

    store.transaction(|tx| tx.set(&a, "child", "still not")).unwrap();

    assert!(recorder.changes().is_empty());
}
