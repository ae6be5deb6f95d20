//! `MemoryStore` commit sequence as seen through the `ObjectStore` contract.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use graph_observer::normalize::{normalize, normalize_change};
use graph_observer::store::{WatchEvent, WatchKind};
use graph_observer::{
    EntityHandle, EntityId, FieldChange, MemoryEntity, MemoryStore, ObjectStore, StoreError,
    Value,
};

fn make_log<T: Send + 'static>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn create(store: &MemoryStore) -> EntityId {
    store
        .transaction(|tx| {
            let id = tx.insert("Entity0");
            tx.obtain_permanent_id(&id)
        })
        .expect("create entity")
}

#[test]
fn commit_emits_watch_then_batch_then_tasks_then_boundary() {
    let store = Arc::new(MemoryStore::new());
    let id = create(&store);
    let log = make_log::<String>();

    let entity = store.resolve(&id).unwrap();
    let l = Arc::clone(&log);
    store
        .watch(
            &entity,
            "stringValue",
            WatchKind::External,
            Arc::new(move |_: &WatchEvent<MemoryEntity>| l.lock().unwrap().push("watch".into())),
        )
        .unwrap();

    let l = Arc::clone(&log);
    let task_store = Arc::clone(&store);
    store.subscribe_changes(move |_| {
        l.lock().unwrap().push("batch".into());
        let l = Arc::clone(&l);
        task_store.perform(Box::new(move || l.lock().unwrap().push("task".into())));
    });
    let l = Arc::clone(&log);
    store.subscribe_boundaries(move |b| l.lock().unwrap().push(format!("boundary {}", b.sequence)));

    store.transaction(|tx| tx.set(&id, "stringValue", "x")).unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["watch", "batch", "task", "boundary 2"]
    );
}

#[test]
fn same_value_write_fires_watch_but_emits_no_batch() {
    let store = MemoryStore::new();
    let id = create(&store);
    store.transaction(|tx| tx.set(&id, "stringValue", "same")).unwrap();
    let watches = make_log::<(Option<Value>, Option<Value>)>();
    let batches = make_log::<usize>();

    let entity = store.resolve(&id).unwrap();
    let w = Arc::clone(&watches);
    store
        .watch(
            &entity,
            "stringValue",
            WatchKind::External,
            Arc::new(move |event: &WatchEvent<MemoryEntity>| {
                w.lock()
                    .unwrap()
                    .push((normalize(event.old.as_ref()), normalize(event.new.as_ref())));
            }),
        )
        .unwrap();
    let b = Arc::clone(&batches);
    store.subscribe_changes(move |batch| b.lock().unwrap().push(batch.updated.len()));

    store.transaction(|tx| tx.set(&id, "stringValue", "same")).unwrap();

    assert_eq!(
        *watches.lock().unwrap(),
        vec![(Some(Value::from("same")), Some(Value::from("same")))]
    );
    assert!(batches.lock().unwrap().is_empty());
}

#[test]
fn inserted_and_updated_sets_are_reported() {
    let store = MemoryStore::new();
    let existing = create(&store);
    let seen = make_log::<(Vec<EntityId>, Vec<EntityId>)>();
    let s = Arc::clone(&seen);
    store.subscribe_changes(move |batch| {
        let ids = |v: &[MemoryEntity]| v.iter().map(|e| e.id().clone()).collect::<Vec<_>>();
        s.lock().unwrap().push((ids(&batch.inserted), ids(&batch.updated)));
    });

    let fresh = store
        .transaction(|tx| {
            tx.set(&existing, "stringValue", "touched")?;
            let id = tx.insert("Entity1");
            tx.obtain_permanent_id(&id)
        })
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![(vec![fresh], vec![existing])]);
}

#[test]
fn rollback_emits_nothing() {
    let store = MemoryStore::new();
    let id = create(&store);
    let events = make_log::<&'static str>();
    let e = Arc::clone(&events);
    store.subscribe_changes(move |_| e.lock().unwrap().push("batch"));
    let e = Arc::clone(&events);
    store.subscribe_boundaries(move |_| e.lock().unwrap().push("boundary"));

    let result: Result<(), StoreError> = store.transaction(|tx| {
        tx.set(&id, "stringValue", "discarded")?;
        tx.rollback("abandon")
    });

    assert!(result.is_err());
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(store.resolve(&id).unwrap().string("stringValue"), None);
}

#[test]
fn refresh_reports_only_the_refreshed_set() {
    let store = MemoryStore::new();
    let id = create(&store);
    let seen = make_log::<(usize, usize, bool)>();
    let s = Arc::clone(&seen);
    store.subscribe_changes(move |batch| {
        s.lock()
            .unwrap()
            .push((batch.refreshed.len(), batch.updated.len(), batch.deltas.is_empty()));
    });

    store.refresh_entities(&[id]).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(1, 0, true)]);
}

#[test]
fn unsubscribed_listener_is_not_called() {
    let store = MemoryStore::new();
    let id = create(&store);
    let calls = make_log::<()>();
    let c = Arc::clone(&calls);
    let listener = store.subscribe_changes(move |_| c.lock().unwrap().push(()));

    assert!(store.unsubscribe(listener));
    assert!(!store.unsubscribe(listener));
    store.transaction(|tx| tx.set(&id, "stringValue", "x")).unwrap();

    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn watch_on_unknown_entity_is_rejected() {
    let store = MemoryStore::new();
    let id = create(&store);
    let entity = store.resolve(&id).unwrap();
    store.purge(&id);

    let result = store.watch(
        &entity,
        "stringValue",
        WatchKind::External,
        Arc::new(|_: &WatchEvent<MemoryEntity>| {}),
    );

    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[test]
fn to_many_relations_keep_their_kind() {
    let store = MemoryStore::new();
    let a = create(&store);
    let b = create(&store);

    store
        .transaction(|tx| {
            tx.add_to(&a, "tags", &b)?;
            tx.push(&a, "ordered", &b)
        })
        .unwrap();

    let a = store.resolve(&a).unwrap();
    assert!(a.value("tags").unwrap().as_entity_set().unwrap().contains(&b));
    assert_eq!(a.value("ordered").unwrap().as_entity_list(), Some(&[b][..]));
}

#[test]
fn unset_relation_starts_as_an_empty_collection() {
    let store = MemoryStore::new();
    let a = create(&store);
    let b = create(&store);
    let seen = make_log::<FieldChange>();
    let s = Arc::clone(&seen);
    let key = a.clone();
    store.subscribe_changes(move |batch| {
        if let Some(change) = batch.deltas.get(&key).and_then(|d| d.get("children")) {
            s.lock().unwrap().push(normalize_change(change));
        }
    });

    // Removing from a relation that was never set changes nothing.
    store.transaction(|tx| tx.remove_from(&a, "children", &b)).unwrap();
    store.transaction(|tx| tx.add_to(&a, "children", &b)).unwrap();
    store.transaction(|tx| tx.remove_from(&a, "children", &b)).unwrap();

    let empty = Value::EntitySet(BTreeSet::new());
    let with_b = Value::EntitySet(BTreeSet::from([b]));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            FieldChange::new(Some(empty.clone()), Some(with_b.clone())),
            FieldChange::new(Some(with_b), Some(empty)),
        ]
    );
}
