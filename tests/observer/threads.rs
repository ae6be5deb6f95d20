//! Committing on one thread while another subscribes and drops observers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use graph_observer::{ChangeObserver, EntityId, FieldChange, MemoryStore};

fn create(store: &MemoryStore) -> EntityId {
    store
        .transaction(|tx| {
            let id = tx.insert("Entity0");
            tx.obtain_permanent_id(&id)
        })
        .expect("create entity")
}

/// Counts into a shared total so hits stay readable after the observer is gone.
struct Counter {
    hits: Arc<AtomicUsize>,
}

impl Counter {
    fn new(hits: &Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            hits: Arc::clone(hits),
        })
    }

    fn hit(&self, _: &FieldChange) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

const COMMITS: usize = 300;
const SUBSCRIBERS: usize = 40;

#[test]
fn subscribe_and_drop_while_another_thread_commits() {
    let store = Arc::new(MemoryStore::new());
    let observer = Arc::new(ChangeObserver::new(Arc::clone(&store)));
    let a = create(&store);
    let kept_hits = Arc::new(AtomicUsize::new(0));
    let dropped_hits = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(2));

    let writer = {
        let store = Arc::clone(&store);
        let start = Arc::clone(&start);
        let a = a.clone();
        thread::spawn(move || {
            start.wait();
            for i in 0..COMMITS {
                store
                    .transaction(|tx| tx.set(&a, "stringValue", format!("v{i}")))
                    .expect("commit");
            }
        })
    };

    let subscriber = {
        let observer = Arc::clone(&observer);
        let (kept_hits, dropped_hits) = (Arc::clone(&kept_hits), Arc::clone(&dropped_hits));
        let a = a.clone();
        thread::spawn(move || {
            start.wait();
            let mut kept = Vec::new();
            for i in 0..SUBSCRIBERS {
                let hits = if i % 2 == 0 { &kept_hits } else { &dropped_hits };
                let counter = Counter::new(hits);
                observer
                    .add_field_path(&counter, &a, "stringValue", Counter::hit)
                    .expect("subscribe");
                if i % 2 == 0 {
                    kept.push(counter);
                }
            }
            kept
        })
    };

    writer.join().expect("writer thread");
    let kept = subscriber.join().expect("subscriber thread");

    observer.sweep();
    assert_eq!(observer.field_path_count(), kept.len());
    assert_eq!(store.watch_count(), kept.len());

    // Everything is quiescent: only the live observers see the next write.
    let kept_before = kept_hits.load(Ordering::SeqCst);
    let dropped_before = dropped_hits.load(Ordering::SeqCst);
    store
        .transaction(|tx| tx.set(&a, "stringValue", "final"))
        .unwrap();

    assert_eq!(kept_hits.load(Ordering::SeqCst), kept_before + kept.len());
    assert_eq!(dropped_hits.load(Ordering::SeqCst), dropped_before);
}

#[test]
fn observer_dropped_on_another_thread_stops_firing() {
    let store = Arc::new(MemoryStore::new());
    let observer = ChangeObserver::new(Arc::clone(&store));
    let a = create(&store);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Counter::new(&hits);
    observer
        .add_field_path(&counter, &a, "stringValue", Counter::hit)
        .unwrap();

    store.transaction(|tx| tx.set(&a, "stringValue", "one")).unwrap();
    thread::spawn(move || drop(counter))
        .join()
        .expect("dropping thread");
    store.transaction(|tx| tx.set(&a, "stringValue", "two")).unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(store.watch_count(), 0);
}

#[test]
fn change_observer_is_shareable_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<MemoryStore>();
    assert_send_sync::<ChangeObserver<MemoryStore>>();
}
