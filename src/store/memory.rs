//! MemoryStore — an in-memory transactional object graph implementing
//! [`ObjectStore`].
//!
//! Entities are bags of named fields holding scalars or references to other
//! entities. Writes are buffered in a [`Transaction`] and applied atomically
//! on commit; returning `Err` from the transaction closure discards them.
//!
//! ## Commit sequence
//!
//! 1. Temporary ids of inserted entities are promoted and references to them
//!    rewritten.
//! 2. The committed graph is updated (deleted entities become tombstones).
//! 3. Field watches fire for every field written in the transaction, even
//!    when the value did not change.
//! 4. One [`ChangeBatch`] is published on the change feed.
//! 5. The serialized context is released and queued tasks run.
//! 6. One [`TransactionBoundary`] is published.
//!
//! ## Lock ordering
//!
//! `context` (re-entrant) is taken first, then `graph`, then `promoted`.
//! `watches` is never held together with `graph`, and no lock other than
//! `context` is held while watches, feeds or tasks run.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::StoreError;
use crate::normalize::normalize;
use crate::types::{
    ChangeBatch, EntityId, RawChange, RawValue, StoreId, TransactionBoundary, Value,
};

use super::context::SerialContext;
use super::feed::{ChangeFeed, ListenerId};
use super::traits::{
    EntityHandle, ObjectStore, Task, WatchCallback, WatchEvent, WatchKind, WatchToken,
};

static NEXT_STORE: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Stored graph
// ============================================================================

/// A field value as kept in the graph. Unset fields are simply absent.
#[derive(Debug, Clone, PartialEq)]
enum Stored {
    Scalar(serde_json::Value),
    Ref(EntityId),
    RefSet(BTreeSet<EntityId>),
    RefList(Vec<EntityId>),
}

impl Stored {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Scalar(serde_json::Value::Null) => None,
            Value::Scalar(v) => Some(Self::Scalar(v)),
            Value::Entity(id) => Some(Self::Ref(id)),
            Value::EntitySet(ids) => Some(Self::RefSet(ids)),
            Value::EntityList(ids) => Some(Self::RefList(ids)),
        }
    }

    fn references(&self, target: &EntityId) -> bool {
        match self {
            Self::Scalar(_) => false,
            Self::Ref(id) => id == target,
            Self::RefSet(ids) => ids.contains(target),
            Self::RefList(ids) => ids.contains(target),
        }
    }

    /// Apply `f` to every referenced id.
    fn remap(self, f: &impl Fn(EntityId) -> EntityId) -> Self {
        match self {
            Self::Scalar(v) => Self::Scalar(v),
            Self::Ref(id) => Self::Ref(f(id)),
            Self::RefSet(ids) => Self::RefSet(ids.into_iter().map(f).collect()),
            Self::RefList(ids) => Self::RefList(ids.into_iter().map(f).collect()),
        }
    }
}

#[derive(Debug, Clone)]
struct Object {
    fields: BTreeMap<String, Stored>,
    deleted: bool,
}

impl Object {
    fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
            deleted: false,
        }
    }
}

type Graph = HashMap<EntityId, Object>;

fn raw_value(graph: &Arc<RwLock<Graph>>, stored: Option<&Stored>) -> RawValue<MemoryEntity> {
    let handle = |id: &EntityId| MemoryEntity {
        id: id.clone(),
        graph: Arc::clone(graph),
    };
    match stored {
        None => RawValue::Null,
        Some(Stored::Scalar(v)) => RawValue::Scalar(v.clone()),
        Some(Stored::Ref(id)) => RawValue::Entity(handle(id)),
        Some(Stored::RefSet(ids)) => RawValue::EntitySet(ids.iter().map(handle).collect()),
        Some(Stored::RefList(ids)) => RawValue::EntityList(ids.iter().map(handle).collect()),
    }
}

// ============================================================================
// MemoryEntity
// ============================================================================

/// Live handle to an entity in a [`MemoryStore`].
///
/// Reads always see the latest committed state, including tombstoned
/// (deleted) entities, whose last committed fields stay readable.
#[derive(Clone)]
pub struct MemoryEntity {
    id: EntityId,
    graph: Arc<RwLock<Graph>>,
}

impl MemoryEntity {
    pub fn get(&self, field: &str) -> RawValue<MemoryEntity> {
        let graph = self.graph.read();
        let stored = graph.get(&self.id).and_then(|o| o.fields.get(field));
        raw_value(&self.graph, stored)
    }

    /// Normalized current value of `field`.
    pub fn value(&self, field: &str) -> Option<Value> {
        normalize(Some(&self.get(field)))
    }

    /// Convenience for string fields.
    pub fn string(&self, field: &str) -> Option<String> {
        self.value(field)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn is_deleted(&self) -> bool {
        self.graph
            .read()
            .get(&self.id)
            .map_or(true, |o| o.deleted)
    }
}

impl EntityHandle for MemoryEntity {
    fn id(&self) -> &EntityId {
        &self.id
    }
}

impl PartialEq for MemoryEntity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for MemoryEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEntity").field("id", &self.id).finish()
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

struct WatchEntry {
    token: WatchToken,
    kind: WatchKind,
    entity: EntityId,
    field: String,
    callback: WatchCallback<MemoryEntity>,
}

/// In-memory object graph store.
pub struct MemoryStore {
    id: StoreId,
    graph: Arc<RwLock<Graph>>,
    /// Temporary id → permanent id, for every promotion ever made.
    promoted: Mutex<HashMap<EntityId, EntityId>>,
    next_key: AtomicU64,
    next_temp: AtomicU64,
    next_watch: AtomicU64,
    sequence: AtomicU64,
    watches: Mutex<Vec<WatchEntry>>,
    changes: ChangeFeed<ChangeBatch<MemoryEntity>>,
    boundaries: ChangeFeed<TransactionBoundary>,
    context: SerialContext,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_id(StoreId::new(NEXT_STORE.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn with_id(id: StoreId) -> Self {
        Self {
            id,
            graph: Arc::new(RwLock::new(HashMap::new())),
            promoted: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            next_temp: AtomicU64::new(1),
            next_watch: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
            watches: Mutex::new(Vec::new()),
            changes: ChangeFeed::new(),
            boundaries: ChangeFeed::new(),
            context: SerialContext::new(),
        }
    }

    /// Run `f` as one transaction. On `Ok` the writes are committed and
    /// notifications go out before this returns; on `Err` nothing is applied.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let hold = self.context.hold();
        let mut tx = Transaction::new(self);
        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(store = %self.id, error = %e, "transaction rolled back");
                return Err(e);
            }
        };

        let commit = tx.finish();
        let batch = self.apply(&commit);
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(
            store = %self.id,
            sequence,
            inserted = batch.inserted.len(),
            updated = batch.updated.len(),
            deleted = batch.deleted.len(),
            "transaction committed"
        );

        self.fire_watches(&commit);
        if !batch.is_empty() {
            self.changes.publish(&batch);
        }
        hold.release();

        self.boundaries.publish(&TransactionBoundary {
            store: self.id,
            sequence,
        });
        Ok(value)
    }

    /// Report `ids` as refreshed, with no field deltas.
    pub fn refresh_entities(&self, ids: &[EntityId]) -> Result<(), StoreError> {
        let hold = self.context.hold();
        let mut batch = ChangeBatch::new(self.id);
        for id in ids {
            batch.refreshed.push(self.resolve(id)?);
        }
        if !batch.is_empty() {
            self.changes.publish(&batch);
        }
        hold.release();
        Ok(())
    }

    /// Drop an entity entirely, tombstone included. Later resolution fails.
    pub fn purge(&self, id: &EntityId) -> bool {
        self.graph.write().remove(id).is_some()
    }

    /// Number of installed watches.
    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }

    /// Number of commits so far.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Total listeners across the change and boundary feeds.
    pub fn listener_count(&self) -> usize {
        self.changes.len() + self.boundaries.len()
    }

    fn allocate_permanent(&self, kind: &str) -> EntityId {
        EntityId::permanent(self.id, kind, self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    fn allocate_temporary(&self, kind: &str) -> EntityId {
        EntityId::temporary(self.id, kind, self.next_temp.fetch_add(1, Ordering::Relaxed))
    }

    fn handle(&self, id: &EntityId) -> MemoryEntity {
        MemoryEntity {
            id: id.clone(),
            graph: Arc::clone(&self.graph),
        }
    }

    fn apply(&self, commit: &Commit) -> ChangeBatch<MemoryEntity> {
        let mut batch = ChangeBatch::new(self.id);
        {
            let mut graph = self.graph.write();
            for (id, object) in &commit.objects {
                graph.insert(id.clone(), object.clone());
            }
            for id in &commit.deleted {
                if let Some(object) = graph.get_mut(id) {
                    object.deleted = true;
                }
            }
        }

        for id in &commit.inserted {
            batch.inserted.push(self.handle(id));
        }
        for id in &commit.updated {
            batch.updated.push(self.handle(id));
        }
        for id in &commit.deleted {
            batch.deleted.push(self.handle(id));
        }
        for (id, delta) in &commit.deltas {
            let delta = delta
                .iter()
                .map(|(field, (old, new))| {
                    let change = RawChange {
                        old: old.as_ref().map(|s| raw_value(&self.graph, Some(s))),
                        new: new.as_ref().map(|s| raw_value(&self.graph, Some(s))),
                    };
                    (field.clone(), change)
                })
                .collect();
            batch.deltas.insert(id.clone(), delta);
        }
        batch
    }

    fn fire_watches(&self, commit: &Commit) {
        for (id, field, old, new) in &commit.writes {
            let targets: Vec<(WatchToken, WatchKind, WatchCallback<MemoryEntity>)> = self
                .watches
                .lock()
                .iter()
                .filter(|w| &w.entity == id && &w.field == field)
                .map(|w| (w.token, w.kind, Arc::clone(&w.callback)))
                .collect();
            for (token, kind, callback) in targets {
                let event = WatchEvent {
                    token,
                    kind,
                    entity: id.clone(),
                    field: field.clone(),
                    old: old.as_ref().map(|s| raw_value(&self.graph, Some(s))),
                    new: new.as_ref().map(|s| raw_value(&self.graph, Some(s))),
                };
                callback(&event);
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("id", &self.id)
            .field("entities", &self.graph.read().len())
            .field("sequence", &self.sequence())
            .finish()
    }
}

impl ObjectStore for MemoryStore {
    type Entity = MemoryEntity;

    fn store_id(&self) -> StoreId {
        self.id
    }

    fn obtain_permanent_id(&self, id: &EntityId) -> Result<EntityId, StoreError> {
        if !id.is_temporary() {
            return Ok(id.clone());
        }
        self.promoted
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn resolve(&self, id: &EntityId) -> Result<MemoryEntity, StoreError> {
        let id = self.obtain_permanent_id(id)?;
        if self.graph.read().contains_key(&id) {
            Ok(self.handle(&id))
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    /// Handles read committed state directly, so there is nothing to pull.
    fn refresh(&self, _entity: &MemoryEntity) {}

    fn value(&self, entity: &MemoryEntity, field: &str) -> RawValue<MemoryEntity> {
        entity.get(field)
    }

    fn perform(&self, task: Task) {
        self.context.perform(task);
    }

    fn perform_and_wait<R>(&self, f: impl FnOnce() -> R) -> R {
        self.context.perform_and_wait(f)
    }

    fn watch(
        &self,
        entity: &MemoryEntity,
        field: &str,
        kind: WatchKind,
        callback: WatchCallback<MemoryEntity>,
    ) -> Result<WatchToken, StoreError> {
        if !self.graph.read().contains_key(&entity.id) {
            return Err(StoreError::NotFound(entity.id.clone()));
        }
        let token = WatchToken(self.next_watch.fetch_add(1, Ordering::Relaxed));
        self.watches.lock().push(WatchEntry {
            token,
            kind,
            entity: entity.id.clone(),
            field: field.to_string(),
            callback,
        });
        Ok(token)
    }

    fn unwatch(&self, token: WatchToken) -> bool {
        let mut watches = self.watches.lock();
        let before = watches.len();
        watches.retain(|w| w.token != token);
        watches.len() != before
    }

    fn subscribe_changes(
        &self,
        listener: impl Fn(&ChangeBatch<MemoryEntity>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.changes.subscribe(listener)
    }

    fn subscribe_boundaries(
        &self,
        listener: impl Fn(&TransactionBoundary) + Send + Sync + 'static,
    ) -> ListenerId {
        self.boundaries.subscribe(listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.changes.unsubscribe(id) || self.boundaries.unsubscribe(id)
    }
}

// ============================================================================
// Transaction
// ============================================================================

type Delta = BTreeMap<String, (Option<Stored>, Option<Stored>)>;

/// Result of a finished transaction, ready to apply.
struct Commit {
    inserted: Vec<EntityId>,
    updated: Vec<EntityId>,
    deleted: Vec<EntityId>,
    objects: HashMap<EntityId, Object>,
    deltas: Vec<(EntityId, Delta)>,
    /// Every field write, in order, with the committed value before the
    /// transaction and the value after it.
    writes: Vec<(EntityId, String, Option<Stored>, Option<Stored>)>,
}

/// Buffered writes against a [`MemoryStore`].
pub struct Transaction<'a> {
    store: &'a MemoryStore,
    inserted: Vec<EntityId>,
    working: HashMap<EntityId, Object>,
    /// Committed fields of pre-existing entities touched by this transaction.
    original: HashMap<EntityId, BTreeMap<String, Stored>>,
    written: Vec<(EntityId, String)>,
    deleted: Vec<EntityId>,
    aliases: HashMap<EntityId, EntityId>,
}

impl<'a> Transaction<'a> {
    fn new(store: &'a MemoryStore) -> Self {
        Self {
            store,
            inserted: Vec::new(),
            working: HashMap::new(),
            original: HashMap::new(),
            written: Vec::new(),
            deleted: Vec::new(),
            aliases: HashMap::new(),
        }
    }

    /// Create a new entity of `kind`. The returned id is temporary until the
    /// transaction commits or [`Transaction::obtain_permanent_id`] is called.
    pub fn insert(&mut self, kind: &str) -> EntityId {
        let id = self.store.allocate_temporary(kind);
        self.inserted.push(id.clone());
        self.working.insert(id.clone(), Object::new());
        id
    }

    /// Promote `id` now rather than at commit.
    pub fn obtain_permanent_id(&mut self, id: &EntityId) -> Result<EntityId, StoreError> {
        if !id.is_temporary() {
            return Ok(id.clone());
        }
        if let Some(permanent) = self.aliases.get(id) {
            return Ok(permanent.clone());
        }
        if self.inserted.contains(id) {
            let permanent = self.store.allocate_permanent(id.kind());
            self.promote(id, &permanent);
            return Ok(permanent);
        }
        self.store.obtain_permanent_id(id)
    }

    pub fn set(&mut self, id: &EntityId, field: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        let stored = Stored::from_value(value.into()).map(|s| s.remap(&|r| self.canonical(&r)));
        self.write(id, field, |slot| {
            *slot = stored;
            Ok(())
        })
    }

    /// Set `field` to null.
    pub fn clear(&mut self, id: &EntityId, field: &str) -> Result<(), StoreError> {
        self.write(id, field, |slot| {
            *slot = None;
            Ok(())
        })
    }

    /// Add `child` to the unordered to-many relation `field`.
    pub fn add_to(&mut self, id: &EntityId, field: &str, child: &EntityId) -> Result<(), StoreError> {
        let child = self.canonical(child);
        self.write_relation(id, field, Stored::RefSet(BTreeSet::new()), |stored| match stored {
            Stored::RefSet(ids) => {
                ids.insert(child);
                true
            }
            _ => false,
        })
    }

    /// Remove `child` from the unordered to-many relation `field`.
    pub fn remove_from(&mut self, id: &EntityId, field: &str, child: &EntityId) -> Result<(), StoreError> {
        let child = self.canonical(child);
        self.write_relation(id, field, Stored::RefSet(BTreeSet::new()), |stored| match stored {
            Stored::RefSet(ids) => {
                ids.remove(&child);
                true
            }
            _ => false,
        })
    }

    /// Append `child` to the ordered to-many relation `field`.
    pub fn push(&mut self, id: &EntityId, field: &str, child: &EntityId) -> Result<(), StoreError> {
        let child = self.canonical(child);
        self.write_relation(id, field, Stored::RefList(Vec::new()), |stored| match stored {
            Stored::RefList(ids) => {
                ids.push(child);
                true
            }
            _ => false,
        })
    }

    /// Read `field` as this transaction currently sees it.
    pub fn get(&self, id: &EntityId, field: &str) -> Option<Value> {
        let id = self.canonical(id);
        if let Some(object) = self.working.get(&id) {
            return object.fields.get(field).map(stored_to_value);
        }
        let graph = self.store.graph.read();
        graph
            .get(&id)
            .filter(|o| !o.deleted)
            .and_then(|o| o.fields.get(field))
            .map(stored_to_value)
    }

    /// Delete `id`. References to it from other entities are nullified.
    pub fn delete(&mut self, id: &EntityId) -> Result<(), StoreError> {
        let id = self.canonical(id);
        self.load(&id)?;

        if let Some(pos) = self.inserted.iter().position(|i| i == &id) {
            self.inserted.remove(pos);
            self.working.remove(&id);
            self.written.retain(|(w, _)| w != &id);
        } else {
            self.deleted.push(id.clone());
        }
        self.nullify(&id)
    }

    pub fn rollback<T>(&self, message: impl Into<String>) -> Result<T, StoreError> {
        Err(StoreError::Rollback {
            message: message.into(),
            source: None,
        })
    }

    // -- internals -----------------------------------------------------------

    fn canonical(&self, id: &EntityId) -> EntityId {
        self.aliases.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    fn promote(&mut self, temporary: &EntityId, permanent: &EntityId) {
        self.aliases.insert(temporary.clone(), permanent.clone());
        self.store
            .promoted
            .lock()
            .insert(temporary.clone(), permanent.clone());
        if let Some(object) = self.working.remove(temporary) {
            self.working.insert(permanent.clone(), object);
        }
        for inserted in &mut self.inserted {
            if inserted == temporary {
                *inserted = permanent.clone();
            }
        }
        for (written, _) in &mut self.written {
            if written == temporary {
                *written = permanent.clone();
            }
        }
    }

    /// Make sure a working copy of `id` exists.
    fn load(&mut self, id: &EntityId) -> Result<(), StoreError> {
        if self.deleted.contains(id) {
            return Err(StoreError::Deleted(id.clone()));
        }
        if self.working.contains_key(id) {
            return Ok(());
        }
        let object = {
            let graph = self.store.graph.read();
            match graph.get(id) {
                None => return Err(StoreError::NotFound(id.clone())),
                Some(o) if o.deleted => return Err(StoreError::Deleted(id.clone())),
                Some(o) => o.clone(),
            }
        };
        self.original.insert(id.clone(), object.fields.clone());
        self.working.insert(id.clone(), object);
        Ok(())
    }

    fn write(
        &mut self,
        id: &EntityId,
        field: &str,
        f: impl FnOnce(&mut Option<Stored>) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let id = self.canonical(id);
        if self.deleted.contains(&id) {
            return Err(StoreError::WriteAfterDelete {
                id,
                field: field.to_string(),
            });
        }
        self.load(&id)?;
        let object = self
            .working
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let mut slot = object.fields.remove(field);
        let result = f(&mut slot);
        if let Some(value) = slot {
            object.fields.insert(field.to_string(), value);
        }
        result?;
        let key = (id, field.to_string());
        if !self.written.contains(&key) {
            self.written.push(key);
        }
        Ok(())
    }

    /// Mutate a to-many relation. An unset relation is an empty collection,
    /// both for the write and for the value it had before the transaction.
    fn write_relation(
        &mut self,
        id: &EntityId,
        field: &str,
        empty: Stored,
        f: impl FnOnce(&mut Stored) -> bool,
    ) -> Result<(), StoreError> {
        let owner = self.canonical(id);
        let seed = empty.clone();
        self.write(id, field, |slot| {
            let stored = slot.get_or_insert(seed);
            if f(stored) {
                Ok(())
            } else {
                Err(StoreError::NotARelation {
                    id: owner.clone(),
                    field: field.to_string(),
                })
            }
        })?;
        if let Some(before) = self.original.get_mut(&owner) {
            before.entry(field.to_string()).or_insert(empty);
        }
        Ok(())
    }

    fn nullify(&mut self, target: &EntityId) -> Result<(), StoreError> {
        let referencing: Vec<(EntityId, String)> = {
            let graph = self.store.graph.read();
            let committed = graph
                .iter()
                .filter(|(id, o)| !o.deleted && !self.working.contains_key(*id))
                .flat_map(|(id, o)| {
                    o.fields
                        .iter()
                        .filter(|(_, v)| v.references(target))
                        .map(move |(f, _)| (id.clone(), f.clone()))
                });
            let working = self.working.iter().flat_map(|(id, o)| {
                o.fields
                    .iter()
                    .filter(|(_, v)| v.references(target))
                    .map(move |(f, _)| (id.clone(), f.clone()))
            });
            committed.chain(working).collect()
        };

        for (id, field) in referencing {
            if &id == target || self.deleted.contains(&id) {
                continue;
            }
            self.write(&id, &field, |slot| {
                *slot = match slot.take() {
                    Some(Stored::Ref(_)) | None => None,
                    Some(Stored::RefSet(mut ids)) => {
                        ids.remove(target);
                        Some(Stored::RefSet(ids))
                    }
                    Some(Stored::RefList(mut ids)) => {
                        ids.retain(|i| i != target);
                        Some(Stored::RefList(ids))
                    }
                    Some(other) => Some(other),
                };
                Ok(())
            })?;
        }
        Ok(())
    }

    fn finish(mut self) -> Commit {
        let pending: Vec<EntityId> = self
            .inserted
            .iter()
            .filter(|id| id.is_temporary())
            .cloned()
            .collect();
        for temporary in pending {
            let permanent = self.store.allocate_permanent(temporary.kind());
            self.promote(&temporary, &permanent);
        }

        let aliases = std::mem::take(&mut self.aliases);
        let resolve = |id: EntityId| aliases.get(&id).cloned().unwrap_or(id);
        let objects: HashMap<EntityId, Object> = self
            .working
            .drain()
            .map(|(id, mut object)| {
                object.fields = std::mem::take(&mut object.fields)
                    .into_iter()
                    .map(|(f, v)| (f, v.remap(&resolve)))
                    .collect();
                (id, object)
            })
            .collect();

        let mut updated = Vec::new();
        let mut deltas = Vec::new();
        for id in &self.inserted {
            if let Some(object) = objects.get(id) {
                let delta: Delta = object
                    .fields
                    .iter()
                    .map(|(f, v)| (f.clone(), (None, Some(v.clone()))))
                    .collect();
                deltas.push((id.clone(), delta));
            }
        }

        // Stable order: first write wins.
        let mut touched: Vec<EntityId> = Vec::new();
        for (id, _) in &self.written {
            if !touched.contains(id) {
                touched.push(id.clone());
            }
        }
        for id in touched {
            if self.inserted.contains(&id) || self.deleted.contains(&id) {
                continue;
            }
            let (Some(before), Some(after)) = (self.original.get(&id), objects.get(&id)) else {
                continue;
            };
            let keys: BTreeSet<&String> = before.keys().chain(after.fields.keys()).collect();
            let delta: Delta = keys
                .into_iter()
                .filter_map(|f| {
                    let old = before.get(f);
                    let new = after.fields.get(f);
                    (old != new).then(|| (f.clone(), (old.cloned(), new.cloned())))
                })
                .collect();
            if !delta.is_empty() {
                updated.push(id.clone());
                deltas.push((id, delta));
            }
        }

        let writes = self
            .written
            .iter()
            .filter(|(id, _)| !self.deleted.contains(id))
            .map(|(id, field)| {
                let old = self.original.get(id).and_then(|f| f.get(field)).cloned();
                let new = objects.get(id).and_then(|o| o.fields.get(field)).cloned();
                (id.clone(), field.clone(), old, new)
            })
            .collect();

        let objects = objects
            .into_iter()
            .filter(|(id, _)| !self.deleted.contains(id))
            .collect();

        Commit {
            inserted: self.inserted,
            updated,
            deleted: self.deleted,
            objects,
            deltas,
            writes,
        }
    }
}

fn stored_to_value(stored: &Stored) -> Value {
    match stored {
        Stored::Scalar(v) => Value::Scalar(v.clone()),
        Stored::Ref(id) => Value::Entity(id.clone()),
        Stored::RefSet(ids) => Value::EntitySet(ids.clone()),
        Stored::RefList(ids) => Value::EntityList(ids.clone()),
    }
}
