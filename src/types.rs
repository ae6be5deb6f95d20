use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{ObserverError, Result};

// ============================================================================
// Identity
// ============================================================================

/// Identifies one store (coordinator). Change batches carry the id of the
/// store that produced them so foreign batches can be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreId(u64);

impl StoreId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable, store-assigned identity of an entity instance.
///
/// Identities handed out for entities that have not been committed yet are
/// *temporary*; the store promotes them to permanent identities on commit (or
/// earlier, on request). Only permanent identities key subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    store: StoreId,
    kind: String,
    key: u64,
    temporary: bool,
}

impl EntityId {
    pub fn permanent(store: StoreId, kind: impl Into<String>, key: u64) -> Self {
        Self {
            store,
            kind: kind.into(),
            key,
            temporary: false,
        }
    }

    pub fn temporary(store: StoreId, kind: impl Into<String>, key: u64) -> Self {
        Self {
            store,
            kind: kind.into(),
            key,
            temporary: true,
        }
    }

    pub fn store(&self) -> StoreId {
        self.store
    }

    /// Entity kind (the "table" or class name in the store's model).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.temporary { 't' } else { 'p' };
        write!(f, "graph://{}/{}/{}{}", self.store, self.kind, marker, self.key)
    }
}

// ============================================================================
// LifecycleState
// ============================================================================

bitflags! {
    /// How an entity was affected by one change batch.
    ///
    /// A single batch may report several bits for the same entity, so masks
    /// are matched by intersection rather than equality.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct LifecycleState: u8 {
        const INSERTED = 1 << 0;
        const UPDATED = 1 << 1;
        const DELETED = 1 << 2;
        const REFRESHED = 1 << 3;
        /// Default subscription mask. Refresh is left out: a refresh without
        /// modification is almost always noise.
        const ALL = Self::INSERTED.bits() | Self::UPDATED.bits() | Self::DELETED.bits();
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::ALL
    }
}

// ============================================================================
// Values
// ============================================================================

/// A field value as the store hands it out, before normalization.
///
/// `E` is the store's live entity handle type. References to other entities
/// arrive as handles, which are not safe to keep or compare across batches;
/// the normalizer turns them into [`EntityId`]s.
#[derive(Debug, Clone)]
pub enum RawValue<E> {
    /// Null / empty sentinel. Normalizes to absence.
    Null,
    Scalar(serde_json::Value),
    Entity(E),
    /// Unordered to-many relation.
    EntitySet(Vec<E>),
    /// Ordered to-many relation.
    EntityList(Vec<E>),
}

/// Observer-safe, comparable field value.
///
/// There is deliberately no null variant: an absent value is `None` wherever
/// a `Value` is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Scalar(serde_json::Value),
    Entity(EntityId),
    EntitySet(BTreeSet<EntityId>),
    EntityList(Vec<EntityId>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(v) => v.as_str(),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityId> {
        match self {
            Self::Entity(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_entity_set(&self) -> Option<&BTreeSet<EntityId>> {
        match self {
            Self::EntitySet(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn as_entity_list(&self) -> Option<&[EntityId]> {
        match self {
            Self::EntityList(ids) => Some(ids),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Scalar(serde_json::Value::String(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Scalar(serde_json::Value::String(s))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Scalar(serde_json::Value::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Scalar(serde_json::Value::Bool(b))
    }
}

impl From<EntityId> for Value {
    fn from(id: EntityId) -> Self {
        Self::Entity(id)
    }
}

// ============================================================================
// Changes
// ============================================================================

/// Store-native before/after pair for one field in the current transaction.
#[derive(Debug, Clone)]
pub struct RawChange<E> {
    pub old: Option<RawValue<E>>,
    pub new: Option<RawValue<E>>,
}

/// Normalized before/after pair for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl FieldChange {
    pub fn new(old: Option<Value>, new: Option<Value>) -> Self {
        Self { old, new }
    }

    /// True when old and new are equal, including both absent.
    pub fn is_noop(&self) -> bool {
        self.old == self.new
    }
}

/// Field name → change, one per entity per batch.
pub type ChangeSet = BTreeMap<String, FieldChange>;

/// One committed transaction as reported by the store's change feed.
#[derive(Debug, Clone)]
pub struct ChangeBatch<E> {
    /// Store that produced the batch.
    pub store: StoreId,
    pub inserted: Vec<E>,
    pub updated: Vec<E>,
    pub deleted: Vec<E>,
    pub refreshed: Vec<E>,
    /// Native field deltas for the current transaction, per entity.
    pub deltas: HashMap<EntityId, BTreeMap<String, RawChange<E>>>,
}

impl<E> ChangeBatch<E> {
    pub fn new(store: StoreId) -> Self {
        Self {
            store,
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            refreshed: Vec::new(),
            deltas: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.refreshed.is_empty()
    }
}

/// Signal that the store finished committing a transaction and is safe to
/// read from. Emitted for every commit, whether or not a given entity took
/// part in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionBoundary {
    pub store: StoreId,
    pub sequence: u64,
}

/// Classified change for one subscribed entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub state: LifecycleState,
    pub id: EntityId,
    pub changes: ChangeSet,
}

// ============================================================================
// Subscription identity
// ============================================================================

/// Returned by every `add_*` call; removes exactly that subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Identity of an observer object, used by `remove` / `remove_all`.
///
/// Derived from the observer's `Arc` allocation. The registry keeps a `Weak`
/// to every observer it knows, so the allocation (and therefore the key)
/// cannot be reused while any of its subscriptions remain registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverKey(usize);

impl ObserverKey {
    pub fn of<O: ?Sized>(observer: &std::sync::Arc<O>) -> Self {
        Self(std::sync::Arc::as_ptr(observer) as *const () as usize)
    }
}

// ============================================================================
// FieldPath
// ============================================================================

/// Ordered field names walked from a root entity, e.g. `parent.stringValue`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parse a dot-separated path. Empty paths and empty segments are rejected.
    pub fn parse(path: &str) -> Result<Self> {
        Self::from_segments(path.split('.'))
    }

    pub fn from_segments(segments: impl IntoIterator<Item = impl Into<String>>) -> Result<Self> {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(ObserverError::InvalidFieldPath {
                path: segments.join("."),
            });
        }
        Ok(Self(segments))
    }

    /// The field watched directly on the root entity.
    pub fn head(&self) -> &str {
        &self.0[0]
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_single_hop(&self) -> bool {
        self.0.len() == 1
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}
