//! Value normalization — turns store-native values into comparable,
//! observer-safe [`Value`]s.
//!
//! - a reference to one entity becomes its [`EntityId`];
//! - an unordered relation becomes a `BTreeSet<EntityId>`, an ordered one a
//!   `Vec<EntityId>`;
//! - null (either [`RawValue::Null`] or a JSON `null` scalar) becomes absence.

use std::collections::{BTreeMap, BTreeSet};

use crate::store::traits::EntityHandle;
use crate::types::{ChangeSet, EntityId, FieldChange, RawChange, RawValue, Value};

pub fn normalize<E: EntityHandle>(raw: Option<&RawValue<E>>) -> Option<Value> {
    match raw? {
        RawValue::Null => None,
        RawValue::Scalar(serde_json::Value::Null) => None,
        RawValue::Scalar(v) => Some(Value::Scalar(v.clone())),
        RawValue::Entity(e) => Some(Value::Entity(e.id().clone())),
        RawValue::EntitySet(es) => Some(Value::EntitySet(
            es.iter().map(|e| e.id().clone()).collect(),
        )),
        RawValue::EntityList(es) => Some(Value::EntityList(
            es.iter().map(|e| e.id().clone()).collect(),
        )),
    }
}

pub fn normalize_change<E: EntityHandle>(raw: &RawChange<E>) -> FieldChange {
    FieldChange::new(normalize(raw.old.as_ref()), normalize(raw.new.as_ref()))
}

/// Normalize every entry of one entity's native delta.
pub fn normalize_delta<E: EntityHandle>(delta: &BTreeMap<String, RawChange<E>>) -> ChangeSet {
    delta
        .iter()
        .map(|(field, raw)| (field.clone(), normalize_change(raw)))
        .collect()
}

// ============================================================================
// Typed conversion
// ============================================================================

/// Conversion from a normalized [`Value`] into a concrete Rust type.
///
/// Returns `None` when the value has a different shape.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_scalar().cloned()
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_scalar().and_then(serde_json::Value::as_i64)
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_scalar().and_then(serde_json::Value::as_f64)
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_scalar().and_then(serde_json::Value::as_bool)
    }
}

impl FromValue for EntityId {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_entity().cloned()
    }
}

impl FromValue for BTreeSet<EntityId> {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_entity_set().cloned()
    }
}

impl FromValue for Vec<EntityId> {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_entity_list().map(<[EntityId]>::to_vec)
    }
}

/// Typed view of a [`FieldChange`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange<T> {
    pub old: Option<T>,
    pub new: Option<T>,
}

impl<T: FromValue> ValueChange<T> {
    /// Convert both sides. A side whose value has the wrong shape becomes
    /// `None` and is logged.
    pub fn from_change(change: &FieldChange) -> Self {
        Self {
            old: convert(change.old.as_ref()),
            new: convert(change.new.as_ref()),
        }
    }
}

fn convert<T: FromValue>(value: Option<&Value>) -> Option<T> {
    let value = value?;
    let converted = T::from_value(value);
    if converted.is_none() {
        tracing::warn!(
            target_type = std::any::type_name::<T>(),
            value = ?value,
            "field value has unexpected shape; delivering as absent"
        );
    }
    converted
}
