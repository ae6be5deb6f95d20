use thiserror::Error;

use crate::types::EntityId;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Failures reported by an object store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Entity not found: {0}")]
    NotFound(EntityId),

    #[error("Entity deleted: {0}")]
    Deleted(EntityId),

    #[error("Cannot write {field} on {id}: entity was deleted earlier in this transaction")]
    WriteAfterDelete { id: EntityId, field: String },

    #[error("Field \"{field}\" on {id} does not hold an entity relation")]
    NotARelation { id: EntityId, field: String },

    #[error("Transaction rolled back: {message}")]
    Rollback {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

// ---------------------------------------------------------------------------
// ObserverError — top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ObserverError {
    /// The store refused to promote a temporary identity. Subscriptions are
    /// only ever keyed by permanent identities.
    #[error("Entity {id} has a temporary identity that could not be made permanent")]
    TemporaryIdentity { id: EntityId },

    #[error("Entity {id} cannot be resolved by the store")]
    EntityNotFound { id: EntityId },

    #[error("Invalid field path \"{path}\"")]
    InvalidFieldPath { path: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Convenience alias — the default error type is `ObserverError`.
pub type Result<T, E = ObserverError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
