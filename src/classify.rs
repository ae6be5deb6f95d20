//! Change classification — turns one store [`ChangeBatch`] into per-entity
//! [`ChangeRecord`]s carrying a lifecycle bitmask and a normalized diff.

use std::collections::HashSet;

use crate::normalize::normalize_delta;
use crate::store::traits::EntityHandle;
use crate::types::{ChangeBatch, ChangeRecord, ChangeSet, EntityId, LifecycleState};

/// Output of [`Classifier::classify`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// One record per affected, subscribed entity, in batch order.
    pub records: Vec<ChangeRecord>,
    /// Entities whose delta was normalized.
    pub diffs_computed: usize,
    /// Refresh-only records dropped as noise.
    pub suppressed: usize,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    suppress_refresh_only: bool,
}

impl Classifier {
    pub fn new(suppress_refresh_only: bool) -> Self {
        Self {
            suppress_refresh_only,
        }
    }

    /// Classify `batch`.
    ///
    /// `is_subscribed` is asked once per distinct entity; entities it rejects
    /// are dropped before their delta is looked at. Records come out in the
    /// order entities first appear across the inserted, updated, deleted and
    /// refreshed sets.
    pub fn classify<E: EntityHandle>(
        &self,
        batch: &ChangeBatch<E>,
        mut is_subscribed: impl FnMut(&EntityId) -> bool,
    ) -> Classification {
        let inserted = ids(&batch.inserted);
        let updated = ids(&batch.updated);
        let deleted = ids(&batch.deleted);
        let refreshed = ids(&batch.refreshed);

        let mut seen: HashSet<&EntityId> = HashSet::new();
        let mut out = Classification::default();

        let union = batch
            .inserted
            .iter()
            .chain(&batch.updated)
            .chain(&batch.deleted)
            .chain(&batch.refreshed)
            .map(EntityHandle::id);

        for id in union {
            if !seen.insert(id) || !is_subscribed(id) {
                continue;
            }

            let mut state = LifecycleState::empty();
            state.set(LifecycleState::INSERTED, inserted.contains(id));
            state.set(LifecycleState::UPDATED, updated.contains(id));
            state.set(LifecycleState::DELETED, deleted.contains(id));
            state.set(LifecycleState::REFRESHED, refreshed.contains(id));

            let changes: ChangeSet = match batch.deltas.get(id) {
                Some(delta) => {
                    out.diffs_computed += 1;
                    normalize_delta(delta)
                }
                None => ChangeSet::new(),
            };

            if self.suppress_refresh_only && state == LifecycleState::REFRESHED && changes.is_empty() {
                out.suppressed += 1;
                continue;
            }

            out.records.push(ChangeRecord {
                state,
                id: id.clone(),
                changes,
            });
        }
        out
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(true)
    }
}

fn ids<E: EntityHandle>(entities: &[E]) -> HashSet<&EntityId> {
    entities.iter().map(EntityHandle::id).collect()
}
