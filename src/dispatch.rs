//! Dispatcher — routes classified records to lifecycle subscriptions.
//!
//! Each record's bucket is snapshotted under the registry lock; callbacks run
//! with no lock held. The live entity handle is resolved once per record and
//! shared by every matching subscription.

use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;

use crate::registry::{Delivery, Registry};
use crate::stats::ObserverStats;
use crate::store::traits::ObjectStore;
use crate::types::{ChangeRecord, LifecycleState};

/// What one [`Dispatcher::dispatch`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Matching subscriptions whose observer was already gone.
    pub expired: usize,
    /// Records dropped because the entity could not be resolved.
    pub dropped: usize,
    /// Subscriptions removed after their entity was deleted.
    pub forgotten: usize,
    pub panicked: usize,
    /// Subscriptions purged by the closing sweep.
    pub swept: usize,
}

pub struct Dispatcher<'a, S: ObjectStore> {
    pub store: &'a S,
    pub registry: &'a Mutex<Registry<S>>,
    pub stats: &'a ObserverStats,
    pub catch_panics: bool,
    pub name: Option<&'a str>,
}

impl<S: ObjectStore> Dispatcher<'_, S> {
    pub fn dispatch(&self, records: &[ChangeRecord]) -> DispatchReport {
        let mut report = DispatchReport::default();

        for record in records {
            self.deliver_record(record, &mut report);

            if record.state.contains(LifecycleState::DELETED) {
                let removed = self.registry.lock().forget_entity(&record.id);
                report.forgotten += removed.teardown();
            }
        }

        if report.expired > 0 {
            let removed = self.registry.lock().sweep();
            report.swept = removed.teardown();
            self.stats.sweep();
            tracing::debug!(
                observer = self.name,
                expired = report.expired,
                swept = report.swept,
                "swept expired subscriptions"
            );
        }
        report
    }

    fn deliver_record(&self, record: &ChangeRecord, report: &mut DispatchReport) {
        let bucket = self.registry.lock().lifecycle_bucket(&record.id);
        let (alive, expired): (Vec<_>, Vec<_>) = bucket
            .into_iter()
            .filter(|sub| sub.matches(record.state))
            .partition(|sub| sub.is_alive());
        report.expired += expired.len();
        if alive.is_empty() {
            return;
        }

        let entity = match self.store.resolve(&record.id) {
            Ok(entity) => entity,
            Err(e) => {
                report.dropped += 1;
                self.stats.record_dropped();
                tracing::warn!(
                    observer = self.name,
                    entity = %record.id,
                    error = %e,
                    "dropping change record for unresolvable entity"
                );
                return;
            }
        };
        self.store.refresh(&entity);
        self.stats.record_dispatched();
        tracing::trace!(
            observer = self.name,
            entity = %record.id,
            state = ?record.state,
            fields = record.changes.len(),
            subscribers = alive.len(),
            "dispatching change record"
        );

        for sub in alive {
            let delivery = if self.catch_panics {
                catch_unwind(AssertUnwindSafe(|| {
                    sub.deliver(&entity, &record.changes, record.state)
                }))
            } else {
                Ok(sub.deliver(&entity, &record.changes, record.state))
            };
            match delivery {
                Ok(Delivery::Fired) => {
                    report.delivered += 1;
                    self.stats.callback_fired();
                }
                Ok(Delivery::Expired) => report.expired += 1,
                Err(_) => {
                    report.panicked += 1;
                    self.stats.callback_fired();
                    self.stats.callback_panicked();
                    tracing::warn!(
                        observer = self.name,
                        entity = %record.id,
                        subscription = %sub.id,
                        "lifecycle callback panicked"
                    );
                }
            }
        }
    }
}
