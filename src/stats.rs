//! Saga persistence statistics

use std::sync::atomic::{AtomicU64, Ordering};

use crate::InstanceResolution;

/// Counters kept by the saga persistence behavior
#[derive(Debug, Default)]
pub struct SagaStats {
    pub found: AtomicU64,
    pub created: AtomicU64,
    pub not_found: AtomicU64,
    pub saved: AtomicU64,
    pub updated: AtomicU64,
    pub completed: AtomicU64,
    pub concurrency_conflicts: AtomicU64,
    pub duplicate_unique_values: AtomicU64,
}

impl SagaStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_resolution(&self, resolution: InstanceResolution) {
        let counter = match resolution {
            InstanceResolution::Found => &self.found,
            InstanceResolution::Created => &self.created,
            InstanceResolution::NotFound => &self.not_found,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, error: &crate::PersisterError) {
        if error.is_concurrency_conflict() {
            self.concurrency_conflicts.fetch_add(1, Ordering::Relaxed);
        } else if error.is_duplicate_unique_value() {
            self.duplicate_unique_values.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> SagaStatsSnapshot {
        SagaStatsSnapshot {
            found: self.found.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            concurrency_conflicts: self.concurrency_conflicts.load(Ordering::Relaxed),
            duplicate_unique_values: self.duplicate_unique_values.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SagaStatsSnapshot {
    pub found: u64,
    pub created: u64,
    pub not_found: u64,
    pub saved: u64,
    pub updated: u64,
    pub completed: u64,
    pub concurrency_conflicts: u64,
    pub duplicate_unique_values: u64,
}
