//! Findings Store
//!
//! Process-lifetime home of orphan candidates. Writers replace the whole
//! snapshot under a short write lock; readers clone an `Arc` and never see
//! a half-applied generation.

use crate::error::{Error, Result};
use crate::reconcile::candidate::{CandidateState, OrphanCandidate, OrphanSide};
use crate::reconcile::correlator::CorrelationKey;
use crate::reconcile::events::CycleReport;
use crate::reconcile::usage::UsageSummary;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable view of the store at one generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingsSnapshot {
    pub generation: u64,
    pub committed_at: Option<DateTime<Utc>>,
    pub candidates: BTreeMap<CorrelationKey, OrphanCandidate>,
    pub usage: Option<UsageSummary>,
}

impl FindingsSnapshot {
    pub fn get(&self, key: &CorrelationKey) -> Option<&OrphanCandidate> {
        self.candidates.get(key)
    }

    /// Candidates matching optional side and state filters
    pub fn filter(
        &self,
        side: Option<OrphanSide>,
        state: Option<CandidateState>,
    ) -> impl Iterator<Item = &OrphanCandidate> {
        self.candidates.values().filter(move |c| {
            side.map_or(true, |s| c.side == s) && state.map_or(true, |s| c.state == s)
        })
    }

    pub fn confirmed(&self) -> impl Iterator<Item = &OrphanCandidate> {
        self.filter(None, Some(CandidateState::Confirmed))
    }

    pub fn count_in_state(&self, state: CandidateState) -> usize {
        self.filter(None, Some(state)).count()
    }

    /// Candidates not yet resolved
    pub fn active_count(&self) -> usize {
        self.candidates.values().filter(|c| c.is_active()).count()
    }
}

/// Full replacement state for the next generation
#[derive(Debug, Clone)]
pub struct FindingsBatch {
    pub generation: u64,
    pub committed_at: DateTime<Utc>,
    pub candidates: BTreeMap<CorrelationKey, OrphanCandidate>,
    pub usage: Option<UsageSummary>,
}

// =============================================================================
// Findings Store
// =============================================================================

/// Single-writer, many-reader store of orphan candidates
#[derive(Debug, Default)]
pub struct FindingsStore {
    current: RwLock<Arc<FindingsSnapshot>>,
    /// Serialises writers so the generation check and swap are atomic
    write_lock: Mutex<()>,
    last_report: RwLock<Option<Arc<CycleReport>>>,
}

impl FindingsStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Consistent read of the current generation
    pub fn snapshot(&self) -> Arc<FindingsSnapshot> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    /// Atomically install the next generation.
    ///
    /// Rejects any batch whose generation is not exactly one past the
    /// current one; the previous snapshot stays in place.
    pub fn commit(&self, batch: FindingsBatch) -> Result<Arc<FindingsSnapshot>> {
        let _writer = self.write_lock.lock();

        let current = self.generation();
        if batch.generation != current + 1 {
            return Err(Error::StoreCommitFailure {
                reason: format!(
                    "batch generation {} does not follow committed generation {}",
                    batch.generation, current
                ),
            });
        }

        let snapshot = Arc::new(FindingsSnapshot {
            generation: batch.generation,
            committed_at: Some(batch.committed_at),
            candidates: batch.candidates,
            usage: batch.usage,
        });

        *self.current.write() = snapshot.clone();

        debug!(
            generation = snapshot.generation,
            candidates = snapshot.candidates.len(),
            "Committed findings"
        );

        Ok(snapshot)
    }

    /// Remember the latest cycle report for status queries
    pub fn record_report(&self, report: CycleReport) {
        *self.last_report.write() = Some(Arc::new(report));
    }

    pub fn last_report(&self) -> Option<Arc<CycleReport>> {
        self.last_report.read().clone()
    }
}
