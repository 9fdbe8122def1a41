//! Reconciliation Events
//!
//! Reports emitted by the engine and scheduler for external consumers
//! (metrics, logs, API) to react to scan results.

use crate::domain::ports::{InventorySide, KeyScope, ResourceKind};
use crate::reconcile::candidate::{CandidateState, OrphanCandidate, OrphanSide};
use crate::reconcile::correlator::KeyCollision;
use crate::reconcile::usage::{UsageDrift, UsageSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Phase of the scan cycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CyclePhase {
    Idle,
    FetchingBoth,
    Correlating,
    Classifying,
    Committing,
    Degraded,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CyclePhase::Idle => write!(f, "idle"),
            CyclePhase::FetchingBoth => write!(f, "fetching_both"),
            CyclePhase::Correlating => write!(f, "correlating"),
            CyclePhase::Classifying => write!(f, "classifying"),
            CyclePhase::Committing => write!(f, "committing"),
            CyclePhase::Degraded => write!(f, "degraded"),
        }
    }
}

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CycleOutcome {
    /// Both sources answered and the batch was committed
    Committed,
    /// A source failed; nothing was classified
    Degraded,
    /// Classification ran but the store rejected the batch
    CommitFailed,
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleOutcome::Committed => write!(f, "committed"),
            CycleOutcome::Degraded => write!(f, "degraded"),
            CycleOutcome::CommitFailed => write!(f, "commit_failed"),
        }
    }
}

/// Data-integrity problem found while correlating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Anomaly {
    /// Several records on one side share a key; the key was skipped
    KeyCollision(KeyCollision),
    /// Records without a usable key
    Unmatchable { kind: ResourceKind, count: usize },
}

/// Per-side availability of a cycle's fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub side: InventorySide,
    pub source_name: String,
    pub available: bool,
    pub record_count: usize,
    /// Kinds the source could not list this cycle
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unlisted_kinds: Vec<ResourceKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Number of candidates sharing a side, kind and state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateCount {
    pub side: OrphanSide,
    pub kind: ResourceKind,
    pub state: CandidateState,
    pub count: usize,
}

impl CandidateCount {
    /// Group candidates by side, kind and state
    pub fn tally<'a>(candidates: impl IntoIterator<Item = &'a OrphanCandidate>) -> Vec<Self> {
        let mut counts: BTreeMap<(OrphanSide, ResourceKind, CandidateState), usize> =
            BTreeMap::new();
        for c in candidates {
            *counts.entry((c.side, c.kind, c.state)).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|((side, kind, state), count)| Self {
                side,
                kind,
                state,
                count,
            })
            .collect()
    }
}

/// Result of one scan cycle, handed to every reporting sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Attempt counter, advanced for every cycle
    pub cycle_id: u64,
    /// Committed generation this report reflects
    pub generation: u64,
    pub outcome: CycleOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceStatus>,
    /// Candidates that reached Confirmed in this cycle
    pub new_confirmed: Vec<OrphanCandidate>,
    /// Candidates that were resolved in this cycle
    pub resolved: Vec<OrphanCandidate>,
    pub new_candidates: usize,
    pub evicted: usize,
    pub healthy_pairs: usize,
    pub active_candidates: usize,
    pub confirmed_orphans: usize,
    /// Every candidate held after this cycle, by side, kind and state
    #[serde(default)]
    pub candidate_counts: Vec<CandidateCount>,
    /// Backend snapshots left alone because they are inside retention
    #[serde(default)]
    pub within_retention: usize,
    /// Scopes left out of classification because a side could not list them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_scopes: Vec<KeyScope>,
    pub uncorrelated: BTreeMap<ResourceKind, usize>,
    pub anomalies: Vec<Anomaly>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<UsageDrift>,
    /// Why the cycle was degraded or failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CycleReport {
    pub fn is_degraded(&self) -> bool {
        self.outcome == CycleOutcome::Degraded
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Number of unmatchable records across kinds
    pub fn unmatchable_total(&self) -> usize {
        self.anomalies
            .iter()
            .map(|a| match a {
                Anomaly::Unmatchable { count, .. } => *count,
                Anomaly::KeyCollision(_) => 0,
            })
            .sum()
    }

    pub fn collisions(&self) -> impl Iterator<Item = &KeyCollision> {
        self.anomalies.iter().filter_map(|a| match a {
            Anomaly::KeyCollision(c) => Some(c),
            Anomaly::Unmatchable { .. } => None,
        })
    }
}

/// A scheduler tick dropped because the previous cycle was still running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOverrun {
    pub at: DateTime<Utc>,
    /// Cycle still in flight when the tick fired
    pub in_flight_cycle: u64,
    pub total_overruns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::KeyScope;
    use crate::reconcile::correlator::CorrelationKey;

    fn report(anomalies: Vec<Anomaly>) -> CycleReport {
        let now = Utc::now();
        CycleReport {
            cycle_id: 1,
            generation: 1,
            outcome: CycleOutcome::Committed,
            started_at: now,
            finished_at: now + chrono::Duration::seconds(2),
            sources: vec![],
            new_confirmed: vec![],
            resolved: vec![],
            new_candidates: 0,
            evicted: 0,
            healthy_pairs: 0,
            active_candidates: 0,
            confirmed_orphans: 0,
            candidate_counts: vec![],
            within_retention: 0,
            skipped_scopes: vec![],
            uncorrelated: BTreeMap::new(),
            anomalies,
            usage: None,
            drift: None,
            reason: None,
        }
    }

    #[test]
    fn test_anomaly_accessors() {
        let collision = KeyCollision {
            key: CorrelationKey::normalize(KeyScope::Volume, "pvc-1").unwrap(),
            side: InventorySide::Backend,
            native_ids: vec!["tank/a".into(), "tank/b".into()],
        };
        let r = report(vec![
            Anomaly::KeyCollision(collision.clone()),
            Anomaly::Unmatchable {
                kind: ResourceKind::Volume,
                count: 3,
            },
            Anomaly::Unmatchable {
                kind: ResourceKind::Snapshot,
                count: 2,
            },
        ]);

        assert_eq!(r.unmatchable_total(), 5);
        assert_eq!(r.collisions().collect::<Vec<_>>(), vec![&collision]);
        assert_eq!(r.duration(), chrono::Duration::seconds(2));
        assert!(!r.is_degraded());
    }

    #[test]
    fn test_candidate_tally() {
        let now = Utc::now();
        let candidate = |k: &str, kind: ResourceKind, side: OrphanSide| {
            let key = CorrelationKey::normalize(KeyScope::Volume, k).unwrap();
            let record = crate::domain::ports::ResourceRecord::new(kind, k);
            OrphanCandidate::new(key, side, &record, 1, now)
        };
        let mut confirmed = candidate("c", ResourceKind::Volume, OrphanSide::ClusterOnly);
        confirmed.state = CandidateState::Confirmed;
        let candidates = vec![
            candidate("a", ResourceKind::Volume, OrphanSide::ClusterOnly),
            candidate("b", ResourceKind::Volume, OrphanSide::ClusterOnly),
            confirmed,
            candidate("d", ResourceKind::BackendSnapshot, OrphanSide::BackendOnly),
        ];

        let counts = CandidateCount::tally(&candidates);
        assert_eq!(counts.len(), 3);
        assert_eq!(
            counts[0],
            CandidateCount {
                side: OrphanSide::ClusterOnly,
                kind: ResourceKind::Volume,
                state: CandidateState::Candidate,
                count: 2,
            }
        );
        assert_eq!(counts[1].state, CandidateState::Confirmed);
        assert_eq!(counts[2].kind, ResourceKind::BackendSnapshot);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(CyclePhase::FetchingBoth.to_string(), "fetching_both");
        assert_eq!(CycleOutcome::CommitFailed.to_string(), "commit_failed");
    }
}
