//! Orphan Candidate State Machine
//!
//! Tracks one correlation key across scans. A discrepancy must persist
//! for both a minimum number of consecutive successful scans and a
//! minimum wall-clock age before it is confirmed as an orphan.

use crate::domain::ports::{InventorySide, ResourceKind, ResourceRecord};
use crate::reconcile::correlator::{CorrelationKey, PairStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Side and State
// =============================================================================

/// Which system holds the unmatched record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrphanSide {
    ClusterOnly,
    BackendOnly,
}

impl OrphanSide {
    pub fn from_status(status: PairStatus) -> Option<Self> {
        match status {
            PairStatus::ClusterOnly => Some(OrphanSide::ClusterOnly),
            PairStatus::BackendOnly => Some(OrphanSide::BackendOnly),
            PairStatus::Healthy => None,
        }
    }

    /// Side holding the record
    pub fn holder(&self) -> InventorySide {
        match self {
            OrphanSide::ClusterOnly => InventorySide::Cluster,
            OrphanSide::BackendOnly => InventorySide::Backend,
        }
    }
}

impl std::fmt::Display for OrphanSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrphanSide::ClusterOnly => write!(f, "cluster_only"),
            OrphanSide::BackendOnly => write!(f, "backend_only"),
        }
    }
}

impl std::str::FromStr for OrphanSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "cluster_only" | "clusteronly" | "cluster" => Ok(OrphanSide::ClusterOnly),
            "backend_only" | "backendonly" | "backend" => Ok(OrphanSide::BackendOnly),
            _ => Err(format!("Invalid orphan side: {}", s)),
        }
    }
}

/// Lifecycle state of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CandidateState {
    Candidate,
    Confirmed,
    Resolved,
}

impl std::fmt::Display for CandidateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateState::Candidate => write!(f, "candidate"),
            CandidateState::Confirmed => write!(f, "confirmed"),
            CandidateState::Resolved => write!(f, "resolved"),
        }
    }
}

impl std::str::FromStr for CandidateState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "candidate" => Ok(CandidateState::Candidate),
            "confirmed" => Ok(CandidateState::Confirmed),
            "resolved" => Ok(CandidateState::Resolved),
            _ => Err(format!("Invalid candidate state: {}", s)),
        }
    }
}

/// Why a candidate was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Both sides observed present
    Matched,
    /// Key no longer appears in either inventory
    Vanished,
}

// =============================================================================
// Hysteresis Policy
// =============================================================================

/// Promotion thresholds for Candidate -> Confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HysteresisPolicy {
    pub min_consecutive_observations: u32,
    pub min_orphan_age: Duration,
}

impl HysteresisPolicy {
    pub fn new(min_consecutive_observations: u32, min_orphan_age: Duration) -> Self {
        Self {
            min_consecutive_observations,
            min_orphan_age,
        }
    }

    fn satisfied_by(&self, candidate: &OrphanCandidate, now: DateTime<Utc>) -> bool {
        candidate.consecutive_observations >= self.min_consecutive_observations
            && now - candidate.first_observed_at >= self.min_orphan_age
    }
}

impl Default for HysteresisPolicy {
    fn default() -> Self {
        Self {
            min_consecutive_observations: 3,
            min_orphan_age: Duration::hours(24),
        }
    }
}

/// Effect of one observation on a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Created,
    Advanced,
    Confirmed,
    Resolved,
    Unchanged,
}

// =============================================================================
// Orphan Candidate
// =============================================================================

/// Tracked discrepancy for one correlation key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanCandidate {
    pub key: CorrelationKey,
    pub side: OrphanSide,
    pub kind: ResourceKind,
    pub native_id: String,
    pub size_bytes: u64,
    pub first_observed_at: DateTime<Utc>,
    pub last_observed_at: DateTime<Utc>,
    pub consecutive_observations: u32,
    pub state: CandidateState,
    pub last_scan_generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

impl OrphanCandidate {
    /// Start tracking a discrepancy first seen in `generation`
    pub fn new(
        key: CorrelationKey,
        side: OrphanSide,
        record: &ResourceRecord,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            side,
            kind: record.kind,
            native_id: record.native_id.clone(),
            size_bytes: record.size_bytes,
            first_observed_at: now,
            last_observed_at: now,
            consecutive_observations: 1,
            state: CandidateState::Candidate,
            last_scan_generation: generation,
            confirmed_at: None,
            resolved_at: None,
            resolution: None,
        }
    }

    /// Record another scan in which the discrepancy persisted
    pub fn observe(
        &mut self,
        record: &ResourceRecord,
        generation: u64,
        now: DateTime<Utc>,
        policy: &HysteresisPolicy,
    ) -> Transition {
        self.consecutive_observations = self.consecutive_observations.saturating_add(1);
        self.last_observed_at = now;
        self.last_scan_generation = generation;
        self.native_id = record.native_id.clone();
        self.size_bytes = record.size_bytes;

        self.evaluate(now, policy)
    }

    /// Promote to Confirmed if the hysteresis policy is met
    pub fn evaluate(&mut self, now: DateTime<Utc>, policy: &HysteresisPolicy) -> Transition {
        if self.state == CandidateState::Candidate && policy.satisfied_by(self, now) {
            self.state = CandidateState::Confirmed;
            self.confirmed_at = Some(now);
            return Transition::Confirmed;
        }
        Transition::Advanced
    }

    /// Mark the discrepancy gone
    pub fn resolve(&mut self, resolution: Resolution, generation: u64, now: DateTime<Utc>) -> Transition {
        if self.state == CandidateState::Resolved {
            return Transition::Unchanged;
        }
        self.state = CandidateState::Resolved;
        self.resolution = Some(resolution);
        self.resolved_at = Some(now);
        self.last_scan_generation = generation;
        Transition::Resolved
    }

    /// Resolved candidates stay visible for one more scan
    pub fn is_expired(&self, generation: u64) -> bool {
        self.state == CandidateState::Resolved && generation > self.last_scan_generation
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == CandidateState::Confirmed
    }

    pub fn is_active(&self) -> bool {
        self.state != CandidateState::Resolved
    }

    /// Time since the discrepancy was first observed
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.first_observed_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::KeyScope;

    fn record() -> ResourceRecord {
        ResourceRecord::new(ResourceKind::Volume, "pv-a")
            .with_key("pvc-a")
            .with_size(5 * 1024 * 1024 * 1024)
    }

    fn candidate(now: DateTime<Utc>) -> OrphanCandidate {
        let key = CorrelationKey::normalize(KeyScope::Volume, "pvc-a").unwrap();
        OrphanCandidate::new(key, OrphanSide::ClusterOnly, &record(), 1, now)
    }

    #[test]
    fn test_new_candidate() {
        let now = Utc::now();
        let c = candidate(now);
        assert_eq!(c.state, CandidateState::Candidate);
        assert_eq!(c.consecutive_observations, 1);
        assert_eq!(c.first_observed_at, now);
        assert_eq!(c.size_bytes, 5 * 1024 * 1024 * 1024);
        assert!(c.is_active());
    }

    #[test]
    fn test_needs_both_count_and_age() {
        let policy = HysteresisPolicy::new(2, Duration::minutes(30));
        let start = Utc::now();
        let mut c = candidate(start);

        // Enough observations, not enough age
        let t = c.observe(&record(), 2, start + Duration::minutes(5), &policy);
        assert_eq!(t, Transition::Advanced);
        assert_eq!(c.consecutive_observations, 2);
        assert_eq!(c.state, CandidateState::Candidate);

        // Age reached on the next scan
        let t = c.observe(&record(), 3, start + Duration::minutes(31), &policy);
        assert_eq!(t, Transition::Confirmed);
        assert!(c.is_confirmed());
        assert_eq!(c.first_observed_at, start);
    }

    #[test]
    fn test_age_alone_does_not_confirm() {
        let policy = HysteresisPolicy::new(3, Duration::minutes(1));
        let start = Utc::now();
        let mut c = candidate(start);

        let t = c.observe(&record(), 2, start + Duration::hours(6), &policy);
        assert_eq!(t, Transition::Advanced);
        assert_eq!(c.state, CandidateState::Candidate);
    }

    #[test]
    fn test_single_observation_policy_confirms_on_evaluate() {
        let policy = HysteresisPolicy::new(1, Duration::zero());
        let now = Utc::now();
        let mut c = candidate(now);
        assert_eq!(c.evaluate(now, &policy), Transition::Confirmed);
    }

    #[test]
    fn test_resolve_and_expiry() {
        let now = Utc::now();
        let mut c = candidate(now);

        assert_eq!(c.resolve(Resolution::Matched, 4, now), Transition::Resolved);
        assert_eq!(c.resolve(Resolution::Matched, 4, now), Transition::Unchanged);
        assert_eq!(c.resolution, Some(Resolution::Matched));
        assert!(!c.is_active());
        assert!(!c.is_expired(4));
        assert!(c.is_expired(5));
    }

    #[test]
    fn test_parse_side_and_state() {
        assert_eq!("cluster_only".parse::<OrphanSide>().unwrap(), OrphanSide::ClusterOnly);
        assert_eq!("backend-only".parse::<OrphanSide>().unwrap(), OrphanSide::BackendOnly);
        assert!("sideways".parse::<OrphanSide>().is_err());
        assert_eq!("Confirmed".parse::<CandidateState>().unwrap(), CandidateState::Confirmed);
        assert_eq!(OrphanSide::BackendOnly.holder(), InventorySide::Backend);
    }
}
