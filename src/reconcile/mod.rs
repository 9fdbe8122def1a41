//! Reconciliation Module
//!
//! The correlation core of the orphan monitor:
//! - Identity correlation of cluster and backend inventories
//! - Hysteresis state machine for orphan candidates
//! - Scan cycle engine and single-flight scheduler
//! - Usage accounting and drift

pub mod candidate;
pub mod correlator;
pub mod engine;
pub mod events;
pub mod scheduler;
pub mod usage;

#[cfg(test)]
pub(crate) mod test_support;

pub use candidate::{
    CandidateState, HysteresisPolicy, OrphanCandidate, OrphanSide, Resolution, Transition,
};
pub use correlator::{
    Correlation, CorrelationKey, CorrelationPair, IdentityCorrelator, KeyCollision, PairStatus,
};
pub use engine::{EngineConfig, ReconciliationEngine};
pub use events::{
    Anomaly, CandidateCount, CycleOutcome, CyclePhase, CycleReport, ScanOverrun, SourceStatus,
};
pub use scheduler::ScanScheduler;
pub use usage::{UsageDrift, UsageSummary};
