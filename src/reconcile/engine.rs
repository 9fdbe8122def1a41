//! Reconciliation Engine - The "Brain"
//!
//! Runs one scan cycle at a time:
//! - Fetches both inventories concurrently, each under its own timeout
//! - Correlates records by identity
//! - Advances the per-key orphan state machine
//! - Commits the new generation to the findings store as one batch
//!
//! A cycle where either source fails is degraded and touches nothing.

use crate::domain::ports::{
    InventorySide, InventorySourceRef, KeyScope, ReportingSinkRef, ResourceKind, ResourceRecord,
};
use crate::error::{Error, Result};
use crate::reconcile::candidate::{
    CandidateState, HysteresisPolicy, OrphanCandidate, OrphanSide, Resolution, Transition,
};
use crate::reconcile::correlator::{Correlation, CorrelationKey, IdentityCorrelator};
use crate::reconcile::events::{
    Anomaly, CandidateCount, CycleOutcome, CyclePhase, CycleReport, ScanOverrun, SourceStatus,
};
use crate::reconcile::usage::{UsageDrift, UsageSummary};
use crate::store::{FindingsBatch, FindingsSnapshot, FindingsStore};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Engine Configuration
// =============================================================================

/// Configuration for the reconciliation engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Consecutive successful scans before a discrepancy is confirmed
    pub min_consecutive_observations: u32,
    /// Minimum time since first observation before confirmation
    pub min_orphan_age: Duration,
    /// Per-source fetch timeout
    pub fetch_timeout: Duration,
    /// Age a backend snapshot must reach before it can become a candidate
    pub snapshot_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_consecutive_observations: 3,
            min_orphan_age: Duration::from_secs(24 * 3600),
            fetch_timeout: Duration::from_secs(100),
            snapshot_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_consecutive_observations < 1 {
            return Err(Error::Configuration(
                "min_consecutive_observations must be at least 1".into(),
            ));
        }
        if self.fetch_timeout.is_zero() {
            return Err(Error::Configuration("fetch_timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn policy(&self) -> Result<HysteresisPolicy> {
        let min_age = chrono::Duration::from_std(self.min_orphan_age)
            .map_err(|e| Error::Configuration(format!("min_orphan_age out of range: {}", e)))?;
        Ok(HysteresisPolicy::new(self.min_consecutive_observations, min_age))
    }

    pub fn snapshot_retention(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.snapshot_retention)
            .map_err(|e| Error::Configuration(format!("snapshot_retention out of range: {}", e)))
    }
}

// =============================================================================
// Fetch and Classification Results
// =============================================================================

/// One side's records plus the kinds it could not list
#[derive(Debug, Default)]
struct Inventory {
    records: Vec<ResourceRecord>,
    unlisted: Vec<ResourceKind>,
}

impl Inventory {
    /// Records outside the skipped scopes
    fn observed(&self, skipped: &BTreeSet<KeyScope>) -> Vec<ResourceRecord> {
        self.records
            .iter()
            .filter(|r| r.kind.scope().map_or(true, |scope| !skipped.contains(&scope)))
            .cloned()
            .collect()
    }
}

enum FetchOutcome {
    Fetched(Inventory),
    Failed(Error),
    Cancelled,
}

/// Changes produced by classifying one correlation
#[derive(Debug, Default)]
struct Classification {
    candidates: BTreeMap<CorrelationKey, OrphanCandidate>,
    new_candidates: usize,
    new_confirmed: Vec<OrphanCandidate>,
    resolved: Vec<OrphanCandidate>,
    evicted: usize,
    within_retention: usize,
}

// =============================================================================
// Reconciliation Engine
// =============================================================================

/// Correlates both inventories and maintains orphan candidates
pub struct ReconciliationEngine {
    config: EngineConfig,
    policy: HysteresisPolicy,
    snapshot_retention: chrono::Duration,
    cluster: InventorySourceRef,
    backend: InventorySourceRef,
    correlator: IdentityCorrelator,
    store: Arc<FindingsStore>,
    sinks: RwLock<Vec<ReportingSinkRef>>,
    phase: RwLock<CyclePhase>,
    cycles: AtomicU64,
}

impl ReconciliationEngine {
    /// Create a new engine; fails on invalid configuration or swapped sources
    pub fn new(
        config: EngineConfig,
        cluster: InventorySourceRef,
        backend: InventorySourceRef,
        store: Arc<FindingsStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let policy = config.policy()?;
        let snapshot_retention = config.snapshot_retention()?;

        if cluster.side() != InventorySide::Cluster || backend.side() != InventorySide::Backend {
            return Err(Error::Configuration(format!(
                "inventory sources are wired to the wrong sides: {} ({}), {} ({})",
                cluster.source_name(),
                cluster.side(),
                backend.source_name(),
                backend.side()
            )));
        }

        Ok(Arc::new(Self {
            config,
            policy,
            snapshot_retention,
            cluster,
            backend,
            correlator: IdentityCorrelator::new(),
            store,
            sinks: RwLock::new(Vec::new()),
            phase: RwLock::new(CyclePhase::Idle),
            cycles: AtomicU64::new(0),
        }))
    }

    /// Register a reporting sink
    pub fn add_sink(&self, sink: ReportingSinkRef) {
        self.sinks.write().push(sink);
    }

    pub fn store(&self) -> &Arc<FindingsStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current phase of the cycle state machine
    pub fn phase(&self) -> CyclePhase {
        *self.phase.read()
    }

    /// Number of cycles started, including degraded and cancelled ones
    pub fn cycles_started(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Reachability of both sources, keyed by source name
    pub async fn sources_health(&self) -> BTreeMap<String, bool> {
        let (cluster, backend) =
            tokio::join!(self.cluster.health_check(), self.backend.health_check());

        let mut health = BTreeMap::new();
        health.insert(self.cluster.source_name().to_string(), cluster.unwrap_or(false));
        health.insert(self.backend.source_name().to_string(), backend.unwrap_or(false));
        health
    }

    /// Run one scan cycle stamped with the current time
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now(), cancel).await
    }

    /// Run one scan cycle stamped with `now`.
    ///
    /// Returns `Err(Error::Cancelled)` if cancelled before commit; nothing
    /// is committed in that case. Degraded and commit-failed cycles return
    /// `Ok` with the outcome recorded in the report.
    pub async fn run_cycle_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport> {
        let cycle_id = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let clock = tokio::time::Instant::now();

        // The batch built by this cycle must follow this generation
        let base = self.store.snapshot();

        info!(cycle_id, base_generation = base.generation, "Starting scan cycle");
        self.set_phase(CyclePhase::FetchingBoth);

        let (cluster, backend) = tokio::join!(
            self.fetch(&self.cluster, cancel),
            self.fetch(&self.backend, cancel)
        );

        let (cluster, backend) = match (cluster, backend) {
            (FetchOutcome::Cancelled, _) | (_, FetchOutcome::Cancelled) => {
                self.set_phase(CyclePhase::Idle);
                info!(cycle_id, "Scan cycle cancelled during fetch");
                return Err(Error::Cancelled);
            }
            (FetchOutcome::Fetched(c), FetchOutcome::Fetched(b)) => (c, b),
            (cluster, backend) => {
                let report = self.degraded_report(cycle_id, now, clock, cluster, backend);
                self.publish(&report);
                self.set_phase(CyclePhase::Idle);
                return Ok(report);
            }
        };

        let sources = vec![
            source_status(self.cluster.side(), self.cluster.source_name(), Ok(&cluster)),
            source_status(self.backend.side(), self.backend.source_name(), Ok(&backend)),
        ];

        // A scope either side could not list cannot be compared this cycle
        let skipped: BTreeSet<KeyScope> = cluster
            .unlisted
            .iter()
            .chain(&backend.unlisted)
            .filter_map(|kind| kind.scope())
            .collect();
        if !skipped.is_empty() {
            info!(cycle_id, scopes = ?skipped, "Leaving unlisted scopes out of classification");
        }

        self.set_phase(CyclePhase::Correlating);
        let correlation = self
            .correlator
            .correlate(&cluster.observed(&skipped), &backend.observed(&skipped));
        let anomalies = collect_anomalies(&correlation);

        self.set_phase(CyclePhase::Classifying);
        let generation = base.generation + 1;
        let classification = self.classify(&base, &correlation, &skipped, generation, now);

        if cancel.is_cancelled() {
            self.set_phase(CyclePhase::Idle);
            info!(cycle_id, "Scan cycle cancelled before commit");
            return Err(Error::Cancelled);
        }

        self.set_phase(CyclePhase::Committing);
        let usage = UsageSummary::compute(
            generation,
            now,
            &cluster.records,
            &backend.records,
            classification.candidates.values(),
        );
        let drift = base
            .usage
            .as_ref()
            .map(|previous| UsageDrift::between(previous, &usage));

        let active_candidates = classification
            .candidates
            .values()
            .filter(|c| c.is_active())
            .count();
        let confirmed_orphans = classification
            .candidates
            .values()
            .filter(|c| c.state == CandidateState::Confirmed)
            .count();
        let candidate_counts = CandidateCount::tally(classification.candidates.values());

        let mut report = CycleReport {
            cycle_id,
            generation,
            outcome: CycleOutcome::Committed,
            started_at: now,
            finished_at: now,
            sources,
            new_confirmed: Vec::new(),
            resolved: Vec::new(),
            new_candidates: classification.new_candidates,
            evicted: classification.evicted,
            healthy_pairs: correlation.healthy_count(),
            active_candidates,
            confirmed_orphans,
            candidate_counts,
            within_retention: classification.within_retention,
            skipped_scopes: skipped.iter().copied().collect(),
            uncorrelated: correlation.uncorrelated.clone(),
            anomalies,
            usage: Some(usage.clone()),
            drift,
            reason: None,
        };

        let batch = FindingsBatch {
            generation,
            committed_at: now,
            candidates: classification.candidates,
            usage: Some(usage),
        };

        match self.store.commit(batch) {
            Ok(_) => {
                report.new_confirmed = classification.new_confirmed;
                report.resolved = classification.resolved;
                info!(
                    cycle_id,
                    generation,
                    healthy = report.healthy_pairs,
                    active = report.active_candidates,
                    confirmed = report.confirmed_orphans,
                    new_confirmed = report.new_confirmed.len(),
                    resolved = report.resolved.len(),
                    "Scan cycle committed"
                );
            }
            Err(e) => {
                error!(cycle_id, generation, error = %e, "Failed to commit scan cycle");
                report.outcome = CycleOutcome::CommitFailed;
                report.generation = self.store.generation();
                report.new_candidates = 0;
                report.evicted = 0;
                report.active_candidates = base.active_count();
                report.confirmed_orphans = base.count_in_state(CandidateState::Confirmed);
                report.candidate_counts = CandidateCount::tally(base.candidates.values());
                report.usage = None;
                report.drift = None;
                report.reason = Some(e.to_string());
            }
        }

        report.finished_at = finished_at(now, clock);
        self.publish(&report);
        self.set_phase(CyclePhase::Idle);

        Ok(report)
    }

    /// List every kind of one side, bounded by the fetch timeout and
    /// abandoned on cancellation
    async fn fetch(&self, source: &InventorySourceRef, cancel: &CancellationToken) -> FetchOutcome {
        let side = source.side();
        let timeout = self.config.fetch_timeout;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => FetchOutcome::Cancelled,
            result = tokio::time::timeout(timeout, list_all(source)) => match result {
                Ok(Ok(inventory)) => {
                    debug!(
                        %side,
                        source = source.source_name(),
                        records = inventory.records.len(),
                        unlisted = inventory.unlisted.len(),
                        "Fetched inventory"
                    );
                    FetchOutcome::Fetched(inventory)
                }
                Ok(Err(e @ Error::SourceUnavailable { .. })) | Ok(Err(e @ Error::SourceTimeout { .. })) => {
                    FetchOutcome::Failed(e)
                }
                Ok(Err(e)) => FetchOutcome::Failed(Error::SourceUnavailable {
                    side,
                    cause: e.to_string(),
                }),
                Err(_) => FetchOutcome::Failed(Error::SourceTimeout {
                    side,
                    timeout_secs: timeout.as_secs(),
                }),
            },
        }
    }

    /// Advance every candidate against one correlation
    fn classify(
        &self,
        base: &FindingsSnapshot,
        correlation: &Correlation,
        skipped: &BTreeSet<KeyScope>,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Classification {
        let mut out = Classification {
            candidates: base.candidates.clone(),
            ..Default::default()
        };

        let before = out.candidates.len();
        out.candidates.retain(|_, c| !c.is_expired(generation));
        out.evicted = before - out.candidates.len();

        for pair in correlation.pairs.values() {
            let key = pair.key();

            let Some(side) = OrphanSide::from_status(pair.status()) else {
                if let Some(existing) = out.candidates.get_mut(key) {
                    if existing.resolve(Resolution::Matched, generation, now) == Transition::Resolved {
                        info!(key = %key, side = %existing.side, "Orphan candidate resolved: both sides present");
                        out.resolved.push(existing.clone());
                    }
                }
                continue;
            };

            let Some(record) = pair.unmatched() else {
                continue;
            };

            if side == OrphanSide::BackendOnly && self.within_retention(record, now) {
                debug!(key = %key, native_id = %record.native_id, "Backend snapshot inside retention");
                out.within_retention += 1;
                continue;
            }

            let continuing = out
                .candidates
                .get_mut(key)
                .filter(|c| c.is_active() && c.side == side);

            if let Some(existing) = continuing {
                if existing.observe(record, generation, now, &self.policy) == Transition::Confirmed {
                    info!(
                        key = %key,
                        side = %side,
                        native_id = %existing.native_id,
                        observations = existing.consecutive_observations,
                        "Orphan confirmed"
                    );
                    out.new_confirmed.push(existing.clone());
                }
                continue;
            }

            if let Some(previous) = out.candidates.get(key) {
                debug!(key = %key, from = %previous.side, to = %side, state = %previous.state, "Restarting candidate");
            }

            let mut candidate = OrphanCandidate::new(key.clone(), side, record, generation, now);
            if candidate.evaluate(now, &self.policy) == Transition::Confirmed {
                out.new_confirmed.push(candidate.clone());
            }
            debug!(key = %key, side = %side, native_id = %record.native_id, "New orphan candidate");
            out.candidates.insert(key.clone(), candidate);
            out.new_candidates += 1;
        }

        for key in &correlation.settled {
            if let Some(existing) = out.candidates.get_mut(key) {
                if existing.resolve(Resolution::Matched, generation, now) == Transition::Resolved {
                    info!(key = %key, "Orphan candidate resolved: claim bound");
                    out.resolved.push(existing.clone());
                }
            }
        }

        // Keys gone from both inventories were reclaimed
        let excluded = correlation.excluded_keys();
        for (key, candidate) in out.candidates.iter_mut() {
            if candidate.is_active()
                && !correlation.pairs.contains_key(key)
                && !excluded.contains(key)
                && !skipped.contains(&key.scope)
                && candidate.resolve(Resolution::Vanished, generation, now) == Transition::Resolved
            {
                info!(key = %key, side = %candidate.side, "Orphan candidate resolved: resource gone");
                out.resolved.push(candidate.clone());
            }
        }

        out
    }

    /// Backend snapshots younger than the retention window are expected
    /// to be unmatched while a snapshot is being taken or pruned
    fn within_retention(&self, record: &ResourceRecord, now: DateTime<Utc>) -> bool {
        record.kind == ResourceKind::BackendSnapshot
            && record
                .created_at
                .map_or(false, |created| now - created < self.snapshot_retention)
    }

    fn degraded_report(
        &self,
        cycle_id: u64,
        now: DateTime<Utc>,
        clock: tokio::time::Instant,
        cluster: FetchOutcome,
        backend: FetchOutcome,
    ) -> CycleReport {
        self.set_phase(CyclePhase::Degraded);

        let cancelled = Error::Cancelled;
        let mut reasons = Vec::new();
        let mut sources = Vec::new();
        for (source, outcome) in [(&self.cluster, cluster), (&self.backend, backend)] {
            let status = match &outcome {
                FetchOutcome::Fetched(inventory) => Ok(inventory),
                FetchOutcome::Failed(e) => {
                    reasons.push(e.to_string());
                    Err(e)
                }
                FetchOutcome::Cancelled => Err(&cancelled),
            };
            sources.push(source_status(source.side(), source.source_name(), status));
        }
        let reason = reasons.join("; ");

        warn!(cycle_id, reason = %reason, "Scan cycle degraded; findings left unchanged");

        let snapshot = self.store.snapshot();
        CycleReport {
            cycle_id,
            generation: snapshot.generation,
            outcome: CycleOutcome::Degraded,
            started_at: now,
            finished_at: finished_at(now, clock),
            sources,
            new_confirmed: Vec::new(),
            resolved: Vec::new(),
            new_candidates: 0,
            evicted: 0,
            healthy_pairs: 0,
            active_candidates: snapshot.active_count(),
            confirmed_orphans: snapshot.count_in_state(CandidateState::Confirmed),
            candidate_counts: CandidateCount::tally(snapshot.candidates.values()),
            within_retention: 0,
            skipped_scopes: Vec::new(),
            uncorrelated: BTreeMap::new(),
            anomalies: Vec::new(),
            usage: None,
            drift: None,
            reason: Some(reason),
        }
    }

    /// Forward a dropped scheduler tick to every sink
    pub fn report_overrun(&self, overrun: &ScanOverrun) {
        for sink in self.sinks.read().iter() {
            sink.on_scan_overrun(overrun);
        }
    }

    fn publish(&self, report: &CycleReport) {
        for sink in self.sinks.read().iter() {
            sink.on_cycle_result(report);
        }
        self.store.record_report(report.clone());
    }

    fn set_phase(&self, phase: CyclePhase) {
        let mut current = self.phase.write();
        if *current != phase {
            debug!(from = %*current, to = %phase, "Scan cycle phase");
            *current = phase;
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// List every kind of one side. A kind the source cannot list is noted,
/// any other failure fails the whole side.
async fn list_all(source: &InventorySourceRef) -> Result<Inventory> {
    let kinds = ResourceKind::for_side(source.side());
    let lists = futures::future::try_join_all(kinds.iter().map(|&kind| async move {
        match source.list(kind).await {
            Ok(records) => Ok((kind, Some(records))),
            Err(Error::KindNotListed { reason, .. }) => {
                warn!(%kind, source = source.source_name(), reason = %reason, "Kind not listed");
                Ok((kind, None))
            }
            Err(e) => Err(e),
        }
    }))
    .await?;

    let mut inventory = Inventory::default();
    for (kind, records) in lists {
        match records {
            Some(records) => inventory.records.extend(records),
            None => inventory.unlisted.push(kind),
        }
    }
    Ok(inventory)
}

fn source_status(
    side: InventorySide,
    name: &str,
    result: std::result::Result<&Inventory, &Error>,
) -> SourceStatus {
    match result {
        Ok(inventory) => SourceStatus {
            side,
            source_name: name.to_string(),
            available: true,
            record_count: inventory.records.len(),
            unlisted_kinds: inventory.unlisted.clone(),
            error: None,
        },
        Err(e) => SourceStatus {
            side,
            source_name: name.to_string(),
            available: false,
            record_count: 0,
            unlisted_kinds: Vec::new(),
            error: Some(e.to_string()),
        },
    }
}

fn collect_anomalies(correlation: &Correlation) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    for collision in &correlation.collisions {
        warn!(error = %collision.to_error(), "Skipping colliding correlation key");
        anomalies.push(Anomaly::KeyCollision(collision.clone()));
    }
    for (kind, count) in &correlation.unmatchable {
        debug!(%kind, count, "Records without a correlation key");
        anomalies.push(Anomaly::Unmatchable {
            kind: *kind,
            count: *count,
        });
    }
    anomalies
}

fn finished_at(started: DateTime<Utc>, clock: tokio::time::Instant) -> DateTime<Utc> {
    chrono::Duration::from_std(clock.elapsed())
        .map(|elapsed| started + elapsed)
        .unwrap_or(started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{InventorySource, ATTR_BOUND_VOLUME};
    use crate::reconcile::test_support::{
        backend_snapshot, backend_volume, cluster_snapshot, cluster_volume, RecordingSink, GI,
    };
    use crate::sources::MemoryInventory;
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    struct Harness {
        engine: Arc<ReconciliationEngine>,
        cluster: Arc<MemoryInventory>,
        backend: Arc<MemoryInventory>,
        sink: Arc<RecordingSink>,
        cancel: CancellationToken,
    }

    fn harness(min_observations: u32, min_age: Duration) -> Harness {
        harness_with(EngineConfig {
            min_consecutive_observations: min_observations,
            min_orphan_age: min_age,
            fetch_timeout: Duration::from_secs(5),
            snapshot_retention: Duration::ZERO,
        })
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let cluster = MemoryInventory::new(InventorySide::Cluster, "cluster");
        let backend = MemoryInventory::new(InventorySide::Backend, "backend");
        let engine = ReconciliationEngine::new(
            config,
            cluster.clone(),
            backend.clone(),
            FindingsStore::new(),
        )
        .unwrap();
        let sink = Arc::new(RecordingSink::default());
        engine.add_sink(sink.clone());

        Harness {
            engine,
            cluster,
            backend,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    fn key(v: &str) -> CorrelationKey {
        CorrelationKey::normalize(KeyScope::Volume, v).unwrap()
    }

    fn scenario_inventories(h: &Harness) {
        h.cluster
            .set_records(vec![cluster_volume("A", "k1"), cluster_volume("B", "k2")]);
        h.backend
            .set_records(vec![backend_volume("tank/k1", "k1"), backend_volume("tank/k3", "k3")]);
    }

    #[tokio::test]
    async fn test_concrete_scenario() {
        let h = harness(2, Duration::from_secs(3600));
        scenario_inventories(&h);
        let t0 = Utc::now();

        let report = h.engine.run_cycle_at(t0, &h.cancel).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Committed);
        assert_eq!(report.generation, 1);
        assert_eq!(report.new_candidates, 2);
        assert_eq!(report.healthy_pairs, 1);

        let snap = h.engine.store().snapshot();
        assert!(snap.get(&key("k1")).is_none());
        let k2 = snap.get(&key("k2")).unwrap();
        assert_eq!(k2.side, OrphanSide::ClusterOnly);
        assert_eq!(k2.state, CandidateState::Candidate);
        let k3 = snap.get(&key("k3")).unwrap();
        assert_eq!(k3.side, OrphanSide::BackendOnly);
        assert_eq!(k3.consecutive_observations, 1);

        let report = h
            .engine
            .run_cycle_at(t0 + chrono::Duration::hours(2), &h.cancel)
            .await
            .unwrap();
        assert_eq!(report.generation, 2);
        assert_eq!(report.new_confirmed.len(), 2);

        let snap = h.engine.store().snapshot();
        for k in ["k2", "k3"] {
            let c = snap.get(&key(k)).unwrap();
            assert_eq!(c.consecutive_observations, 2);
            assert_eq!(c.state, CandidateState::Confirmed);
            assert_eq!(c.first_observed_at, t0);
        }
        assert_eq!(h.engine.phase(), CyclePhase::Idle);
    }

    #[tokio::test]
    async fn test_hysteresis_needs_min_observations() {
        let h = harness(3, Duration::ZERO);
        scenario_inventories(&h);
        let t0 = Utc::now();

        for i in 0..2 {
            h.engine
                .run_cycle_at(t0 + chrono::Duration::hours(i), &h.cancel)
                .await
                .unwrap();
        }
        let snap = h.engine.store().snapshot();
        assert_eq!(snap.get(&key("k2")).unwrap().state, CandidateState::Candidate);
        assert_eq!(snap.confirmed().count(), 0);

        h.engine
            .run_cycle_at(t0 + chrono::Duration::hours(2), &h.cancel)
            .await
            .unwrap();
        assert_eq!(h.engine.store().snapshot().confirmed().count(), 2);
    }

    #[tokio::test]
    async fn test_hysteresis_needs_min_age() {
        let h = harness(2, Duration::from_secs(3600));
        scenario_inventories(&h);
        let t0 = Utc::now();

        // Many fast cycles do not add up to sustained absence
        for i in 0..5 {
            h.engine
                .run_cycle_at(t0 + chrono::Duration::seconds(i * 10), &h.cancel)
                .await
                .unwrap();
        }
        let snap = h.engine.store().snapshot();
        let k2 = snap.get(&key("k2")).unwrap();
        assert_eq!(k2.consecutive_observations, 5);
        assert_eq!(k2.state, CandidateState::Candidate);
    }

    #[tokio::test]
    async fn test_single_observation_policy_confirms_immediately() {
        let h = harness(1, Duration::ZERO);
        scenario_inventories(&h);

        let report = h.engine.run_cycle(&h.cancel).await.unwrap();
        assert_eq!(report.new_candidates, 2);
        assert_eq!(report.new_confirmed.len(), 2);
        assert_eq!(report.confirmed_orphans, 2);
    }

    #[tokio::test]
    async fn test_degraded_cycle_changes_nothing() {
        let h = harness(3, Duration::ZERO);
        scenario_inventories(&h);
        let t0 = Utc::now();

        h.engine.run_cycle_at(t0, &h.cancel).await.unwrap();
        let before = h.engine.store().snapshot();

        // Backend now reports nothing: a naive engine would see every
        // cluster volume as orphaned
        h.backend.fail_with("503 Service Unavailable");
        h.cluster.push(cluster_volume("C", "k4"));
        let report = h
            .engine
            .run_cycle_at(t0 + chrono::Duration::hours(1), &h.cancel)
            .await
            .unwrap();

        assert_eq!(report.outcome, CycleOutcome::Degraded);
        assert!(report.is_degraded());
        assert_eq!(report.generation, 1);
        assert!(report.reason.as_deref().unwrap().contains("503"));
        assert!(report.new_confirmed.is_empty());
        assert!(report.sources.iter().any(|s| !s.available));

        let after = h.engine.store().snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(h.engine.phase(), CyclePhase::Idle);

        // Recovery resumes counting where it left off
        h.backend.recover();
        h.engine
            .run_cycle_at(t0 + chrono::Duration::hours(2), &h.cancel)
            .await
            .unwrap();
        let snap = h.engine.store().snapshot();
        assert_eq!(snap.generation, 2);
        assert_eq!(snap.get(&key("k2")).unwrap().consecutive_observations, 2);
        assert_eq!(snap.get(&key("k4")).unwrap().consecutive_observations, 1);

        let reports = h.sink.reports();
        assert_eq!(reports.len(), 3);
        assert!(reports[1].is_degraded());
    }

    #[tokio::test]
    async fn test_resolution_when_both_sides_present() {
        let h = harness(2, Duration::ZERO);
        scenario_inventories(&h);
        let t0 = Utc::now();

        for i in 0..4 {
            h.engine
                .run_cycle_at(t0 + chrono::Duration::hours(i), &h.cancel)
                .await
                .unwrap();
        }
        assert!(h.engine.store().snapshot().get(&key("k2")).unwrap().is_confirmed());

        h.backend.push(backend_volume("tank/k2", "K2"));
        let report = h
            .engine
            .run_cycle_at(t0 + chrono::Duration::hours(5), &h.cancel)
            .await
            .unwrap();

        assert_eq!(report.resolved.len(), 1);
        assert_eq!(report.resolved[0].key, key("k2"));
        let snap = h.engine.store().snapshot();
        let k2 = snap.get(&key("k2")).unwrap();
        assert_eq!(k2.state, CandidateState::Resolved);
        assert_eq!(k2.resolution, Some(Resolution::Matched));

        // Retained for one more scan, then evicted
        let report = h
            .engine
            .run_cycle_at(t0 + chrono::Duration::hours(6), &h.cancel)
            .await
            .unwrap();
        assert_eq!(report.evicted, 1);
        assert!(h.engine.store().snapshot().get(&key("k2")).is_none());
    }

    #[tokio::test]
    async fn test_vanished_key_is_resolved() {
        let h = harness(2, Duration::ZERO);
        scenario_inventories(&h);
        h.engine.run_cycle(&h.cancel).await.unwrap();

        h.backend.set_records(vec![backend_volume("tank/k1", "k1")]);
        let report = h.engine.run_cycle(&h.cancel).await.unwrap();

        assert_eq!(report.resolved.len(), 1);
        let snap = h.engine.store().snapshot();
        assert_eq!(
            snap.get(&key("k3")).unwrap().resolution,
            Some(Resolution::Vanished)
        );
        assert!(snap.get(&key("k2")).unwrap().is_active());
    }

    #[tokio::test]
    async fn test_reappearing_discrepancy_starts_fresh() {
        let h = harness(2, Duration::ZERO);
        scenario_inventories(&h);
        h.engine.run_cycle(&h.cancel).await.unwrap();

        h.backend.push(backend_volume("tank/k2", "k2"));
        h.engine.run_cycle(&h.cancel).await.unwrap();

        h.backend
            .set_records(vec![backend_volume("tank/k1", "k1"), backend_volume("tank/k3", "k3")]);
        let report = h.engine.run_cycle(&h.cancel).await.unwrap();
        assert_eq!(report.new_candidates, 1);

        let c = h.engine.store().snapshot().get(&key("k2")).cloned().unwrap();
        assert_eq!(c.state, CandidateState::Candidate);
        assert_eq!(c.consecutive_observations, 1);
    }

    #[tokio::test]
    async fn test_side_flip_restarts_candidate() {
        let h = harness(2, Duration::ZERO);
        scenario_inventories(&h);
        h.engine.run_cycle(&h.cancel).await.unwrap();
        h.engine.run_cycle(&h.cancel).await.unwrap();
        assert!(h.engine.store().snapshot().get(&key("k2")).unwrap().is_confirmed());

        h.cluster.set_records(vec![cluster_volume("A", "k1")]);
        h.backend.set_records(vec![
            backend_volume("tank/k1", "k1"),
            backend_volume("tank/k2", "k2"),
            backend_volume("tank/k3", "k3"),
        ]);
        h.engine.run_cycle(&h.cancel).await.unwrap();

        let c = h.engine.store().snapshot().get(&key("k2")).cloned().unwrap();
        assert_eq!(c.side, OrphanSide::BackendOnly);
        assert_eq!(c.state, CandidateState::Candidate);
        assert_eq!(c.consecutive_observations, 1);
    }

    #[tokio::test]
    async fn test_collision_leaves_candidate_untouched() {
        let h = harness(5, Duration::ZERO);
        scenario_inventories(&h);
        h.engine.run_cycle(&h.cancel).await.unwrap();

        h.cluster.push(cluster_volume("B-dup", "k2"));
        let report = h.engine.run_cycle(&h.cancel).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Committed);
        assert_eq!(report.collisions().count(), 1);
        let c = h.engine.store().snapshot().get(&key("k2")).cloned().unwrap();
        assert_eq!(c.consecutive_observations, 1);
        assert!(c.is_active());
        // Other keys still advance
        let k3 = h.engine.store().snapshot().get(&key("k3")).cloned().unwrap();
        assert_eq!(k3.consecutive_observations, 2);
    }

    #[tokio::test]
    async fn test_unmatchable_records_are_reported_not_orphaned() {
        let h = harness(1, Duration::ZERO);
        h.cluster.set_records(vec![
            ResourceRecord::new(ResourceKind::Volume, "pv-unprovisioned"),
            ResourceRecord::new(ResourceKind::VolumeClaim, "apps/data")
                .with_status("Bound")
                .with_attribute(ATTR_BOUND_VOLUME, "pv-unprovisioned"),
        ]);

        let report = h.engine.run_cycle(&h.cancel).await.unwrap();
        assert_eq!(report.unmatchable_total(), 1);
        assert_eq!(report.uncorrelated[&ResourceKind::VolumeClaim], 1);
        assert_eq!(report.new_candidates, 0);
        assert!(h.engine.store().snapshot().candidates.is_empty());
    }

    #[tokio::test]
    async fn test_unbound_claim_follows_hysteresis() {
        let h = harness(2, Duration::from_secs(3600));
        let pending = ResourceRecord::new(ResourceKind::VolumeClaim, "apps/data")
            .with_status("Pending")
            .with_size(10 * GI);
        h.cluster.set_records(vec![cluster_volume("A", "k1"), pending.clone()]);
        h.backend.set_records(vec![backend_volume("tank/k1", "k1")]);
        let claim = CorrelationKey::normalize(KeyScope::Claim, "apps/data").unwrap();
        let t0 = Utc::now();

        let report = h.engine.run_cycle_at(t0, &h.cancel).await.unwrap();
        assert_eq!(report.new_candidates, 1);
        let c = h.engine.store().snapshot().get(&claim).cloned().unwrap();
        assert_eq!(c.side, OrphanSide::ClusterOnly);
        assert_eq!(c.kind, ResourceKind::VolumeClaim);
        assert_eq!(c.state, CandidateState::Candidate);

        let report = h
            .engine
            .run_cycle_at(t0 + chrono::Duration::hours(2), &h.cancel)
            .await
            .unwrap();
        assert_eq!(report.new_confirmed.len(), 1);
        assert_eq!(report.new_confirmed[0].key, claim);

        // Binding settles the claim
        h.cluster.set_records(vec![
            cluster_volume("A", "k1"),
            pending
                .with_status("Bound")
                .with_attribute(ATTR_BOUND_VOLUME, "A"),
        ]);
        let report = h
            .engine
            .run_cycle_at(t0 + chrono::Duration::hours(3), &h.cancel)
            .await
            .unwrap();
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(report.uncorrelated[&ResourceKind::VolumeClaim], 1);
        let c = h.engine.store().snapshot().get(&claim).cloned().unwrap();
        assert_eq!(c.resolution, Some(Resolution::Matched));
    }

    #[tokio::test]
    async fn test_unlisted_snapshot_scope_is_left_alone() {
        let h = harness(1, Duration::ZERO);
        h.cluster.set_records(vec![
            cluster_volume("A", "k1"),
            cluster_snapshot("snapcontent-1", "k1@s1"),
        ]);
        h.backend.set_records(vec![
            backend_volume("tank/k1", "k1"),
            backend_snapshot("tank/k1@s1", "k1@s1"),
            backend_snapshot("tank/k1@s2", "k1@s2"),
        ]);
        let s2 = CorrelationKey::normalize(KeyScope::Snapshot, "k1@s2").unwrap();

        let report = h.engine.run_cycle(&h.cancel).await.unwrap();
        assert_eq!(report.confirmed_orphans, 1);
        assert!(report.skipped_scopes.is_empty());

        // Snapshot API disappears: backend snapshots must not all look orphaned
        h.cluster.mark_unlisted(ResourceKind::Snapshot);
        h.cluster.push(cluster_volume("B", "k2"));
        h.backend.set_records(vec![
            backend_volume("tank/k1", "k1"),
            backend_snapshot("tank/k1@s1", "k1@s1"),
            backend_snapshot("tank/k1@s3", "k1@s3"),
        ]);
        let report = h.engine.run_cycle(&h.cancel).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Committed);
        assert_eq!(report.skipped_scopes, vec![KeyScope::Snapshot]);
        assert_eq!(report.sources[0].unlisted_kinds, vec![ResourceKind::Snapshot]);
        assert!(report.sources[0].available);
        assert!(report.resolved.is_empty());
        // Volumes are still classified
        assert_eq!(report.new_candidates, 1);

        let snap = h.engine.store().snapshot();
        assert!(snap.get(&key("k2")).is_some());
        assert!(snap
            .get(&CorrelationKey::normalize(KeyScope::Snapshot, "k1@s3").unwrap())
            .is_none());
        // s2 left the backend but is neither resolved nor advanced
        let c = snap.get(&s2).unwrap();
        assert!(c.is_confirmed());
        assert_eq!(c.last_scan_generation, 1);
    }

    #[tokio::test]
    async fn test_young_backend_snapshot_is_not_a_candidate() {
        let h = harness_with(EngineConfig {
            min_consecutive_observations: 1,
            min_orphan_age: Duration::ZERO,
            fetch_timeout: Duration::from_secs(5),
            snapshot_retention: Duration::from_secs(30 * 24 * 3600),
        });
        let t0 = Utc::now();
        h.backend.set_records(vec![
            backend_snapshot(
                "tank/k8s/vols/pvc-aaa@auto-2026-10-01_00-00",
                "pvc-aaa@auto-2026-10-01_00-00",
            )
            .with_created_at(t0 - chrono::Duration::days(15)),
            backend_snapshot("tank/k8s/vols/pvc-bbb@snapshot-1", "pvc-bbb@snapshot-1")
                .with_created_at(t0 - chrono::Duration::days(40)),
        ]);

        let report = h.engine.run_cycle_at(t0, &h.cancel).await.unwrap();
        assert_eq!(report.within_retention, 1);
        assert_eq!(report.new_candidates, 1);
        let snap = h.engine.store().snapshot();
        assert_eq!(snap.candidates.len(), 1);
        assert!(snap
            .get(&CorrelationKey::normalize(KeyScope::Snapshot, "pvc-bbb@snapshot-1").unwrap())
            .is_some());

        // Past retention it is treated like any other backend snapshot
        let report = h
            .engine
            .run_cycle_at(t0 + chrono::Duration::days(16), &h.cancel)
            .await
            .unwrap();
        assert_eq!(report.within_retention, 0);
        assert_eq!(report.new_candidates, 1);
        assert_eq!(report.confirmed_orphans, 2);
    }

    #[tokio::test]
    async fn test_report_counts_candidates_by_side_kind_and_state() {
        let h = harness(2, Duration::ZERO);
        scenario_inventories(&h);
        h.engine.run_cycle(&h.cancel).await.unwrap();
        h.cluster.push(cluster_volume("C", "k4"));
        let report = h.engine.run_cycle(&h.cancel).await.unwrap();

        let count = |side: OrphanSide, state: CandidateState| {
            report
                .candidate_counts
                .iter()
                .find(|c| c.side == side && c.kind == ResourceKind::Volume && c.state == state)
                .map_or(0, |c| c.count)
        };
        assert_eq!(count(OrphanSide::ClusterOnly, CandidateState::Confirmed), 1);
        assert_eq!(count(OrphanSide::ClusterOnly, CandidateState::Candidate), 1);
        assert_eq!(
            report
                .candidate_counts
                .iter()
                .find(|c| c.side == OrphanSide::BackendOnly)
                .map(|c| (c.kind, c.state, c.count)),
            Some((ResourceKind::BackendVolume, CandidateState::Confirmed, 1))
        );
        assert_eq!(
            report.candidate_counts.iter().map(|c| c.count).sum::<usize>(),
            report.active_candidates
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_degrades_cycle() {
        let h = harness(1, Duration::ZERO);
        scenario_inventories(&h);
        h.backend.set_delay(Some(Duration::from_secs(30)));

        let report = h.engine.run_cycle(&h.cancel).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Degraded);
        assert!(report.reason.unwrap().contains("timed out"));
        assert_eq!(h.engine.store().generation(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_cycle() {
        let h = harness(1, Duration::ZERO);
        scenario_inventories(&h);
        h.cluster.set_delay(Some(Duration::from_secs(3)));

        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let result = h.engine.run_cycle(&h.cancel).await;
        assert_matches!(result, Err(Error::Cancelled));
        assert_eq!(h.engine.store().generation(), 0);
        assert!(h.sink.reports().is_empty());
        assert_eq!(h.engine.phase(), CyclePhase::Idle);
    }

    /// Commits behind the engine's back once, while the backend is listed
    struct StaleWriterSource {
        inner: Arc<MemoryInventory>,
        store: Arc<FindingsStore>,
        armed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl InventorySource for StaleWriterSource {
        fn side(&self) -> InventorySide {
            InventorySide::Backend
        }

        fn source_name(&self) -> &str {
            "stale-writer"
        }

        async fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceRecord>> {
            if kind == ResourceKind::BackendVolume && self.armed.swap(false, Ordering::SeqCst) {
                self.store.commit(FindingsBatch {
                    generation: self.store.generation() + 1,
                    committed_at: Utc::now(),
                    candidates: BTreeMap::new(),
                    usage: None,
                })?;
            }
            self.inner.list(kind).await
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_commit_failure_loses_only_that_cycle() {
        let store = FindingsStore::new();
        let cluster = MemoryInventory::new(InventorySide::Cluster, "cluster");
        cluster.set_records(vec![cluster_volume("A", "k1")]);

        let backend = Arc::new(StaleWriterSource {
            inner: MemoryInventory::new(InventorySide::Backend, "backend"),
            store: store.clone(),
            armed: std::sync::atomic::AtomicBool::new(true),
        });
        let config = EngineConfig {
            min_consecutive_observations: 1,
            min_orphan_age: Duration::ZERO,
            fetch_timeout: Duration::from_secs(5),
            snapshot_retention: Duration::ZERO,
        };
        let engine = ReconciliationEngine::new(config, cluster, backend, store.clone()).unwrap();
        let sink = Arc::new(RecordingSink::default());
        engine.add_sink(sink.clone());

        let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::CommitFailed);
        assert!(report.reason.as_deref().unwrap().contains("does not follow"));
        assert!(report.new_confirmed.is_empty());
        assert_eq!(report.generation, 1);
        assert!(store.snapshot().candidates.is_empty());
        assert_eq!(sink.reports().len(), 1);

        // The next cycle starts from the store's generation and succeeds
        let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Committed);
        assert_eq!(report.generation, 2);
        assert_eq!(report.new_confirmed.len(), 1);
        assert_eq!(store.snapshot().candidates.len(), 1);
        assert_eq!(engine.cycles_started(), 2);
    }

    #[tokio::test]
    async fn test_rejects_invalid_configuration() {
        let cluster = MemoryInventory::new(InventorySide::Cluster, "cluster");
        let backend = MemoryInventory::new(InventorySide::Backend, "backend");

        let config = EngineConfig {
            min_consecutive_observations: 0,
            ..Default::default()
        };
        let result =
            ReconciliationEngine::new(config, cluster.clone(), backend.clone(), FindingsStore::new());
        assert!(matches!(result, Err(Error::Configuration(_))));

        let result = ReconciliationEngine::new(
            EngineConfig::default(),
            backend,
            cluster,
            FindingsStore::new(),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_usage_and_drift_reported() {
        let h = harness(1, Duration::ZERO);
        scenario_inventories(&h);
        let t0 = Utc::now();

        let first = h.engine.run_cycle_at(t0, &h.cancel).await.unwrap();
        assert!(first.usage.is_some());
        assert!(first.drift.is_none());

        h.backend.push(backend_volume("tank/k9", "k9").with_size(1024));
        let second = h
            .engine
            .run_cycle_at(t0 + chrono::Duration::minutes(10), &h.cancel)
            .await
            .unwrap();
        let drift = second.drift.unwrap();
        assert_eq!(drift.from_generation, 1);
        assert_eq!(drift.backend_used_bytes_delta, 1024);
        assert_eq!(
            h.engine.store().snapshot().usage.as_ref().unwrap().generation,
            2
        );
    }

    #[tokio::test]
    async fn test_sources_health() {
        let h = harness(1, Duration::ZERO);
        h.backend.fail_with("down");
        let health = h.engine.sources_health().await;
        assert_eq!(health["cluster"], true);
        assert_eq!(health["backend"], false);
    }
}
