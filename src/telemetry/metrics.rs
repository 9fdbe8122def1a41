//! Prometheus Metrics
//!
//! Exports scan cycle outcomes and the latest findings as Prometheus
//! series. Registered into the process-wide registry by default so the
//! metrics server can gather them.

use crate::domain::ports::{InventorySide, ReportingSink};
use crate::error::{Error, Result};
use crate::reconcile::events::{Anomaly, CycleOutcome, CycleReport, ScanOverrun};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

const NAMESPACE: &str = "orphan_monitor";

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

/// Reporting sink backed by Prometheus collectors
pub struct PrometheusSink {
    cycles: IntCounterVec,
    overruns: IntCounter,
    cycle_duration: Histogram,
    generation: IntGauge,
    candidates: IntGaugeVec,
    new_confirmed: IntCounter,
    resolved: IntCounter,
    healthy_pairs: IntGauge,
    unmatchable: IntGaugeVec,
    collisions: IntGauge,
    source_up: IntGaugeVec,
    orphaned_bytes: IntGaugeVec,
    backend_used_bytes: IntGauge,
    requested_bytes: IntGauge,
}

impl PrometheusSink {
    /// Register all collectors into `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(NAMESPACE);

        let sink = Self {
            cycles: IntCounterVec::new(
                opts("scan_cycles_total", "Scan cycles by outcome"),
                &["outcome"],
            )
            .map_err(prom_err)?,
            overruns: IntCounter::with_opts(opts(
                "scan_overruns_total",
                "Scheduler ticks dropped because a cycle was still running",
            ))
            .map_err(prom_err)?,
            cycle_duration: Histogram::with_opts(
                HistogramOpts::new("scan_cycle_duration_seconds", "Duration of scan cycles")
                    .namespace(NAMESPACE)
                    .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
            )
            .map_err(prom_err)?,
            generation: IntGauge::with_opts(opts(
                "committed_generation",
                "Latest committed scan generation",
            ))
            .map_err(prom_err)?,
            candidates: IntGaugeVec::new(
                opts(
                    "orphan_candidates",
                    "Committed orphan candidates by side, kind and state",
                ),
                &["side", "kind", "state"],
            )
            .map_err(prom_err)?,
            new_confirmed: IntCounter::with_opts(opts(
                "orphans_confirmed_total",
                "Candidates promoted to confirmed orphans",
            ))
            .map_err(prom_err)?,
            resolved: IntCounter::with_opts(opts(
                "orphans_resolved_total",
                "Candidates resolved",
            ))
            .map_err(prom_err)?,
            healthy_pairs: IntGauge::with_opts(opts(
                "healthy_pairs",
                "Keys present on both sides in the last committed cycle",
            ))
            .map_err(prom_err)?,
            unmatchable: IntGaugeVec::new(
                opts("unmatchable_records", "Records without a usable correlation key"),
                &["kind"],
            )
            .map_err(prom_err)?,
            collisions: IntGauge::with_opts(opts(
                "key_collisions",
                "Correlation keys skipped because of duplicates",
            ))
            .map_err(prom_err)?,
            source_up: IntGaugeVec::new(
                opts("source_up", "Whether the last fetch from a side succeeded"),
                &["side"],
            )
            .map_err(prom_err)?,
            orphaned_bytes: IntGaugeVec::new(
                opts("orphaned_bytes", "Bytes held by confirmed orphans"),
                &["side"],
            )
            .map_err(prom_err)?,
            backend_used_bytes: IntGauge::with_opts(opts(
                "backend_used_bytes",
                "Bytes used by monitored backend volumes",
            ))
            .map_err(prom_err)?,
            requested_bytes: IntGauge::with_opts(opts(
                "requested_bytes",
                "Bytes requested by claims",
            ))
            .map_err(prom_err)?,
        };

        registry.register(Box::new(sink.cycles.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.overruns.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.cycle_duration.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.generation.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.candidates.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.new_confirmed.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.resolved.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.healthy_pairs.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.unmatchable.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.collisions.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.source_up.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.orphaned_bytes.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.backend_used_bytes.clone())).map_err(prom_err)?;
        registry.register(Box::new(sink.requested_bytes.clone())).map_err(prom_err)?;

        Ok(sink)
    }

    /// Register into the process-wide default registry
    pub fn register_default() -> Result<Self> {
        Self::new(prometheus::default_registry())
    }
}

impl ReportingSink for PrometheusSink {
    fn on_cycle_result(&self, report: &CycleReport) {
        self.cycles
            .with_label_values(&[&report.outcome.to_string()])
            .inc();
        if let Ok(duration) = report.duration().to_std() {
            self.cycle_duration.observe(duration.as_secs_f64());
        }

        for status in &report.sources {
            let side = match status.side {
                InventorySide::Cluster => "cluster",
                InventorySide::Backend => "backend",
            };
            self.source_up
                .with_label_values(&[side])
                .set(i64::from(status.available));
        }

        // Counts always describe the committed findings, whatever the outcome
        self.candidates.reset();
        for count in &report.candidate_counts {
            self.candidates
                .with_label_values(&[
                    &count.side.to_string(),
                    &count.kind.to_string(),
                    &count.state.to_string(),
                ])
                .set(count.count as i64);
        }

        if report.outcome != CycleOutcome::Committed {
            return;
        }

        self.generation.set(report.generation as i64);
        self.new_confirmed.inc_by(report.new_confirmed.len() as u64);
        self.resolved.inc_by(report.resolved.len() as u64);
        self.healthy_pairs.set(report.healthy_pairs as i64);

        self.unmatchable.reset();
        let mut collisions = 0;
        for anomaly in &report.anomalies {
            match anomaly {
                Anomaly::Unmatchable { kind, count } => self
                    .unmatchable
                    .with_label_values(&[&kind.to_string()])
                    .set(*count as i64),
                Anomaly::KeyCollision(_) => collisions += 1,
            }
        }
        self.collisions.set(collisions);

        if let Some(usage) = &report.usage {
            self.orphaned_bytes
                .with_label_values(&["cluster"])
                .set(usage.cluster_orphaned_bytes as i64);
            self.orphaned_bytes
                .with_label_values(&["backend"])
                .set(usage.backend_orphaned_bytes as i64);
            self.backend_used_bytes.set(usage.backend_used_bytes as i64);
            self.requested_bytes.set(usage.requested_bytes as i64);
        }
    }

    fn on_scan_overrun(&self, _overrun: &ScanOverrun) {
        self.overruns.inc();
    }
}
