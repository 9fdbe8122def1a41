//! Telemetry Module
//!
//! Built-in reporting sinks:
//! - `TracingSink`: structured log lines per cycle and per confirmed orphan
//! - `PrometheusSink`: counters and gauges for the metrics server

pub mod metrics;

pub use metrics::PrometheusSink;

use crate::domain::ports::ReportingSink;
use crate::reconcile::events::{CycleOutcome, CycleReport, ScanOverrun};
use tracing::{error, info, warn};

/// Logs every cycle result through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ReportingSink for TracingSink {
    fn on_cycle_result(&self, report: &CycleReport) {
        match report.outcome {
            CycleOutcome::Committed => info!(
                cycle_id = report.cycle_id,
                generation = report.generation,
                duration_ms = report.duration().num_milliseconds(),
                healthy = report.healthy_pairs,
                new_candidates = report.new_candidates,
                active = report.active_candidates,
                confirmed = report.confirmed_orphans,
                evicted = report.evicted,
                unmatchable = report.unmatchable_total(),
                "Scan cycle result"
            ),
            CycleOutcome::Degraded => warn!(
                cycle_id = report.cycle_id,
                generation = report.generation,
                reason = report.reason.as_deref().unwrap_or_default(),
                "Scan cycle degraded"
            ),
            CycleOutcome::CommitFailed => error!(
                cycle_id = report.cycle_id,
                reason = report.reason.as_deref().unwrap_or_default(),
                "Scan cycle findings lost"
            ),
        }

        for orphan in &report.new_confirmed {
            warn!(
                key = %orphan.key,
                side = %orphan.side,
                kind = %orphan.kind,
                native_id = %orphan.native_id,
                size_bytes = orphan.size_bytes,
                first_observed_at = %orphan.first_observed_at,
                observations = orphan.consecutive_observations,
                "Confirmed orphan"
            );
        }
        for orphan in &report.resolved {
            info!(
                key = %orphan.key,
                side = %orphan.side,
                resolution = ?orphan.resolution,
                "Orphan resolved"
            );
        }
        for collision in report.collisions() {
            warn!(
                key = %collision.key,
                side = %collision.side,
                native_ids = ?collision.native_ids,
                "Correlation key collision"
            );
        }
        if let Some(drift) = report.drift.as_ref().filter(|d| d.is_growing()) {
            info!(
                bytes_per_hour = drift.backend_used_bytes_per_hour,
                delta = drift.backend_used_bytes_delta,
                "Backend usage growing"
            );
        }
    }

    fn on_scan_overrun(&self, overrun: &ScanOverrun) {
        warn!(
            in_flight_cycle = overrun.in_flight_cycle,
            total_overruns = overrun.total_overruns,
            "Scan tick dropped"
        );
    }
}
