//! Storage Usage Accounting
//!
//! Summarises capacity on both sides after each successful cycle and
//! computes drift against the previous successful cycle.

use crate::domain::ports::{ResourceKind, ResourceRecord};
use crate::reconcile::candidate::{OrphanCandidate, OrphanSide};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Claims above this size are flagged for review
pub const LARGE_CLAIM_BYTES: u64 = 100 * 1024 * 1024 * 1024;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Capacity snapshot for one committed generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub generation: u64,
    pub measured_at: DateTime<Utc>,
    pub volume_count: usize,
    pub claim_count: usize,
    pub snapshot_count: usize,
    pub backend_volume_count: usize,
    pub backend_snapshot_count: usize,
    /// Capacity of PersistentVolumes
    pub provisioned_bytes: u64,
    /// Capacity requested by claims
    pub requested_bytes: u64,
    pub backend_used_bytes: u64,
    pub backend_snapshot_bytes: u64,
    /// Bytes held by confirmed cluster-only orphans
    pub cluster_orphaned_bytes: u64,
    /// Bytes held by confirmed backend-only orphans
    pub backend_orphaned_bytes: u64,
    /// Share of requested capacity not yet consumed on the backend
    pub thin_provisioning_efficiency_percent: f64,
    pub recommendations: Vec<String>,
}

impl UsageSummary {
    /// Summarise the inventories of a committed generation
    pub fn compute<'a>(
        generation: u64,
        measured_at: DateTime<Utc>,
        cluster: &[ResourceRecord],
        backend: &[ResourceRecord],
        candidates: impl IntoIterator<Item = &'a OrphanCandidate>,
    ) -> Self {
        let mut summary = Self {
            generation,
            measured_at,
            volume_count: 0,
            claim_count: 0,
            snapshot_count: 0,
            backend_volume_count: 0,
            backend_snapshot_count: 0,
            provisioned_bytes: 0,
            requested_bytes: 0,
            backend_used_bytes: 0,
            backend_snapshot_bytes: 0,
            cluster_orphaned_bytes: 0,
            backend_orphaned_bytes: 0,
            thin_provisioning_efficiency_percent: 0.0,
            recommendations: Vec::new(),
        };

        let mut large_claims = Vec::new();
        for record in cluster.iter().chain(backend.iter()) {
            match record.kind {
                ResourceKind::Volume => {
                    summary.volume_count += 1;
                    summary.provisioned_bytes += record.size_bytes;
                }
                ResourceKind::VolumeClaim => {
                    summary.claim_count += 1;
                    summary.requested_bytes += record.size_bytes;
                    if record.size_bytes > LARGE_CLAIM_BYTES {
                        large_claims.push(record);
                    }
                }
                ResourceKind::Snapshot => summary.snapshot_count += 1,
                ResourceKind::BackendVolume => {
                    summary.backend_volume_count += 1;
                    summary.backend_used_bytes += record.size_bytes;
                }
                ResourceKind::BackendSnapshot => {
                    summary.backend_snapshot_count += 1;
                    summary.backend_snapshot_bytes += record.size_bytes;
                }
            }
        }

        // An unbound claim holds no storage
        let holds_storage = |c: &&OrphanCandidate| c.kind != ResourceKind::VolumeClaim;
        for candidate in candidates
            .into_iter()
            .filter(|c| c.is_confirmed())
            .filter(holds_storage)
        {
            match candidate.side {
                OrphanSide::ClusterOnly => summary.cluster_orphaned_bytes += candidate.size_bytes,
                OrphanSide::BackendOnly => summary.backend_orphaned_bytes += candidate.size_bytes,
            }
        }

        if summary.requested_bytes > 0 {
            let requested = summary.requested_bytes as f64;
            summary.thin_provisioning_efficiency_percent =
                (requested - summary.backend_used_bytes as f64) / requested * 100.0;
        }

        large_claims.sort_by(|a, b| a.native_id.cmp(&b.native_id));
        for claim in large_claims {
            summary.recommendations.push(format!(
                "Consider reviewing large claim: {} ({:.1}GiB)",
                claim.native_id,
                claim.size_bytes as f64 / GIB
            ));
        }
        if summary.backend_volume_count > summary.claim_count {
            summary.recommendations.push(format!(
                "Found {} potentially unused backend volumes",
                summary.backend_volume_count - summary.claim_count
            ));
        }
        if summary.backend_orphaned_bytes > 0 {
            summary.recommendations.push(format!(
                "{:.1}GiB held by confirmed backend orphans",
                summary.backend_orphaned_bytes as f64 / GIB
            ));
        }

        summary
    }

    /// Total bytes held by confirmed orphans on either side
    pub fn orphaned_bytes(&self) -> u64 {
        self.cluster_orphaned_bytes + self.backend_orphaned_bytes
    }
}

/// Change in usage between two committed generations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageDrift {
    pub from_generation: u64,
    pub to_generation: u64,
    pub elapsed_secs: i64,
    pub provisioned_bytes_delta: i64,
    pub requested_bytes_delta: i64,
    pub backend_used_bytes_delta: i64,
    pub backend_snapshot_bytes_delta: i64,
    pub orphaned_bytes_delta: i64,
    /// Backend growth rate extrapolated to one hour
    pub backend_used_bytes_per_hour: f64,
}

impl UsageDrift {
    pub fn between(previous: &UsageSummary, current: &UsageSummary) -> Self {
        let elapsed_secs = (current.measured_at - previous.measured_at).num_seconds();
        let backend_used_bytes_delta = delta(previous.backend_used_bytes, current.backend_used_bytes);

        let backend_used_bytes_per_hour = if elapsed_secs > 0 {
            backend_used_bytes_delta as f64 * 3600.0 / elapsed_secs as f64
        } else {
            0.0
        };

        Self {
            from_generation: previous.generation,
            to_generation: current.generation,
            elapsed_secs,
            provisioned_bytes_delta: delta(previous.provisioned_bytes, current.provisioned_bytes),
            requested_bytes_delta: delta(previous.requested_bytes, current.requested_bytes),
            backend_used_bytes_delta,
            backend_snapshot_bytes_delta: delta(
                previous.backend_snapshot_bytes,
                current.backend_snapshot_bytes,
            ),
            orphaned_bytes_delta: delta(previous.orphaned_bytes(), current.orphaned_bytes()),
            backend_used_bytes_per_hour,
        }
    }

    pub fn is_growing(&self) -> bool {
        self.backend_used_bytes_delta > 0
    }
}

fn delta(previous: u64, current: u64) -> i64 {
    current as i64 - previous as i64
}
