//! Identity Correlator
//!
//! Matches cluster-side and backend-side records by their normalized
//! correlation key. Pure: the same inventories always produce the same
//! pairs, regardless of input order.

use crate::domain::ports::{InventorySide, KeyScope, ResourceKind, ResourceRecord};
use crate::error::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// =============================================================================
// Correlation Key
// =============================================================================

/// Normalized cross-system identity, scoped by resource family
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationKey {
    pub scope: KeyScope,
    pub value: String,
}

impl CorrelationKey {
    /// Normalize a raw key: trimmed, case-folded, never empty
    pub fn normalize(scope: KeyScope, raw: &str) -> Option<Self> {
        let value = raw.trim().to_lowercase();
        if value.is_empty() {
            return None;
        }
        Some(Self { scope, value })
    }

    /// Key for a record, if the record takes part in correlation and
    /// carries a usable key
    pub fn for_record(record: &ResourceRecord) -> Option<Self> {
        let scope = record.kind.scope()?;
        let raw = match record.kind {
            // Claims are identified by namespace/name alone
            ResourceKind::VolumeClaim => record.native_id.as_str(),
            _ => record.correlation_key.as_deref()?,
        };
        Self::normalize(scope, raw)
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.value)
    }
}

impl std::str::FromStr for CorrelationKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scope, value) = s
            .split_once(':')
            .ok_or_else(|| Error::Internal(format!("malformed correlation key: {}", s)))?;
        let scope = match scope {
            "volume" => KeyScope::Volume,
            "snapshot" => KeyScope::Snapshot,
            "claim" => KeyScope::Claim,
            other => return Err(Error::Internal(format!("unknown key scope: {}", other))),
        };
        Self::normalize(scope, value)
            .ok_or_else(|| Error::Internal(format!("empty correlation key: {}", s)))
    }
}

impl Serialize for CorrelationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CorrelationKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Correlation Pair
// =============================================================================

/// Match status of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PairStatus {
    Healthy,
    ClusterOnly,
    BackendOnly,
}

/// One key with at most one record per side; never empty on both sides
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationPair {
    key: CorrelationKey,
    cluster: Option<ResourceRecord>,
    backend: Option<ResourceRecord>,
}

impl CorrelationPair {
    /// Pair the records found under `key`; `None` when both sides are empty
    pub fn new(
        key: CorrelationKey,
        cluster: Option<ResourceRecord>,
        backend: Option<ResourceRecord>,
    ) -> Option<Self> {
        if cluster.is_none() && backend.is_none() {
            return None;
        }
        Some(Self {
            key,
            cluster,
            backend,
        })
    }

    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    pub fn cluster(&self) -> Option<&ResourceRecord> {
        self.cluster.as_ref()
    }

    pub fn backend(&self) -> Option<&ResourceRecord> {
        self.backend.as_ref()
    }

    pub fn status(&self) -> PairStatus {
        match (&self.cluster, &self.backend) {
            (Some(_), Some(_)) => PairStatus::Healthy,
            (Some(_), None) => PairStatus::ClusterOnly,
            _ => PairStatus::BackendOnly,
        }
    }

    /// The record present on one side only, if this is a discrepancy
    pub fn unmatched(&self) -> Option<&ResourceRecord> {
        match self.status() {
            PairStatus::Healthy => None,
            PairStatus::ClusterOnly => self.cluster.as_ref(),
            PairStatus::BackendOnly => self.backend.as_ref(),
        }
    }
}

// =============================================================================
// Correlation Result
// =============================================================================

/// Two or more records on one side sharing a key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyCollision {
    pub key: CorrelationKey,
    pub side: InventorySide,
    pub native_ids: Vec<String>,
}

impl KeyCollision {
    pub fn to_error(&self) -> Error {
        Error::CorrelationKeyCollision {
            key: self.key.to_string(),
            side: self.side,
            native_ids: self.native_ids.clone(),
        }
    }
}

/// Output of one correlation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correlation {
    /// Pairs by key; colliding keys are absent
    pub pairs: BTreeMap<CorrelationKey, CorrelationPair>,
    /// Records that should carry a key but do not
    pub unmatchable: BTreeMap<ResourceKind, usize>,
    /// Records that are healthy without a counterpart (bound claims)
    pub uncorrelated: BTreeMap<ResourceKind, usize>,
    /// Keys of bound claims; a claim candidate under one of these is settled
    pub settled: BTreeSet<CorrelationKey>,
    pub collisions: Vec<KeyCollision>,
}

impl Correlation {
    /// Keys withheld from classification this scan
    pub fn excluded_keys(&self) -> BTreeSet<CorrelationKey> {
        self.collisions.iter().map(|c| c.key.clone()).collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.pairs
            .values()
            .filter(|p| p.status() == PairStatus::Healthy)
            .count()
    }

    /// Pairs with exactly one side present
    pub fn discrepancies(&self) -> impl Iterator<Item = &CorrelationPair> {
        self.pairs
            .values()
            .filter(|p| p.status() != PairStatus::Healthy)
    }

    pub fn unmatchable_total(&self) -> usize {
        self.unmatchable.values().sum()
    }
}

// =============================================================================
// Identity Correlator
// =============================================================================

/// Stateless matcher of two inventories
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCorrelator;

impl IdentityCorrelator {
    pub fn new() -> Self {
        Self
    }

    /// Correlate a cluster inventory with a backend inventory
    pub fn correlate(&self, cluster: &[ResourceRecord], backend: &[ResourceRecord]) -> Correlation {
        let mut result = Correlation::default();

        let cluster_keyed = index_side(InventorySide::Cluster, cluster, &mut result);
        let backend_keyed = index_side(InventorySide::Backend, backend, &mut result);

        let mut excluded = BTreeSet::new();
        for (side, keyed) in [
            (InventorySide::Cluster, &cluster_keyed),
            (InventorySide::Backend, &backend_keyed),
        ] {
            for (key, records) in keyed.iter().filter(|(_, r)| r.len() > 1) {
                let mut native_ids: Vec<String> =
                    records.iter().map(|r| r.native_id.clone()).collect();
                native_ids.sort();
                result.collisions.push(KeyCollision {
                    key: key.clone(),
                    side,
                    native_ids,
                });
                excluded.insert(key.clone());
            }
        }
        result.collisions.sort_by(|a, b| (&a.key, a.side).cmp(&(&b.key, b.side)));

        let mut cluster_keyed = cluster_keyed;
        let mut backend_keyed = backend_keyed;
        let keys: BTreeSet<CorrelationKey> = cluster_keyed
            .keys()
            .chain(backend_keyed.keys())
            .filter(|k| !excluded.contains(*k))
            .cloned()
            .collect();

        for key in keys {
            let cluster = cluster_keyed.remove(&key).and_then(|mut v| v.pop());
            let backend = backend_keyed.remove(&key).and_then(|mut v| v.pop());
            if let Some(pair) = CorrelationPair::new(key.clone(), cluster, backend) {
                result.pairs.insert(key, pair);
            }
        }

        debug!(
            pairs = result.pairs.len(),
            healthy = result.healthy_count(),
            unmatchable = result.unmatchable_total(),
            collisions = result.collisions.len(),
            "Correlated inventories"
        );

        result
    }
}

/// Group one side's records by normalized key, counting the ones that
/// cannot be keyed
fn index_side(
    side: InventorySide,
    records: &[ResourceRecord],
    result: &mut Correlation,
) -> BTreeMap<CorrelationKey, Vec<ResourceRecord>> {
    let mut keyed: BTreeMap<CorrelationKey, Vec<ResourceRecord>> = BTreeMap::new();

    for record in records {
        // A record listed on the wrong side is malformed
        if record.side() != side {
            *result.unmatchable.entry(record.kind).or_default() += 1;
            continue;
        }

        match CorrelationKey::for_record(record) {
            Some(key) if record.is_bound_claim() => {
                *result.uncorrelated.entry(record.kind).or_default() += 1;
                result.settled.insert(key);
            }
            Some(key) => keyed.entry(key).or_default().push(record.clone()),
            None => *result.unmatchable.entry(record.kind).or_default() += 1,
        }
    }

    keyed
}
