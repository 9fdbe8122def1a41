//! Domain Ports - Core trait definitions for the orphan monitor
//!
//! These traits define the boundaries between the reconciliation core and
//! external systems. Adapters implement these traits to provide concrete
//! inventories, key derivation rules and reporting surfaces.

use crate::error::Result;
use crate::reconcile::events::{CycleReport, ScanOverrun};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Inventory Sides and Kinds
// =============================================================================

/// Which system an inventory describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InventorySide {
    Cluster,
    Backend,
}

impl std::fmt::Display for InventorySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InventorySide::Cluster => write!(f, "cluster"),
            InventorySide::Backend => write!(f, "backend"),
        }
    }
}

/// Kind of a storage-relevant record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// PersistentVolume
    Volume,
    /// PersistentVolumeClaim
    VolumeClaim,
    /// VolumeSnapshotContent
    Snapshot,
    /// Dataset or zvol on the backend
    BackendVolume,
    /// ZFS snapshot on the backend
    BackendSnapshot,
}

impl ResourceKind {
    /// Kinds listed from the cluster side
    pub const CLUSTER: [ResourceKind; 3] = [
        ResourceKind::Volume,
        ResourceKind::VolumeClaim,
        ResourceKind::Snapshot,
    ];

    /// Kinds listed from the backend side
    pub const BACKEND: [ResourceKind; 2] =
        [ResourceKind::BackendVolume, ResourceKind::BackendSnapshot];

    /// All kinds belonging to a side
    pub fn for_side(side: InventorySide) -> &'static [ResourceKind] {
        match side {
            InventorySide::Cluster => &Self::CLUSTER,
            InventorySide::Backend => &Self::BACKEND,
        }
    }

    /// Side this kind is listed from
    pub fn side(&self) -> InventorySide {
        match self {
            ResourceKind::Volume | ResourceKind::VolumeClaim | ResourceKind::Snapshot => {
                InventorySide::Cluster
            }
            ResourceKind::BackendVolume | ResourceKind::BackendSnapshot => InventorySide::Backend,
        }
    }

    /// Correlation key space of this kind.
    ///
    /// Claims have no backend counterpart of their own; they live in a
    /// cluster-only scope keyed by namespace/name.
    pub fn scope(&self) -> Option<KeyScope> {
        match self {
            ResourceKind::Volume | ResourceKind::BackendVolume => Some(KeyScope::Volume),
            ResourceKind::Snapshot | ResourceKind::BackendSnapshot => Some(KeyScope::Snapshot),
            ResourceKind::VolumeClaim => Some(KeyScope::Claim),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::VolumeClaim => write!(f, "volume_claim"),
            ResourceKind::Snapshot => write!(f, "snapshot"),
            ResourceKind::BackendVolume => write!(f, "backend_volume"),
            ResourceKind::BackendSnapshot => write!(f, "backend_snapshot"),
        }
    }
}

/// Key space a correlation key lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScope {
    Volume,
    Snapshot,
    Claim,
}

impl std::fmt::Display for KeyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyScope::Volume => write!(f, "volume"),
            KeyScope::Snapshot => write!(f, "snapshot"),
            KeyScope::Claim => write!(f, "claim"),
        }
    }
}

// =============================================================================
// Resource Record
// =============================================================================

/// Attribute holding a CSI volume handle
pub const ATTR_VOLUME_HANDLE: &str = "volumeHandle";
/// Attribute holding a CSI snapshot handle
pub const ATTR_SNAPSHOT_HANDLE: &str = "snapshotHandle";
/// Attribute holding the CSI driver name
pub const ATTR_CSI_DRIVER: &str = "csiDriver";
/// Attribute holding a backend dataset or snapshot path
pub const ATTR_DATASET_PATH: &str = "datasetPath";
/// Attribute holding the provisioner's volume name property
pub const ATTR_CSI_VOLUME_NAME: &str = "csiVolumeName";
/// Attribute holding the provisioner's snapshot name property
pub const ATTR_CSI_SNAPSHOT_NAME: &str = "csiSnapshotName";
/// Attribute holding a claim's bound volume name
pub const ATTR_BOUND_VOLUME: &str = "boundVolume";

/// Claim phase reported once a volume is bound
pub const CLAIM_PHASE_BOUND: &str = "Bound";

/// Normalized view of one storage object from either side.
///
/// Rebuilt every scan, never mutated after the source hands it over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    /// Source-specific identifier (namespace/name, dataset path)
    pub native_id: String,
    /// Raw key produced by the source's key deriver
    pub correlation_key: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    /// Source lifecycle phase (Bound, Released); informational only
    pub status_hint: Option<String>,
    /// Source-native identity attributes consumed by key derivation
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ResourceRecord {
    pub fn new(kind: ResourceKind, native_id: impl Into<String>) -> Self {
        Self {
            kind,
            native_id: native_id.into(),
            correlation_key: None,
            created_at: None,
            size_bytes: 0,
            status_hint: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status_hint = Some(status.into());
        self
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Fill in the correlation key using a deriver
    pub fn derive_key(mut self, deriver: &dyn KeyDeriver) -> Self {
        self.correlation_key = deriver.derive_key(&self);
        self
    }

    pub fn side(&self) -> InventorySide {
        self.kind.side()
    }

    /// A claim in phase Bound with a volume name set
    pub fn is_bound_claim(&self) -> bool {
        self.kind == ResourceKind::VolumeClaim
            && self.status_hint.as_deref() == Some(CLAIM_PHASE_BOUND)
            && self.attribute(ATTR_BOUND_VOLUME).map_or(false, |v| !v.is_empty())
    }
}

// =============================================================================
// Key Derivation Port
// =============================================================================

/// Port for deriving cross-system correlation keys.
///
/// Implementations must be deterministic. Returning `None` marks the record
/// unmatchable (unprovisioned or malformed).
pub trait KeyDeriver: Send + Sync {
    /// Derive the raw correlation key for a record
    fn derive_key(&self, record: &ResourceRecord) -> Option<String>;

    /// Name of the provisioner convention this deriver implements
    fn convention(&self) -> &str;
}

// =============================================================================
// Inventory Source Port
// =============================================================================

/// Port for listing one side's storage inventory
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// Side this source describes
    fn side(&self) -> InventorySide;

    /// Human-readable source name
    fn source_name(&self) -> &str;

    /// List all records of a kind
    async fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceRecord>>;

    /// Check if the source is reachable
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Reporting Sink Port
// =============================================================================

/// Port for consumers of cycle results (metrics, logs, alerting)
pub trait ReportingSink: Send + Sync {
    /// Called once per finished cycle, degraded or not
    fn on_cycle_result(&self, report: &CycleReport);

    /// Called when a scheduler tick is dropped because a cycle is running
    fn on_scan_overrun(&self, _overrun: &ScanOverrun) {}
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type InventorySourceRef = Arc<dyn InventorySource>;
pub type KeyDeriverRef = Arc<dyn KeyDeriver>;
pub type ReportingSinkRef = Arc<dyn ReportingSink>;
