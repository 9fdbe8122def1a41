//! Kubernetes Inventory Source
//!
//! Lists the cluster side of the reconciliation:
//! - PersistentVolumes provisioned by an allow-listed CSI driver
//! - PersistentVolumeClaims, optionally in one namespace
//! - VolumeSnapshotContents (`snapshot.storage.k8s.io/v1`), read as
//!   dynamic objects so the snapshot CRDs are optional

use crate::domain::ports::{
    InventorySide, InventorySource, KeyDeriverRef, ResourceKind, ResourceRecord,
    ATTR_BOUND_VOLUME, ATTR_CSI_DRIVER, ATTR_SNAPSHOT_HANDLE, ATTR_VOLUME_HANDLE,
};
use crate::error::{Error, Result};
use crate::sources::democratic_csi::DEMOCRATIC_CSI_DRIVERS;
use crate::sources::parse_quantity;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Attribute holding the claim a volume is bound to
pub const ATTR_CLAIM_REF: &str = "claimRef";
/// Attribute holding a claim's storage class
pub const ATTR_STORAGE_CLASS: &str = "storageClass";

// =============================================================================
// Configuration
// =============================================================================

/// Scope of the cluster inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesSourceConfig {
    /// Restrict claims to one namespace
    pub namespace: Option<String>,
    /// CSI drivers whose volumes are monitored
    pub csi_drivers: Vec<String>,
    /// List VolumeSnapshotContents
    pub include_snapshots: bool,
}

impl Default for KubernetesSourceConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            csi_drivers: DEMOCRATIC_CSI_DRIVERS.iter().map(|d| d.to_string()).collect(),
            include_snapshots: true,
        }
    }
}

impl KubernetesSourceConfig {
    pub fn monitors_driver(&self, driver: &str) -> bool {
        self.csi_drivers.iter().any(|d| d == driver)
    }
}

// =============================================================================
// Object Conversion
// =============================================================================

fn storage_bytes(resources: Option<&BTreeMap<String, Quantity>>, object: &str) -> u64 {
    let Some(quantity) = resources.and_then(|r| r.get("storage")) else {
        return 0;
    };
    match parse_quantity(&quantity.0) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(object, quantity = %quantity.0, error = %e, "Ignoring unparsable storage quantity");
            0
        }
    }
}

/// Record for a PersistentVolume, or `None` if its driver is not monitored
pub fn volume_record(
    pv: &PersistentVolume,
    config: &KubernetesSourceConfig,
    deriver: &KeyDeriverRef,
) -> Option<ResourceRecord> {
    let spec = pv.spec.as_ref()?;
    let csi = spec.csi.as_ref()?;
    if !config.monitors_driver(&csi.driver) {
        return None;
    }

    let name = pv.name_any();
    let mut record = ResourceRecord::new(ResourceKind::Volume, name.as_str())
        .with_size(storage_bytes(spec.capacity.as_ref(), &name))
        .with_attribute(ATTR_CSI_DRIVER, csi.driver.as_str())
        .with_attribute(ATTR_VOLUME_HANDLE, csi.volume_handle.as_str());

    if let Some(created) = pv.metadata.creation_timestamp.as_ref() {
        record = record.with_created_at(created.0);
    }
    if let Some(phase) = pv.status.as_ref().and_then(|s| s.phase.as_ref()) {
        record = record.with_status(phase.as_str());
    }
    if let Some(claim) = spec.claim_ref.as_ref() {
        let claim_ref = format!(
            "{}/{}",
            claim.namespace.as_deref().unwrap_or_default(),
            claim.name.as_deref().unwrap_or_default()
        );
        record = record.with_attribute(ATTR_CLAIM_REF, claim_ref);
    }

    Some(record.derive_key(deriver.as_ref()))
}

/// Record for a PersistentVolumeClaim
pub fn claim_record(pvc: &PersistentVolumeClaim, deriver: &KeyDeriverRef) -> ResourceRecord {
    let native_id = format!("{}/{}", pvc.namespace().unwrap_or_default(), pvc.name_any());
    let spec = pvc.spec.as_ref();

    let requests = spec
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref());
    let mut record = ResourceRecord::new(ResourceKind::VolumeClaim, native_id.as_str())
        .with_size(storage_bytes(requests, &native_id));

    if let Some(created) = pvc.metadata.creation_timestamp.as_ref() {
        record = record.with_created_at(created.0);
    }
    if let Some(phase) = pvc.status.as_ref().and_then(|s| s.phase.as_ref()) {
        record = record.with_status(phase.as_str());
    }
    if let Some(volume) = spec.and_then(|s| s.volume_name.as_ref()) {
        record = record.with_attribute(ATTR_BOUND_VOLUME, volume.as_str());
    }
    if let Some(class) = spec.and_then(|s| s.storage_class_name.as_ref()) {
        record = record.with_attribute(ATTR_STORAGE_CLASS, class.as_str());
    }

    record.derive_key(deriver.as_ref())
}

/// Record for a VolumeSnapshotContent, or `None` if its driver is not monitored
pub fn snapshot_content_record(
    content: &DynamicObject,
    config: &KubernetesSourceConfig,
    deriver: &KeyDeriverRef,
) -> Option<ResourceRecord> {
    let spec = content.data.get("spec")?;
    let driver = spec.get("driver").and_then(Value::as_str)?;
    if !config.monitors_driver(driver) {
        return None;
    }

    let status = content.data.get("status");
    let handle = status
        .and_then(|s| s.get("snapshotHandle"))
        .or_else(|| spec.pointer("/source/snapshotHandle"))
        .and_then(Value::as_str);

    let mut record = ResourceRecord::new(ResourceKind::Snapshot, content.name_any())
        .with_size(
            status
                .and_then(|s| s.get("restoreSize"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
        )
        .with_attribute(ATTR_CSI_DRIVER, driver);

    if let Some(handle) = handle {
        record = record.with_attribute(ATTR_SNAPSHOT_HANDLE, handle);
    }
    if let Some(created) = content.metadata.creation_timestamp.as_ref() {
        record = record.with_created_at(created.0);
    }
    match status.and_then(|s| s.get("readyToUse")).and_then(Value::as_bool) {
        Some(true) => record = record.with_status("ready"),
        Some(false) => record = record.with_status("pending"),
        None => {}
    }

    Some(record.derive_key(deriver.as_ref()))
}

/// Map a VolumeSnapshotContent list failure. A 404 means the snapshot
/// CRDs are not installed, which says nothing about the backend's snapshots.
pub fn snapshot_list_error(error: kube::Error) -> Error {
    match error {
        kube::Error::Api(response) if response.code == 404 => {
            debug!("VolumeSnapshotContent API not served");
            Error::KindNotListed {
                kind: ResourceKind::Snapshot,
                reason: format!("VolumeSnapshotContent API not served: {}", response.message),
            }
        }
        other => other.into(),
    }
}

// =============================================================================
// Kubernetes Inventory
// =============================================================================

/// Cluster inventory read from the Kubernetes API
pub struct KubernetesInventory {
    client: Client,
    config: KubernetesSourceConfig,
    deriver: KeyDeriverRef,
    snapshot_resource: ApiResource,
}

impl KubernetesInventory {
    pub fn new(client: Client, config: KubernetesSourceConfig, deriver: KeyDeriverRef) -> Self {
        let gvk = GroupVersionKind::gvk("snapshot.storage.k8s.io", "v1", "VolumeSnapshotContent");
        Self {
            client,
            config,
            deriver,
            snapshot_resource: ApiResource::from_gvk(&gvk),
        }
    }

    /// Connect with the ambient kubeconfig or in-cluster service account
    pub async fn connect(config: KubernetesSourceConfig, deriver: KeyDeriverRef) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, config, deriver))
    }

    async fn list_volumes(&self) -> Result<Vec<ResourceRecord>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let pvs = api.list(&ListParams::default()).await?;

        let total = pvs.items.len();
        let records: Vec<_> = pvs
            .items
            .iter()
            .filter_map(|pv| volume_record(pv, &self.config, &self.deriver))
            .collect();

        debug!(total, monitored = records.len(), "Listed PersistentVolumes");
        Ok(records)
    }

    async fn list_claims(&self) -> Result<Vec<ResourceRecord>> {
        let api: Api<PersistentVolumeClaim> = match &self.config.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let pvcs = api.list(&ListParams::default()).await?;

        Ok(pvcs
            .items
            .iter()
            .map(|pvc| claim_record(pvc, &self.deriver))
            .collect())
    }

    async fn list_snapshot_contents(&self) -> Result<Vec<ResourceRecord>> {
        if !self.config.include_snapshots {
            return Err(Error::KindNotListed {
                kind: ResourceKind::Snapshot,
                reason: "snapshot listing disabled".into(),
            });
        }

        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.snapshot_resource);
        let contents = api
            .list(&ListParams::default())
            .await
            .map_err(snapshot_list_error)?;

        Ok(contents
            .items
            .iter()
            .filter_map(|c| snapshot_content_record(c, &self.config, &self.deriver))
            .collect())
    }
}

#[async_trait]
impl InventorySource for KubernetesInventory {
    fn side(&self) -> InventorySide {
        InventorySide::Cluster
    }

    fn source_name(&self) -> &str {
        "kubernetes"
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceRecord>> {
        match kind {
            ResourceKind::Volume => self.list_volumes().await,
            ResourceKind::VolumeClaim => self.list_claims().await,
            ResourceKind::Snapshot => self.list_snapshot_contents().await,
            other => Err(Error::Internal(format!(
                "kubernetes cannot list backend kind {}",
                other
            ))),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.client.apiserver_version().await.is_ok())
    }
}
