//! democratic-csi Key Derivation
//!
//! Derives correlation keys following the naming conventions of the
//! democratic-csi provisioner for TrueNAS:
//! - iSCSI volume handles: `iqn.2005-10.org.freenas.ctl:<volume>`
//! - dataset volume handles: `<pool>/<parent>/<volume>`
//! - snapshots: `<pool>/<parent>/<volume>@<snapshot>`
//! - datasets carry `democratic-csi:csi_volume_name` when created by it

use crate::domain::ports::{
    KeyDeriver, ResourceKind, ResourceRecord, ATTR_CSI_SNAPSHOT_NAME, ATTR_CSI_VOLUME_NAME,
    ATTR_DATASET_PATH, ATTR_SNAPSHOT_HANDLE, ATTR_VOLUME_HANDLE,
};

/// CSI driver names registered by democratic-csi
pub const DEMOCRATIC_CSI_DRIVERS: [&str; 4] = [
    "org.democratic-csi.iscsi",
    "org.democratic-csi.nfs",
    "org.democratic-csi.smb",
    "democratic-csi",
];

/// ZFS user property holding the CSI volume name
pub const PROP_CSI_VOLUME_NAME: &str = "democratic-csi:csi_volume_name";
/// ZFS user property holding the CSI snapshot name
pub const PROP_CSI_SNAPSHOT_NAME: &str = "democratic-csi:csi_snapshot_name";

/// Identifier at the end of a volume or snapshot handle
pub fn handle_name(handle: &str) -> Option<&str> {
    let handle = handle.trim();
    let name = if handle.contains("iqn.") {
        handle.rsplit(':').next()
    } else if handle.contains('/') {
        handle.rsplit('/').next()
    } else {
        Some(handle)
    };
    name.filter(|n| !n.is_empty())
}

/// Key deriver for the democratic-csi naming conventions
#[derive(Debug, Clone, Copy, Default)]
pub struct DemocraticCsiKeys;

impl KeyDeriver for DemocraticCsiKeys {
    fn derive_key(&self, record: &ResourceRecord) -> Option<String> {
        let key = match record.kind {
            ResourceKind::Volume => handle_name(record.attribute(ATTR_VOLUME_HANDLE)?),
            ResourceKind::VolumeClaim => None,
            ResourceKind::Snapshot => handle_name(record.attribute(ATTR_SNAPSHOT_HANDLE)?),
            ResourceKind::BackendVolume => record
                .attribute(ATTR_CSI_VOLUME_NAME)
                .filter(|n| !n.trim().is_empty())
                .or_else(|| record.attribute(ATTR_DATASET_PATH).and_then(handle_name)),
            ResourceKind::BackendSnapshot => {
                match record.attribute(ATTR_DATASET_PATH) {
                    Some(id) if id.contains('@') => handle_name(id),
                    _ => record.attribute(ATTR_CSI_SNAPSHOT_NAME),
                }
            }
        };
        key.map(str::to_string)
    }

    fn convention(&self) -> &str {
        "democratic-csi"
    }
}
