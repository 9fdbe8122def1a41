//! Shared fixtures for reconciliation tests

use crate::domain::ports::{
    ReportingSink, ResourceKind, ResourceRecord, ATTR_CSI_DRIVER, ATTR_DATASET_PATH,
    ATTR_SNAPSHOT_HANDLE, ATTR_VOLUME_HANDLE,
};
use crate::reconcile::events::{CycleReport, ScanOverrun};
use parking_lot::Mutex;

pub const GI: u64 = 1024 * 1024 * 1024;

/// PersistentVolume-shaped record keyed by `key`
pub fn cluster_volume(name: &str, key: &str) -> ResourceRecord {
    ResourceRecord::new(ResourceKind::Volume, name)
        .with_key(key)
        .with_size(GI)
        .with_attribute(ATTR_CSI_DRIVER, "org.democratic-csi.iscsi")
        .with_attribute(ATTR_VOLUME_HANDLE, key)
}

/// Dataset-shaped record keyed by `key`
pub fn backend_volume(path: &str, key: &str) -> ResourceRecord {
    ResourceRecord::new(ResourceKind::BackendVolume, path)
        .with_key(key)
        .with_size(GI)
        .with_attribute(ATTR_DATASET_PATH, path)
}

/// VolumeSnapshotContent-shaped record keyed by `key`
pub fn cluster_snapshot(name: &str, key: &str) -> ResourceRecord {
    ResourceRecord::new(ResourceKind::Snapshot, name)
        .with_key(key)
        .with_attribute(ATTR_SNAPSHOT_HANDLE, key)
}

/// ZFS snapshot record keyed by `key`
pub fn backend_snapshot(id: &str, key: &str) -> ResourceRecord {
    ResourceRecord::new(ResourceKind::BackendSnapshot, id)
        .with_key(key)
        .with_attribute(ATTR_DATASET_PATH, id)
}

/// Sink that keeps everything it is handed
#[derive(Debug, Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<CycleReport>>,
    overruns: Mutex<Vec<ScanOverrun>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<CycleReport> {
        self.reports.lock().clone()
    }

    pub fn overruns(&self) -> Vec<ScanOverrun> {
        self.overruns.lock().clone()
    }
}

impl ReportingSink for RecordingSink {
    fn on_cycle_result(&self, report: &CycleReport) {
        self.reports.lock().push(report.clone());
    }

    fn on_scan_overrun(&self, overrun: &ScanOverrun) {
        self.overruns.lock().push(overrun.clone());
    }
}
