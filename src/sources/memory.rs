//! In-Memory Inventory Source
//!
//! Holds a fixed set of records for one side. Used for embedding and
//! tests; supports injected failures and artificial latency.

use crate::domain::ports::{InventorySide, InventorySource, ResourceKind, ResourceRecord};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Inventory backed by a vector of records
pub struct MemoryInventory {
    side: InventorySide,
    name: String,
    records: RwLock<Vec<ResourceRecord>>,
    /// When set, every call fails with this cause
    failure: RwLock<Option<String>>,
    delay: RwLock<Option<Duration>>,
    /// Kinds answered with `Error::KindNotListed`
    unlisted: RwLock<BTreeSet<ResourceKind>>,
    list_calls: AtomicU64,
}

impl MemoryInventory {
    pub fn new(side: InventorySide, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            side,
            name: name.into(),
            records: RwLock::new(Vec::new()),
            failure: RwLock::new(None),
            delay: RwLock::new(None),
            unlisted: RwLock::new(BTreeSet::new()),
            list_calls: AtomicU64::new(0),
        })
    }

    /// Replace the whole inventory
    pub fn set_records(&self, records: Vec<ResourceRecord>) {
        *self.records.write() = records;
    }

    pub fn push(&self, record: ResourceRecord) {
        self.records.write().push(record);
    }

    /// Make subsequent calls fail
    pub fn fail_with(&self, cause: impl Into<String>) {
        *self.failure.write() = Some(cause.into());
    }

    pub fn recover(&self) {
        *self.failure.write() = None;
    }

    /// Report `kind` as not listable, as when its API is not served
    pub fn mark_unlisted(&self, kind: ResourceKind) {
        self.unlisted.write().insert(kind);
    }

    pub fn mark_listed(&self, kind: ResourceKind) {
        self.unlisted.write().remove(&kind);
    }

    /// Delay every list call
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::Relaxed)
    }

    fn check_failure(&self) -> Result<()> {
        match self.failure.read().as_ref() {
            Some(cause) => Err(Error::SourceUnavailable {
                side: self.side,
                cause: cause.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InventorySource for MemoryInventory {
    fn side(&self) -> InventorySide {
        self.side
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceRecord>> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);

        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_failure()?;
        if self.unlisted.read().contains(&kind) {
            return Err(Error::KindNotListed {
                kind,
                reason: format!("{} does not serve this kind", self.name),
            });
        }

        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.failure.read().is_none())
    }
}
