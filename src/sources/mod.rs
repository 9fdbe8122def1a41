//! Inventory Source Adapters
//!
//! Provides the two sides of the reconciliation:
//! - Kubernetes: PersistentVolumes, claims and snapshot contents
//! - TrueNAS: datasets, zvols and ZFS snapshots
//! - Memory: fixed inventories for embedding and tests

pub mod democratic_csi;
pub mod kubernetes;
pub mod memory;
pub mod truenas;

pub use democratic_csi::DemocraticCsiKeys;
pub use kubernetes::{KubernetesInventory, KubernetesSourceConfig};
pub use memory::MemoryInventory;
pub use truenas::{TrueNasConfig, TrueNasInventory};

use crate::domain::ports::{InventorySourceRef, KeyDeriverRef};
use crate::error::{Error, Result};
use std::sync::Arc;

/// Factory for the production inventory sources
pub struct SourceFactory;

impl SourceFactory {
    /// Key deriver by convention name
    pub fn deriver(convention: &str) -> Result<KeyDeriverRef> {
        match convention.to_lowercase().as_str() {
            "democratic-csi" | "democratic_csi" => Ok(Arc::new(DemocraticCsiKeys)),
            other => Err(Error::Configuration(format!(
                "unknown key convention: {}",
                other
            ))),
        }
    }

    /// Cluster-side source using the ambient Kubernetes credentials
    pub async fn cluster(
        config: KubernetesSourceConfig,
        deriver: KeyDeriverRef,
    ) -> Result<InventorySourceRef> {
        Ok(Arc::new(KubernetesInventory::connect(config, deriver).await?))
    }

    /// Backend-side source for a TrueNAS system
    pub fn backend(config: TrueNasConfig, deriver: KeyDeriverRef) -> Result<InventorySourceRef> {
        Ok(Arc::new(TrueNasInventory::new(config, deriver)?))
    }
}

/// Parse a Kubernetes resource quantity (`5Gi`, `500M`, `1024`) into bytes
pub fn parse_quantity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::QuantityParse("empty quantity".into()));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map_or(s.len(), |(i, _)| i);

    let num_str = &s[..num_end];
    let unit_str = &s[num_end..];

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::QuantityParse(format!("invalid number: {}", s)))?;

    // Suffixes are case-sensitive: "M" is mega, "m" is milli
    let multiplier: f64 = match unit_str {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "Pi" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "Ei" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "m" => 1e-3,
        _ => {
            return Err(Error::QuantityParse(format!("unknown suffix: {}", unit_str)));
        }
    };

    Ok((num * multiplier).ceil() as u64)
}
