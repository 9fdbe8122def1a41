//! Monitor Configuration
//!
//! Loaded from an optional YAML file with `${VAR}` and `${VAR:default}`
//! environment expansion, then overridden by command-line flags.

use crate::error::{Error, Result};
use crate::reconcile::engine::EngineConfig;
use crate::sources::{KubernetesSourceConfig, TrueNasConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Sections
// =============================================================================

/// Root configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub scan: ScanConfig,
    pub kubernetes: KubernetesSourceConfig,
    pub truenas: TrueNasConfig,
    pub api: ServerAddrConfig,
    pub metrics: ServerAddrConfig,
    pub health: ServerAddrConfig,
}

/// Scan cadence and hysteresis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub scan_interval_secs: u64,
    pub min_consecutive_observations: u32,
    pub min_orphan_age_secs: u64,
    /// Per-source fetch timeout; a third of the interval when unset
    pub fetch_timeout_secs: Option<u64>,
    /// Key derivation convention
    pub key_convention: String,
    /// Backend snapshots younger than this are never candidates
    pub snapshot_retention_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 300,
            min_consecutive_observations: 3,
            min_orphan_age_secs: 24 * 3600,
            fetch_timeout_secs: None,
            key_convention: "democratic-csi".to_string(),
            snapshot_retention_secs: 30 * 24 * 3600,
        }
    }
}

impl ScanConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        let secs = self
            .fetch_timeout_secs
            .unwrap_or_else(|| (self.scan_interval_secs / 3).max(1));
        Duration::from_secs(secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            min_consecutive_observations: self.min_consecutive_observations,
            min_orphan_age: Duration::from_secs(self.min_orphan_age_secs),
            fetch_timeout: self.fetch_timeout(),
            snapshot_retention: Duration::from_secs(self.snapshot_retention_secs),
        }
    }
}

/// Listen address of one HTTP surface
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerAddrConfig {
    pub addr: Option<String>,
}

// =============================================================================
// Loading
// =============================================================================

impl MonitorConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Configuration(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string after environment expansion
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env(content)?;
        Ok(serde_yaml::from_str(&expanded)?)
    }

    /// Defaults, or the file at `path` if given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Reject configurations the monitor cannot run with
    pub fn validate(&self) -> Result<()> {
        let scan = &self.scan;
        if scan.min_consecutive_observations < 1 {
            return Err(Error::Configuration(
                "scan.min_consecutive_observations must be at least 1".into(),
            ));
        }
        if scan.scan_interval_secs == 0 {
            return Err(Error::Configuration(
                "scan.scan_interval_secs must be positive".into(),
            ));
        }
        if scan.fetch_timeout_secs == Some(0) {
            return Err(Error::Configuration(
                "scan.fetch_timeout_secs must be positive".into(),
            ));
        }
        if scan.fetch_timeout() > scan.scan_interval() {
            return Err(Error::Configuration(format!(
                "scan.fetch_timeout_secs ({}) exceeds scan.scan_interval_secs ({})",
                scan.fetch_timeout().as_secs(),
                scan.scan_interval_secs
            )));
        }
        if self.truenas.url.trim().is_empty() {
            return Err(Error::Configuration("truenas.url is required".into()));
        }
        if !self.truenas.has_credentials() {
            return Err(Error::Configuration(
                "truenas.api_key or truenas.username and truenas.password are required".into(),
            ));
        }
        if self.kubernetes.csi_drivers.is_empty() {
            return Err(Error::Configuration(
                "kubernetes.csi_drivers must name at least one driver".into(),
            ));
        }
        Ok(())
    }
}

/// Replace `${VAR}` and `${VAR:default}` with environment values
pub fn expand_env(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            Error::Configuration(format!("unterminated variable reference: ${{{}", after))
        })?;

        let expr = &after[..end];
        let (name, default) = match expr.split_once(':') {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };

        match (std::env::var(name), default) {
            (Ok(value), _) => out.push_str(&value),
            (Err(_), Some(default)) => out.push_str(default),
            (Err(_), None) => {
                return Err(Error::Configuration(format!(
                    "environment variable {} is not set",
                    name
                )))
            }
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}
