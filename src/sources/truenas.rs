//! TrueNAS Inventory Source
//!
//! Lists democratic-csi datasets, zvols and ZFS snapshots through the
//! TrueNAS REST API v2.0. Responses are parsed leniently: TrueNAS
//! releases disagree on whether properties are numbers, strings or
//! `{value, rawvalue, parsed}` objects.

use crate::domain::ports::{
    InventorySide, InventorySource, KeyDeriverRef, ResourceKind, ResourceRecord,
    ATTR_CSI_SNAPSHOT_NAME, ATTR_CSI_VOLUME_NAME, ATTR_DATASET_PATH,
};
use crate::error::{Error, Result};
use crate::sources::democratic_csi::{PROP_CSI_SNAPSHOT_NAME, PROP_CSI_VOLUME_NAME};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Connection settings for a TrueNAS system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrueNasConfig {
    /// Base URL, e.g. `https://truenas.local`
    pub url: String,
    /// API key; preferred over basic auth when set
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// HTTP request timeout
    pub timeout_secs: u64,
    /// Verify the server certificate
    pub verify_tls: bool,
    /// Datasets under which democratic-csi creates volumes
    pub parent_datasets: Vec<String>,
    /// Snapshot name prefixes counted as provisioner snapshots when the
    /// snapshot carries no `democratic-csi:csi_snapshot_name` property
    pub snapshot_name_prefixes: Vec<String>,
}

impl Default for TrueNasConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            username: None,
            password: None,
            timeout_secs: 30,
            verify_tls: true,
            parent_datasets: Vec::new(),
            snapshot_name_prefixes: DEFAULT_SNAPSHOT_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl TrueNasConfig {
    /// Whether API key or username/password credentials are present
    pub fn has_credentials(&self) -> bool {
        let set = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.is_empty());
        set(&self.api_key) || (set(&self.username) && set(&self.password))
    }
}

// =============================================================================
// Dataset Selection
// =============================================================================

/// Names the CSI external-snapshotter gives snapshots by default
pub const DEFAULT_SNAPSHOT_PREFIXES: [&str; 1] = ["snapshot-"];

/// Decides which datasets and snapshots belong to the monitored provisioner
#[derive(Debug, Clone, Default)]
pub struct DatasetFilter {
    parents: Vec<String>,
    snapshot_prefixes: Vec<String>,
}

impl DatasetFilter {
    pub fn new(parents: &[String]) -> Self {
        Self {
            parents: parents
                .iter()
                .map(|p| p.trim().trim_end_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            snapshot_prefixes: DEFAULT_SNAPSHOT_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    pub fn with_snapshot_prefixes(mut self, prefixes: &[String]) -> Self {
        self.snapshot_prefixes = prefixes
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    /// Untagged snapshot of a managed dataset, named like a CSI snapshot.
    /// Periodic and replication snapshots (`auto-...`) fail the name check.
    pub fn is_managed_snapshot(&self, dataset: &str, name: &str) -> bool {
        self.is_managed_path(dataset)
            && self
                .snapshot_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// Strictly below one of the parent datasets
    pub fn is_managed_path(&self, path: &str) -> bool {
        self.parents.iter().any(|parent| {
            path.strip_prefix(parent.as_str())
                .map_or(false, |rest| rest.starts_with('/') && rest.len() > 1)
        })
    }
}

// =============================================================================
// Response Parsing
// =============================================================================

/// Numeric property in any of the shapes TrueNAS emits
fn prop_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => map
            .get("parsed")
            .and_then(prop_u64)
            .or_else(|| map.get("rawvalue").and_then(prop_u64))
            .or_else(|| map.get("value").and_then(prop_u64)),
        _ => None,
    }
}

fn prop_str(value: &Value) -> Option<&str> {
    let s = match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("value").and_then(prop_str),
        _ => None,
    };
    s.filter(|s| !s.is_empty() && *s != "-")
}

/// Timestamp as `{"$date": millis}` or epoch seconds
fn prop_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Object(map) => {
            if let Some(millis) = map.get("$date").and_then(Value::as_i64) {
                return Utc.timestamp_millis_opt(millis).single();
            }
            map.get("parsed")
                .and_then(prop_time)
                .or_else(|| map.get("rawvalue").and_then(prop_time))
                .or_else(|| map.get("value").and_then(prop_time))
        }
        other => prop_u64(other).and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
    }
}

/// User property from either `user_properties` or the top level
fn user_property<'a>(entry: &'a Value, name: &str) -> Option<&'a str> {
    entry
        .get("user_properties")
        .and_then(|props| props.get(name))
        .or_else(|| entry.get("properties").and_then(|props| props.get(name)))
        .or_else(|| entry.get(name))
        .and_then(prop_str)
}

fn flatten_datasets<'a>(entries: &'a [Value], out: &mut Vec<&'a Value>) {
    for entry in entries {
        out.push(entry);
        if let Some(children) = entry.get("children").and_then(Value::as_array) {
            flatten_datasets(children, out);
        }
    }
}

/// Records for every managed dataset or zvol in a `/pool/dataset` response
pub fn dataset_records(
    entries: &[Value],
    filter: &DatasetFilter,
    deriver: &KeyDeriverRef,
) -> Vec<ResourceRecord> {
    let mut all = Vec::new();
    flatten_datasets(entries, &mut all);

    let mut records = Vec::new();
    for entry in all {
        let Some(path) = entry.get("id").and_then(Value::as_str) else {
            warn!("Skipping dataset without id");
            continue;
        };
        let volume_name = user_property(entry, PROP_CSI_VOLUME_NAME);
        if volume_name.is_none() && !filter.is_managed_path(path) {
            continue;
        }

        let mut record = ResourceRecord::new(ResourceKind::BackendVolume, path)
            .with_size(entry.get("used").and_then(prop_u64).unwrap_or(0))
            .with_attribute(ATTR_DATASET_PATH, path);
        if let Some(name) = volume_name {
            record = record.with_attribute(ATTR_CSI_VOLUME_NAME, name);
        }
        if let Some(kind) = entry.get("type").and_then(Value::as_str) {
            record = record.with_status(kind.to_lowercase());
        }
        if let Some(created) = entry.get("creation").and_then(prop_time) {
            record = record.with_created_at(created);
        }
        records.push(record.derive_key(deriver.as_ref()));
    }
    records
}

/// Records for every managed snapshot in a `/zfs/snapshot` response
pub fn snapshot_records(
    entries: &[Value],
    filter: &DatasetFilter,
    deriver: &KeyDeriverRef,
) -> Vec<ResourceRecord> {
    let mut records = Vec::new();
    for entry in entries {
        let Some(id) = entry.get("id").and_then(Value::as_str) else {
            warn!("Skipping snapshot without id");
            continue;
        };
        let (id_dataset, id_name) = id.split_once('@').unwrap_or((id, ""));
        let dataset = entry
            .get("dataset")
            .and_then(Value::as_str)
            .unwrap_or(id_dataset);
        let name = entry
            .get("snapshot_name")
            .and_then(Value::as_str)
            .unwrap_or(id_name);
        let snapshot_name = user_property(entry, PROP_CSI_SNAPSHOT_NAME);
        if snapshot_name.is_none() && !filter.is_managed_snapshot(dataset, name) {
            continue;
        }

        let props = entry.get("properties");
        let mut record = ResourceRecord::new(ResourceKind::BackendSnapshot, id)
            .with_size(
                props
                    .and_then(|p| p.get("used"))
                    .and_then(prop_u64)
                    .unwrap_or(0),
            )
            .with_attribute(ATTR_DATASET_PATH, id);
        if let Some(name) = snapshot_name {
            record = record.with_attribute(ATTR_CSI_SNAPSHOT_NAME, name);
        }
        if let Some(created) = props.and_then(|p| p.get("creation")).and_then(prop_time) {
            record = record.with_created_at(created);
        }
        records.push(record.derive_key(deriver.as_ref()));
    }
    records
}

// =============================================================================
// TrueNAS Inventory
// =============================================================================

/// Backend inventory read from a TrueNAS system
pub struct TrueNasInventory {
    config: TrueNasConfig,
    base_url: String,
    http: Client,
    filter: DatasetFilter,
    deriver: KeyDeriverRef,
}

impl TrueNasInventory {
    pub fn new(config: TrueNasConfig, deriver: KeyDeriverRef) -> Result<Self> {
        let url = config.url.trim().trim_end_matches('/');
        if url.is_empty() {
            return Err(Error::Configuration("truenas.url is required".into()));
        }
        if !config.has_credentials() {
            return Err(Error::Configuration(
                "truenas requires api_key or username and password".into(),
            ));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        Ok(Self {
            base_url: format!("{}/api/v2.0", url),
            filter: DatasetFilter::new(&config.parent_datasets)
                .with_snapshot_prefixes(&config.snapshot_name_prefixes),
            config,
            http,
            deriver,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.get(format!("{}{}", self.base_url, path));
        match (&self.config.api_key, &self.config.username) {
            (Some(key), _) if !key.is_empty() => request.bearer_auth(key),
            (_, Some(user)) => request.basic_auth(user, self.config.password.as_ref()),
            _ => request,
        }
    }

    async fn get_array(&self, path: &str) -> Result<Vec<Value>> {
        let response = self.request(path).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SourceResponse {
                source_name: self.source_name().to_string(),
                reason: format!("GET {} returned {}: {}", path, status, body.trim()),
            });
        }

        match response.json::<Value>().await? {
            Value::Array(entries) => Ok(entries),
            other => Err(Error::SourceResponse {
                source_name: self.source_name().to_string(),
                reason: format!("GET {} returned non-array body: {}", path, other),
            }),
        }
    }
}

#[async_trait]
impl InventorySource for TrueNasInventory {
    fn side(&self) -> InventorySide {
        InventorySide::Backend
    }

    fn source_name(&self) -> &str {
        "truenas"
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceRecord>> {
        let records = match kind {
            ResourceKind::BackendVolume => {
                let entries = self.get_array("/pool/dataset").await?;
                dataset_records(&entries, &self.filter, &self.deriver)
            }
            ResourceKind::BackendSnapshot => {
                let entries = self.get_array("/zfs/snapshot").await?;
                snapshot_records(&entries, &self.filter, &self.deriver)
            }
            other => {
                return Err(Error::Internal(format!(
                    "truenas cannot list cluster kind {}",
                    other
                )))
            }
        };

        debug!(%kind, count = records.len(), "Listed TrueNAS inventory");
        Ok(records)
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self.request("/system/info").send().await?;
        Ok(response.status().is_success())
    }
}
