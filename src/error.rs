//! Error types for the Storage Orphan Monitor
//!
//! Provides structured error types for inventory sources, correlation,
//! the findings store and configuration, plus a classification of each
//! error into the monitor's recovery taxonomy.

use crate::domain::ports::{InventorySide, ResourceKind};
use thiserror::Error;

/// Unified error type for the monitor
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Backend HTTP Errors
    // =========================================================================
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Inventory Source Errors
    // =========================================================================
    #[error("Inventory source unavailable: {side} - {cause}")]
    SourceUnavailable { side: InventorySide, cause: String },

    #[error("Inventory fetch timed out: {side} after {timeout_secs}s")]
    SourceTimeout { side: InventorySide, timeout_secs: u64 },

    #[error("Unexpected response from {source_name}: {reason}")]
    SourceResponse { source_name: String, reason: String },

    /// The source cannot list this kind at all (API absent or disabled)
    #[error("Cannot list {kind}: {reason}")]
    KindNotListed { kind: ResourceKind, reason: String },

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    #[error("Correlation key collision on {side} side: {key} claimed by {native_ids:?}")]
    CorrelationKeyCollision {
        key: String,
        side: InventorySide,
        native_ids: Vec<String>,
    },

    #[error("Findings store commit failed: {reason}")]
    StoreCommitFailure { reason: String },

    #[error("A scan cycle is already in progress")]
    ScanInProgress,

    #[error("Scan cycle cancelled")]
    Cancelled,

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Quantity parse error: {0}")]
    QuantityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recovery class of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Single fetch failed; the next scheduled cycle retries
    Transient,
    /// Collision or malformed record; isolated to the affected keys
    DataIntegrity,
    /// Store unavailable at commit; the cycle's findings are dropped
    Commit,
    /// Invalid configuration; fatal at startup
    Configuration,
    /// Anything else; logged, the monitor keeps running
    Fatal,
}

impl Error {
    /// Classify this error for recovery handling
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Kube(_)
            | Error::Http(_)
            | Error::SourceUnavailable { .. }
            | Error::SourceTimeout { .. }
            | Error::SourceResponse { .. }
            | Error::KindNotListed { .. }
            | Error::ScanInProgress
            | Error::Cancelled => ErrorClass::Transient,

            Error::CorrelationKeyCollision { .. } | Error::QuantityParse(_) => {
                ErrorClass::DataIntegrity
            }

            Error::StoreCommitFailure { .. } => ErrorClass::Commit,

            Error::Configuration(_) | Error::YamlParse(_) => ErrorClass::Configuration,

            Error::Internal(_) | Error::JsonParse(_) | Error::Io(_) => ErrorClass::Fatal,
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Result type alias for the monitor
pub type Result<T> = std::result::Result<T, Error>;
