//! Storage Orphan Monitor
//!
//! Watches a Kubernetes cluster's storage objects against a TrueNAS
//! backend and reports resources that exist on only one side.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Scan Scheduler                              │
//! │               (fixed interval, single flight, cancel)                │
//! └──────────────────────────────┬───────────────────────────────────────┘
//!                                │
//! ┌──────────────────────────────┴───────────────────────────────────────┐
//! │                       Reconciliation Engine                          │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌────────────────────┐  │
//! │  │  Identity        │  │  Candidate       │  │  Usage and drift   │  │
//! │  │  Correlator      │  │  hysteresis      │  │                    │  │
//! │  └──────────────────┘  └──────────────────┘  └────────────────────┘  │
//! └─────────┬─────────────────────┬───────────────────────┬──────────────┘
//!           │                     │                       │
//! ┌─────────┴──────────┐ ┌────────┴─────────┐ ┌───────────┴─────────────┐
//! │ Inventory sources  │ │  Findings Store  │ │  Reporting sinks        │
//! │ Kubernetes/TrueNAS │ │  (copy on commit)│ │  tracing/Prometheus     │
//! └────────────────────┘ └────────┬─────────┘ └─────────────────────────┘
//!                                 │
//!                        ┌────────┴─────────┐
//!                        │    REST API      │
//!                        └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`reconcile`]: correlation, candidate state machine, engine and scheduler
//! - [`store`]: findings store shared with readers
//! - [`sources`]: Kubernetes, TrueNAS and in-memory inventory sources
//! - [`telemetry`]: log and metrics reporting sinks
//! - [`api`]: REST API
//! - [`config`]: YAML configuration
//! - [`domain`]: core records and port traits
//! - [`error`]: error types and classification

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod reconcile;
pub mod sources;
pub mod store;
pub mod telemetry;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use config::{MonitorConfig, ScanConfig, ServerAddrConfig};

pub use domain::ports::{
    InventorySide, InventorySource, InventorySourceRef, KeyDeriver, KeyDeriverRef, KeyScope,
    ReportingSink, ReportingSinkRef, ResourceKind, ResourceRecord,
};

pub use error::{Error, ErrorClass, Result};

pub use reconcile::{
    CandidateState, CycleOutcome, CycleReport, EngineConfig, IdentityCorrelator, OrphanCandidate,
    OrphanSide, ReconciliationEngine, ScanScheduler,
};

pub use sources::{
    DemocraticCsiKeys, KubernetesInventory, KubernetesSourceConfig, MemoryInventory,
    SourceFactory, TrueNasConfig, TrueNasInventory,
};

pub use store::{FindingsSnapshot, FindingsStore};

pub use telemetry::{PrometheusSink, TracingSink};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
