//! REST API Handlers
//!
//! Read-only views of the findings store plus an on-demand scan trigger
//! that honours the scheduler's single-flight rule.

use crate::error::Error;
use crate::reconcile::candidate::{CandidateState, OrphanCandidate, OrphanSide};
use crate::reconcile::events::{CycleOutcome, CyclePhase, CycleReport};
use crate::reconcile::scheduler::ScanScheduler;
use crate::reconcile::usage::{UsageDrift, UsageSummary};
use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Filters for `GET /v1/orphans`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrphanQuery {
    /// `cluster_only` or `backend_only`
    pub side: Option<String>,
    /// `candidate`, `confirmed` or `resolved`
    pub state: Option<String>,
}

/// Monitor status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub version: String,
    pub phase: CyclePhase,
    pub generation: u64,
    pub committed_at: Option<DateTime<Utc>>,
    pub cycles_started: u64,
    pub scan_interval_secs: u64,
    pub scan_running: bool,
    pub overruns: u64,
    pub active_candidates: usize,
    pub confirmed_orphans: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle: Option<CycleReport>,
}

/// Latest committed usage with drift against the committed cycle before it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    pub usage: UsageSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<UsageDrift>,
}

/// Accepted on-demand scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanAccepted {
    pub cycle_id: u64,
    pub status: String,
}

/// Source reachability for `/ready`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub ready: bool,
    pub sources: BTreeMap<String, bool>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiErrorResponse {
    fn new(error: &str, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            error: error.into(),
            message: message.into(),
            details: None,
        })
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    scheduler: Arc<ScanScheduler>,
}

impl RestRouter {
    pub fn new(scheduler: Arc<ScanScheduler>) -> Self {
        Self { scheduler }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            scheduler: self.scheduler,
        };

        Router::new()
            .route("/v1/findings", get(get_findings))
            .route("/v1/orphans", get(list_orphans))
            .route("/v1/status", get(get_status))
            .route("/v1/usage", get(get_usage))
            .route("/v1/scans", post(trigger_scan))
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    scheduler: Arc<ScanScheduler>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Full snapshot of the current generation
async fn get_findings(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.scheduler.engine().store().snapshot();
    (StatusCode::OK, Json((*snapshot).clone()))
}

/// Candidates filtered by side and state
async fn list_orphans(
    State(state): State<AppState>,
    Query(query): Query<OrphanQuery>,
) -> impl IntoResponse {
    let side = match query.side.as_deref().map(str::parse::<OrphanSide>).transpose() {
        Ok(side) => side,
        Err(message) => {
            return (
                StatusCode::BAD_REQUEST,
                ApiErrorResponse::new("invalid_side", message),
            )
                .into_response()
        }
    };
    let candidate_state = match query
        .state
        .as_deref()
        .map(str::parse::<CandidateState>)
        .transpose()
    {
        Ok(s) => s,
        Err(message) => {
            return (
                StatusCode::BAD_REQUEST,
                ApiErrorResponse::new("invalid_state", message),
            )
                .into_response()
        }
    };

    let snapshot = state.scheduler.engine().store().snapshot();
    let orphans: Vec<OrphanCandidate> =
        snapshot.filter(side, candidate_state).cloned().collect();
    debug!(count = orphans.len(), "Listing orphans");

    (StatusCode::OK, Json(orphans)).into_response()
}

/// Scheduler, engine and store status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.scheduler.engine();
    let snapshot = engine.store().snapshot();

    (
        StatusCode::OK,
        Json(StatusResponse {
            version: crate::VERSION.to_string(),
            phase: engine.phase(),
            generation: snapshot.generation,
            committed_at: snapshot.committed_at,
            cycles_started: engine.cycles_started(),
            scan_interval_secs: state.scheduler.scan_interval().as_secs(),
            scan_running: state.scheduler.is_running(),
            overruns: state.scheduler.overruns(),
            active_candidates: snapshot.active_count(),
            confirmed_orphans: snapshot.count_in_state(CandidateState::Confirmed),
            last_cycle: engine.store().last_report().as_deref().cloned(),
        }),
    )
}

/// Usage of the latest committed generation
async fn get_usage(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.scheduler.engine().store();
    let snapshot = store.snapshot();

    let Some(usage) = snapshot.usage.clone() else {
        return (
            StatusCode::NOT_FOUND,
            ApiErrorResponse::new("no_usage", "No scan has been committed yet"),
        )
            .into_response();
    };

    let drift = store
        .last_report()
        .filter(|r| r.outcome == CycleOutcome::Committed && r.generation == usage.generation)
        .and_then(|r| r.drift.clone());

    (StatusCode::OK, Json(UsageResponse { usage, drift })).into_response()
}

/// Start a scan cycle now
async fn trigger_scan(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.trigger_now() {
        Ok(cycle_id) => {
            info!(cycle_id, "On-demand scan started");
            (
                StatusCode::ACCEPTED,
                Json(ScanAccepted {
                    cycle_id,
                    status: "started".into(),
                }),
            )
                .into_response()
        }
        Err(Error::ScanInProgress) => (
            StatusCode::CONFLICT,
            ApiErrorResponse::new("scan_in_progress", Error::ScanInProgress.to_string()),
        )
            .into_response(),
        Err(e) if e.is_transient() => (
            StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorResponse::new("scan_unavailable", e.to_string()),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorResponse::new("internal_error", e.to_string()),
        )
            .into_response(),
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Ready when both inventory sources answer their health checks
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let sources = state.scheduler.engine().sources_health().await;
    let ready = sources.values().all(|up| *up);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(ReadinessResponse { ready, sources }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::InventorySide;
    use crate::reconcile::engine::{EngineConfig, ReconciliationEngine};
    use crate::reconcile::test_support::{backend_volume, cluster_volume};
    use crate::sources::MemoryInventory;
    use crate::store::FindingsStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct Fixture {
        scheduler: Arc<ScanScheduler>,
        cluster: Arc<MemoryInventory>,
        backend: Arc<MemoryInventory>,
    }

    fn fixture() -> Fixture {
        let cluster = MemoryInventory::new(InventorySide::Cluster, "kubernetes");
        let backend = MemoryInventory::new(InventorySide::Backend, "truenas");
        cluster.set_records(vec![cluster_volume("pv-a", "k1"), cluster_volume("pv-b", "k2")]);
        backend.set_records(vec![backend_volume("tank/k8s/k1", "k1")]);

        let config = EngineConfig {
            min_consecutive_observations: 1,
            min_orphan_age: Duration::ZERO,
            fetch_timeout: Duration::from_secs(5),
            snapshot_retention: Duration::ZERO,
        };
        let engine =
            ReconciliationEngine::new(config, cluster.clone(), backend.clone(), FindingsStore::new())
                .unwrap();
        let scheduler =
            ScanScheduler::new(engine, Duration::from_secs(300), CancellationToken::new()).unwrap();

        Fixture {
            scheduler,
            cluster,
            backend,
        }
    }

    fn router(f: &Fixture) -> Router {
        RestRouter::new(f.scheduler.clone()).build()
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    async fn committed_cycle(f: &Fixture) {
        f.scheduler
            .engine()
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_health() {
        let f = fixture();
        let (status, _) = call(router(&f), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_before_first_scan() {
        let f = fixture();
        let (status, body) = call(router(&f), "GET", "/v1/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["generation"], 0);
        assert_eq!(body["phase"], "idle");
        assert_eq!(body["scanIntervalSecs"], 300);
        assert!(body.get("lastCycle").is_none());

        let (status, body) = call(router(&f), "GET", "/v1/usage").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "no_usage");
    }

    #[tokio::test]
    async fn test_findings_and_orphans_after_cycle() {
        let f = fixture();
        committed_cycle(&f).await;

        let (status, body) = call(router(&f), "GET", "/v1/findings").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["generation"], 1);
        assert_eq!(body["candidates"]["volume:k2"]["state"], "confirmed");

        let (status, body) =
            call(router(&f), "GET", "/v1/orphans?side=cluster_only&state=confirmed").await;
        assert_eq!(status, StatusCode::OK);
        let orphans = body.as_array().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0]["nativeId"], "pv-b");

        let (_, body) = call(router(&f), "GET", "/v1/orphans?side=backend_only").await;
        assert!(body.as_array().unwrap().is_empty());

        let (status, body) = call(router(&f), "GET", "/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["confirmedOrphans"], 1);
        // Confirmed orphans are still active candidates
        assert_eq!(body["activeCandidates"], 1);
        assert_eq!(body["activeCandidates"], body["lastCycle"]["activeCandidates"]);
        assert_eq!(body["lastCycle"]["outcome"], "committed");

        let (status, body) = call(router(&f), "GET", "/v1/usage").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["usage"]["generation"], 1);
    }

    #[tokio::test]
    async fn test_orphans_rejects_bad_filters() {
        let f = fixture();
        let (status, body) = call(router(&f), "GET", "/v1/orphans?side=sideways").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_side");

        let (status, body) = call(router(&f), "GET", "/v1/orphans?state=gone").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_state");
    }

    #[tokio::test]
    async fn test_trigger_scan_single_flight() {
        let f = fixture();
        f.backend.set_delay(Some(Duration::from_secs(60)));

        let (status, body) = call(router(&f), "POST", "/v1/scans").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["cycleId"], 1);

        let (status, body) = call(router(&f), "POST", "/v1/scans").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "scan_in_progress");

        f.scheduler.shutdown().await;
        assert!(!f.scheduler.is_running());

        let (status, body) = call(router(&f), "POST", "/v1/scans").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "scan_unavailable");
    }

    #[tokio::test]
    async fn test_readiness_follows_sources() {
        let f = fixture();
        let (status, body) = call(router(&f), "GET", "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sources"]["truenas"], true);

        f.cluster.fail_with("apiserver unreachable");
        let (status, body) = call(router(&f), "GET", "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);
        assert_eq!(body["sources"]["kubernetes"], false);
    }
}
