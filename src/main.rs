//! Storage Orphan Monitor
//!
//! Periodically reconciles Kubernetes storage objects against a TrueNAS
//! backend, exposing findings over REST, Prometheus and structured logs.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_orphan_monitor::{
    ApiServer, ApiServerConfig, CycleOutcome, Error, FindingsStore, MonitorConfig,
    PrometheusSink, ReconciliationEngine, Result, ScanScheduler, ServerAddrConfig,
    SourceFactory, TracingSink,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Orphan Monitor - orphaned volume and snapshot detection
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, short, env = "MONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single scan cycle, print its report and exit
    #[arg(long)]
    once: bool,

    /// REST API bind address
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Seconds between scan cycles
    #[arg(long, env = "SCAN_INTERVAL_SECS")]
    scan_interval_secs: Option<u64>,

    /// Only list claims in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// TrueNAS base URL
    #[arg(long, env = "TRUENAS_URL")]
    truenas_url: Option<String>,

    /// TrueNAS API key
    #[arg(long, env = "TRUENAS_API_KEY", hide_env_values = true)]
    truenas_api_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Command-line values win over the configuration file
    fn apply(&self, config: &mut MonitorConfig) {
        if let Some(secs) = self.scan_interval_secs {
            config.scan.scan_interval_secs = secs;
        }
        if let Some(namespace) = &self.namespace {
            config.kubernetes.namespace = Some(namespace.clone());
        }
        if let Some(url) = &self.truenas_url {
            config.truenas.url = url.clone();
        }
        if let Some(key) = &self.truenas_api_key {
            config.truenas.api_key = Some(key.clone());
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config =
        MonitorConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    info!("Starting Storage Orphan Monitor");
    info!("  Version: {}", storage_orphan_monitor::VERSION);
    info!("  Scan interval: {}s", config.scan.scan_interval_secs);
    info!("  TrueNAS: {}", config.truenas.url);

    let deriver = SourceFactory::deriver(&config.scan.key_convention)?;
    let cluster = SourceFactory::cluster(config.kubernetes.clone(), deriver.clone())
        .await
        .context("failed to connect to Kubernetes")?;
    let backend = SourceFactory::backend(config.truenas.clone(), deriver)?;

    let engine = ReconciliationEngine::new(
        config.scan.engine_config(),
        cluster,
        backend,
        FindingsStore::new(),
    )?;
    engine.add_sink(Arc::new(TracingSink));
    engine.add_sink(Arc::new(PrometheusSink::register_default()?));

    let cancel = CancellationToken::new();

    if args.once {
        let report = engine.run_cycle(&cancel).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if report.outcome != CycleOutcome::Committed {
            anyhow::bail!("scan cycle ended {}", report.outcome);
        }
        return Ok(());
    }

    let health_addr = resolve_addr(args.health_addr.as_deref(), &config.health, "0.0.0.0:8081")?;
    let health_engine = engine.clone();
    let health_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_engine, health_cancel).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr =
        resolve_addr(args.metrics_addr.as_deref(), &config.metrics, "0.0.0.0:8080")?;
    let metrics_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics_cancel).await {
            error!("Metrics server error: {}", e);
        }
    });

    let scheduler = ScanScheduler::new(engine, config.scan.scan_interval(), cancel.clone())?;
    let scheduler_task = tokio::spawn(scheduler.clone().run());

    let api_config = ApiServerConfig {
        rest_addr: resolve_addr(args.api_addr.as_deref(), &config.api, "0.0.0.0:8090")?,
    };
    let api_server = ApiServer::new(api_config, scheduler.clone(), cancel.clone());
    let api_task = tokio::spawn(async move { api_server.run().await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    cancel.cancel();
    scheduler.shutdown().await;
    if let Err(e) = scheduler_task.await {
        error!("Scheduler task failed: {}", e);
    }
    match api_task.await {
        Ok(Err(e)) => error!("REST server error: {}", e),
        Err(e) => error!("REST server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Monitor shutdown complete");
    Ok(())
}

/// Flag, then config file, then built-in default
fn resolve_addr(flag: Option<&str>, config: &ServerAddrConfig, default: &str) -> Result<SocketAddr> {
    let raw = flag.or(config.addr.as_deref()).unwrap_or(default);
    raw.parse()
        .map_err(|e| Error::Configuration(format!("Invalid bind address {}: {}", raw, e)))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

/// Ready once the first scan cycle has finished, whatever its outcome
async fn run_health_server(
    addr: SocketAddr,
    engine: Arc<ReconciliationEngine>,
    cancel: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let engine = engine.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = engine.store().last_report().is_some();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => {
                            text_response(StatusCode::SERVICE_UNAVAILABLE, "no scan completed")
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);
    server
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            response.headers_mut().insert(
                                CONTENT_TYPE,
                                HeaderValue::from_static(prometheus::TEXT_FORMAT),
                            );
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                        }
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    server
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
