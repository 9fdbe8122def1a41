//! Scan Scheduler
//!
//! Fires scan cycles on a fixed interval and guarantees at most one cycle
//! in flight. A tick that arrives while a cycle is still running is
//! dropped and reported as an overrun; it is never queued.

use crate::error::{Error, Result};
use crate::reconcile::engine::ReconciliationEngine;
use crate::reconcile::events::ScanOverrun;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Clears the in-flight flag when a cycle task ends, even by panic
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic single-flight driver of the reconciliation engine
pub struct ScanScheduler {
    engine: Arc<ReconciliationEngine>,
    scan_interval: Duration,
    cancel: CancellationToken,
    in_flight: Arc<AtomicBool>,
    overruns: AtomicU64,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl ScanScheduler {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        scan_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        if scan_interval.is_zero() {
            return Err(Error::Configuration("scan interval must be positive".into()));
        }

        Ok(Arc::new(Self {
            engine,
            scan_interval,
            cancel,
            in_flight: Arc::new(AtomicBool::new(false)),
            overruns: AtomicU64::new(0),
            current: Mutex::new(None),
        }))
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    /// Whether a cycle is running right now
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Ticks dropped because a cycle was still in flight
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Run the tick loop until cancelled, then wait for the in-flight cycle
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.scan_interval.as_secs(),
            "Starting scan scheduler"
        );

        let mut ticker = interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Scan scheduler shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    match self.trigger_now() {
                        Ok(_) => {}
                        Err(Error::ScanInProgress) => self.record_overrun(),
                        Err(e) => error!(error = %e, "Failed to start scan cycle"),
                    }
                }
            }
        }

        self.wait_for_in_flight().await;
        info!("Scan scheduler stopped");
    }

    /// Start a cycle immediately.
    ///
    /// Returns the id the new cycle will carry, or `Error::ScanInProgress`
    /// if a cycle is already running.
    pub fn trigger_now(&self) -> Result<u64> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ScanInProgress);
        }

        let guard = InFlightGuard(self.in_flight.clone());
        let engine = self.engine.clone();
        let cancel = self.cancel.child_token();
        let cycle_id = engine.cycles_started() + 1;

        let handle = tokio::spawn(async move {
            let _guard = guard;
            match engine.run_cycle(&cancel).await {
                Ok(_) | Err(Error::Cancelled) => {}
                Err(e) => error!(cycle_id, error = %e, "Scan cycle failed"),
            }
        });
        *self.current.lock() = Some(handle);

        Ok(cycle_id)
    }

    /// Cancel the in-flight cycle and stop ticking
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.wait_for_in_flight().await;
    }

    async fn wait_for_in_flight(&self) {
        let handle = self.current.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scan cycle task ended abnormally");
            }
        }
    }

    fn record_overrun(&self) {
        let total_overruns = self.overruns.fetch_add(1, Ordering::Relaxed) + 1;
        let overrun = ScanOverrun {
            at: Utc::now(),
            in_flight_cycle: self.engine.cycles_started(),
            total_overruns,
        };
        warn!(
            in_flight_cycle = overrun.in_flight_cycle,
            total_overruns, "Scan interval elapsed while previous cycle still running; tick dropped"
        );
        self.engine.report_overrun(&overrun);
    }
}
