//! Background missed-dose scanner.
//!
//! Spawns a thread that runs [`AdherenceEngine::scan_all`] once at start
//! and then every `scan_interval`. Scans are idempotent, so a tick that
//! overlaps a request-path scan costs nothing but the query.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::AdherenceEngine;

/// Sleep granularity for shutdown responsiveness.
const SLEEP_GRANULARITY: Duration = Duration::from_millis(50);

/// Handle for the scanner thread. Dropping it stops and joins the thread.
pub struct DetectorHandle {
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl DetectorHandle {
    /// Request shutdown. A scan in progress completes first.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

pub fn start_scanner(engine: Arc<AdherenceEngine>) -> DetectorHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    let handle = std::thread::spawn(move || {
        let interval = engine.config().scan_interval;
        tracing::info!(interval_ms = interval.as_millis() as u64, "missed-dose scanner started");
        scanner_loop(&engine, interval, &flag);
        tracing::info!("missed-dose scanner stopped");
    });

    DetectorHandle {
        shutdown,
        handle: Some(handle),
    }
}

fn scanner_loop(engine: &AdherenceEngine, interval: Duration, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        run_scan(engine);

        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            std::thread::sleep(SLEEP_GRANULARITY.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

fn run_scan(engine: &AdherenceEngine) {
    let results = match engine.scan_all() {
        Ok(results) => results,
        Err(e) => {
            tracing::error!(error = %e, "missed-dose scan could not start");
            return;
        }
    };
    for (user_id, result) in results {
        match result {
            Ok(report) if report.missed.is_empty() && report.due.is_empty() => {
                tracing::debug!(%user_id, materialized = report.materialized, "scan: nothing new");
            }
            Ok(report) => tracing::info!(
                %user_id,
                due = report.due.len(),
                missed = report.missed.len(),
                notifications = report.notifications.len(),
                "scan complete"
            ),
            Err(e) => tracing::warn!(%user_id, error = %e, "scan failed"),
        }
    }
}
