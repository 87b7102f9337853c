pub mod adherence; // Reconciler: taken/skipped reports against due doses
pub mod clock;
pub mod compartments; // Pillbox compartment model
pub mod config;
pub mod db;
pub mod detection; // Missed-dose scan + background scanner
pub mod engine; // Facade over per-user partitions
pub mod error;
pub mod ledger; // Occurrence materialization
pub mod models;
pub mod notify; // Caregiver notification dispatch
pub mod schedule; // Recurrence rule evaluation

pub use config::{EngineConfig, GraceWindow, StorageLocation};
pub use detection::{start_scanner, DetectorHandle, ScanReport};
pub use engine::AdherenceEngine;
pub use error::EngineError;
pub use ledger::CancelToken;

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` wins over the default
/// filter. Calling it again is a no-op.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Mediwatch engine v{}", config::APP_VERSION);
    }
}
