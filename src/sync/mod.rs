//! Provider leaderboard synchronization.
//!
//! This module holds the reconciliation logic that turns upstream token transfers into ledger
//! entries:
//!
//! - `engine`: decides, per provider, which block range to scan, which transfers count and how
//!   far the watermark may advance. The decision itself is pure.
//! - `progress_tracker`: run-level counters, progress logging and the final report.
//! - `orchestrator`: wires the registry, the height oracle, the engine and the ledger together
//!   for one run (or repeatedly in daemon mode), isolating per-provider failures.

/// Per-provider reconciliation decision
pub mod engine;
/// Main coordinator for a reconciliation run
pub mod orchestrator;
/// Tracks run progress and statistics
pub mod progress_tracker;

pub use engine::ReconciliationEngine;
pub use orchestrator::{OrchestratorConfig, RunOrchestrator};

use crate::config::ConfigError;
use crate::indexer::IndexerError;
use crate::ledger::LedgerError;
use crate::registry::RegistryError;

/// Errors raised while reconciling
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Indexer error: {0}")]
    IndexerError(#[from] IndexerError),

    #[error("Registry error: {0}")]
    RegistryError(#[from] RegistryError),

    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),
}
