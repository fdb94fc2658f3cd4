//! Persistent ledger: watermarks with their audit trail, validated transactions, leaderboard
//! aggregates and run history, all in one SQLite database.

/// Repository traits the sync layer depends on
mod repositories;
/// The authoritative schema
mod schema;
/// SQLite-backed implementation
mod store;
/// Ledger types and errors
mod types;
/// Watermark validation rules
mod watermark;

pub use repositories::{LedgerWriter, RunRecorder, WatermarkStore};
pub use store::SqliteLedgerStore;
pub use types::*;
pub use watermark::WatermarkPolicy;
