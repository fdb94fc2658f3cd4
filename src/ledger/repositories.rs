use async_trait::async_trait;

use super::types::{AuditReason, LedgerError, RunReport, TransactionRecord, Watermark};
use crate::registry::Provider;

/// Repository for per-provider watermarks
#[async_trait]
pub trait WatermarkStore: Send + Sync {
	/// Current watermark; zero when the provider has never been reconciled.
	async fn get(&self, provider_key: &str) -> Result<Watermark, LedgerError>;

	/// Overwrite the watermark and append an audit entry. Fails outside `[0, ceiling)`.
	async fn set(
		&self,
		provider_key: &str,
		block: u64,
		reason: AuditReason,
	) -> Result<(), LedgerError>;

	/// Check the stored watermark against `observed_height`, repairing and auditing it if it
	/// cannot be trusted. Returns the watermark to reconcile from.
	async fn validate_and_repair(
		&self,
		provider_key: &str,
		observed_height: u64,
	) -> Result<u64, LedgerError>;
}

/// Repository for the transaction ledger and leaderboard aggregates
#[async_trait]
pub trait LedgerWriter: Send + Sync {
	/// Insert or refresh a provider's identity without touching its statistics.
	async fn upsert_provider(&self, provider: &Provider) -> Result<(), LedgerError>;

	/// Record `transactions`, fold them into the aggregates and advance the watermark to
	/// `new_watermark`, all in one database transaction. Returns how many were new.
	async fn apply(
		&self,
		provider: &Provider,
		transactions: &[TransactionRecord],
		new_watermark: u64,
	) -> Result<usize, LedgerError>;
}

/// Repository for run-level telemetry
#[async_trait]
pub trait RunRecorder: Send + Sync {
	async fn begin_run(&self) -> Result<i64, LedgerError>;
	async fn finish_run(&self, run_id: i64, report: &RunReport) -> Result<(), LedgerError>;
}
