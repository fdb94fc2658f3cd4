use rusqlite::types::Value;
use serde::Serialize;

use crate::indexer::TokenTransfer;
use crate::registry::Provider;

/// Per-provider reconciliation checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
	/// Highest block fully reconciled for the provider (inclusive).
	pub last_processed_block: u64,
	/// Highest block among transactions actually recorded for the provider.
	pub last_transaction_block: Option<u64>,
}

/// A block number known to lie in `[0, ceiling)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockHeight(u64);

impl BlockHeight {
	pub fn new(value: u64, ceiling: u64) -> Result<Self, LedgerError> {
		if value >= ceiling {
			return Err(LedgerError::WatermarkOutOfRange { value, ceiling });
		}
		Ok(Self(value))
	}

	pub fn get(self) -> u64 {
		self.0
	}

	pub(crate) fn as_sql(self) -> i64 {
		// Ceilings are far below i64::MAX.
		self.0 as i64
	}
}

/// The stored watermark column as it actually exists on disk, before any trust is placed in it.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredBlock {
	Missing,
	Integer(i64),
	Text(String),
	Other(String),
}

impl StoredBlock {
	pub fn from_sql(value: Value) -> Self {
		match value {
			Value::Null => StoredBlock::Missing,
			Value::Integer(i) => StoredBlock::Integer(i),
			Value::Text(s) => StoredBlock::Text(s),
			Value::Real(f) => StoredBlock::Other(f.to_string()),
			Value::Blob(b) => StoredBlock::Other(format!("<{} byte blob>", b.len())),
		}
	}

	/// The non-negative integer this representation denotes, if any.
	pub fn numeric(&self) -> Option<u64> {
		match self {
			StoredBlock::Missing => Some(0),
			StoredBlock::Integer(i) => u64::try_from(*i).ok(),
			StoredBlock::Text(s) => s.trim().parse::<u64>().ok(),
			StoredBlock::Other(_) => None,
		}
	}

	pub fn describe(&self) -> String {
		match self {
			StoredBlock::Missing => "none".to_string(),
			StoredBlock::Integer(i) => i.to_string(),
			StoredBlock::Text(s) => format!("'{}'", s),
			StoredBlock::Other(s) => s.clone(),
		}
	}
}

/// Why a watermark changed; persisted verbatim in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditReason {
	/// Normal advance after a committed reconciliation.
	Advance,
	/// Value was one digit too long and has been divided by ten.
	MagnitudeCorrection,
	/// Reset to the highest block with a recorded transaction.
	LedgerFallback,
	/// Nothing trustworthy left; start over from genesis.
	ResetToZero,
	/// Numeric text rewritten as an integer.
	Retyped,
	/// Explicit reset requested by an operator.
	OperatorRepair,
}

impl AuditReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			AuditReason::Advance => "advance",
			AuditReason::MagnitudeCorrection => "magnitude_correction",
			AuditReason::LedgerFallback => "ledger_fallback",
			AuditReason::ResetToZero => "reset_to_zero",
			AuditReason::Retyped => "retyped",
			AuditReason::OperatorRepair => "operator_repair",
		}
	}
}

/// One row of the append-only watermark audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
	pub provider_key: String,
	pub old_value: String,
	pub new_value: u64,
	pub reason: String,
	pub recorded_at: String,
}

/// A validated incoming transfer attributed to a provider and a registered sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
	pub tx_hash: String,
	pub block_number: u64,
	pub timestamp: i64,
	pub from_address: String,
	pub from_display_name: String,
	pub to_address: String,
	/// Namehash of the receiving provider entry.
	pub provider_key: String,
	pub provider_id: String,
	pub provider_entry_name: String,
	/// Amount in the token's smallest unit.
	pub value_raw: u128,
	pub gas_used: u64,
}

impl TransactionRecord {
	pub fn from_transfer(transfer: TokenTransfer, provider: &Provider, sender_name: &str) -> Self {
		Self {
			tx_hash: transfer.tx_hash,
			block_number: transfer.block_number,
			timestamp: transfer.timestamp,
			from_address: transfer.from_address,
			from_display_name: sender_name.to_string(),
			to_address: transfer.to_address,
			provider_key: provider.namehash.clone(),
			provider_id: provider.provider_id.clone(),
			provider_entry_name: provider.display_name.clone(),
			value_raw: transfer.value,
			gas_used: transfer.gas_used,
		}
	}
}

/// Aggregate payment statistics for one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeaderboardStats {
	pub total_received: u128,
	pub transaction_count: u64,
	pub unique_sender_count: u64,
	pub first_transaction_at: Option<i64>,
	pub last_transaction_at: Option<i64>,
}

/// A provider row of the leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
	pub namehash: String,
	pub display_name: String,
	pub provider_id: String,
	pub wallet_address: String,
	pub stats: LeaderboardStats,
}

/// Stored aggregates that disagree with a recomputation from the transaction records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardMismatch {
	pub namehash: String,
	pub display_name: String,
	pub stored: LeaderboardStats,
	pub recomputed: LeaderboardStats,
}

/// Terminal state of one reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
	Succeeded,
	PartiallyFailed,
	Failed,
}

impl RunStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			RunStatus::Succeeded => "succeeded",
			RunStatus::PartiallyFailed => "partially_failed",
			RunStatus::Failed => "failed",
		}
	}
}

/// Outcome of one run as reported to operators and persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
	pub status: RunStatus,
	pub providers_processed: usize,
	pub providers_skipped: usize,
	pub providers_failed: usize,
	pub transactions_added: usize,
	pub error: Option<String>,
}

/// Cumulative run counters kept between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCounters {
	pub runs_attempted: u64,
	pub runs_succeeded: u64,
	pub runs_failed: u64,
	pub last_error: Option<String>,
	pub last_run_at: Option<String>,
}

/// Errors raised by the ledger store
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
	#[error("Database error: {0}")]
	DatabaseError(#[from] rusqlite::Error),

	#[error("Watermark {value} outside sane range [0, {ceiling})")]
	WatermarkOutOfRange { value: u64, ceiling: u64 },

	#[error("Watermark for {provider} would move backwards from {current} to {requested}")]
	WatermarkRegression {
		provider: String,
		current: u64,
		requested: u64,
	},

	#[error("Stored watermark for {provider} is corrupt: {raw}")]
	CorruptWatermark { provider: String, raw: String },

	#[error("Provider {0} is not registered in the leaderboard")]
	ProviderNotRegistered(String),

	#[error("Transaction {0} belongs to a different provider")]
	ForeignTransaction(String),

	#[error("Value of transaction {0} does not fit the ledger")]
	ValueOverflow(String),

	#[error("Ledger connection lock poisoned")]
	LockPoisoned,
}
