//! The ledger schema. Every statement is idempotent so it runs on each start.

use rusqlite::Connection;
use tracing::{debug, info};

use super::types::LedgerError;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS providers (
	namehash TEXT PRIMARY KEY,
	display_name TEXT NOT NULL,
	provider_id TEXT NOT NULL,
	wallet_address TEXT NOT NULL,
	total_received INTEGER NOT NULL DEFAULT 0,
	transaction_count INTEGER NOT NULL DEFAULT 0,
	unique_sender_count INTEGER NOT NULL DEFAULT 0,
	first_transaction_at INTEGER,
	last_transaction_at INTEGER,
	created_at TEXT NOT NULL,
	updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_providers_wallet ON providers (wallet_address);

CREATE TABLE IF NOT EXISTS transactions (
	tx_hash TEXT PRIMARY KEY,
	block_number INTEGER NOT NULL,
	timestamp INTEGER NOT NULL,
	from_address TEXT NOT NULL,
	from_display_name TEXT NOT NULL,
	to_address TEXT NOT NULL,
	provider_key TEXT NOT NULL,
	provider_id TEXT NOT NULL,
	provider_entry_name TEXT NOT NULL,
	value_raw INTEGER NOT NULL,
	gas_used INTEGER NOT NULL,
	recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_provider_block
	ON transactions (provider_key, block_number);
CREATE INDEX IF NOT EXISTS idx_transactions_provider_sender
	ON transactions (provider_key, from_address);

CREATE TABLE IF NOT EXISTS watermarks (
	provider_key TEXT PRIMARY KEY,
	last_processed_block INTEGER NOT NULL DEFAULT 0,
	last_transaction_block INTEGER,
	updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS watermark_audit (
	id INTEGER PRIMARY KEY AUTOINCREMENT,
	provider_key TEXT NOT NULL,
	old_value TEXT NOT NULL,
	new_value INTEGER NOT NULL,
	reason TEXT NOT NULL,
	recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_runs (
	id INTEGER PRIMARY KEY AUTOINCREMENT,
	started_at TEXT NOT NULL,
	finished_at TEXT,
	status TEXT NOT NULL DEFAULT 'running',
	providers_processed INTEGER NOT NULL DEFAULT 0,
	providers_skipped INTEGER NOT NULL DEFAULT 0,
	providers_failed INTEGER NOT NULL DEFAULT 0,
	transactions_added INTEGER NOT NULL DEFAULT 0,
	error TEXT
);

CREATE TABLE IF NOT EXISTS sync_status (
	id INTEGER PRIMARY KEY CHECK (id = 1),
	runs_attempted INTEGER NOT NULL DEFAULT 0,
	runs_succeeded INTEGER NOT NULL DEFAULT 0,
	runs_failed INTEGER NOT NULL DEFAULT 0,
	last_error TEXT,
	last_run_at TEXT
);

INSERT OR IGNORE INTO sync_status (id) VALUES (1);
"#;

/// Create any missing tables and switch file databases to WAL.
pub fn initialize(conn: &Connection) -> Result<(), LedgerError> {
	let journal_mode: String =
		conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
	debug!("Ledger journal mode: {}", journal_mode);

	conn.execute_batch(SCHEMA)?;
	info!("Ledger schema ready");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn initialize_is_idempotent() {
		let conn = Connection::open_in_memory().unwrap();
		initialize(&conn).unwrap();
		initialize(&conn).unwrap();

		let status_rows: i64 = conn
			.query_row("SELECT COUNT(*) FROM sync_status", [], |row| row.get(0))
			.unwrap();
		assert_eq!(status_rows, 1);
	}
}
