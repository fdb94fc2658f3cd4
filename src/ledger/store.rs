//! SQLite implementation of the watermark store, ledger writer and run recorder.
//!
//! One connection is owned by the store. Every mutation that touches a watermark runs in a
//! single SQLite transaction together with its audit entry and, for [`LedgerWriter::apply`],
//! with the transaction inserts and aggregate update it belongs to.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use itertools::Itertools;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use super::repositories::{LedgerWriter, RunRecorder, WatermarkStore};
use super::schema;
use super::types::*;
use super::watermark::WatermarkPolicy;
use crate::registry::Provider;

fn now() -> String {
	chrono::Utc::now().to_rfc3339()
}

/// Ledger database holding providers, transactions, watermarks and run history.
pub struct SqliteLedgerStore {
	conn: Mutex<Connection>,
	policy: WatermarkPolicy,
}

impl SqliteLedgerStore {
	/// Open (or create) the ledger at `path` and make sure the schema exists.
	pub fn open(path: impl AsRef<Path>, policy: WatermarkPolicy) -> Result<Self, LedgerError> {
		let conn = Connection::open(path.as_ref())?;
		schema::initialize(&conn)?;
		info!("Opened ledger at {:?}", path.as_ref());
		Ok(Self {
			conn: Mutex::new(conn),
			policy,
		})
	}

	/// Ledger that lives only as long as the process.
	pub fn in_memory(policy: WatermarkPolicy) -> Result<Self, LedgerError> {
		let conn = Connection::open_in_memory()?;
		schema::initialize(&conn)?;
		Ok(Self {
			conn: Mutex::new(conn),
			policy,
		})
	}

	fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
		self.conn.lock().map_err(|_| LedgerError::LockPoisoned)
	}

	fn read_stored(
		conn: &Connection,
		provider_key: &str,
	) -> Result<(StoredBlock, Option<u64>), LedgerError> {
		let row = conn
			.query_row(
				"SELECT last_processed_block, last_transaction_block FROM watermarks WHERE provider_key = ?1",
				params![provider_key],
				|row| Ok((row.get::<_, Value>(0)?, row.get::<_, Value>(1)?)),
			)
			.optional()?;

		Ok(match row {
			None => (StoredBlock::Missing, None),
			Some((processed, last_tx)) => {
				let last_tx = match StoredBlock::from_sql(last_tx) {
					StoredBlock::Missing => None,
					other => other.numeric(),
				};
				(StoredBlock::from_sql(processed), last_tx)
			}
		})
	}

	fn ledger_max_block(conn: &Connection, provider_key: &str) -> Result<Option<u64>, LedgerError> {
		let max: Option<i64> = conn.query_row(
			"SELECT MAX(block_number) FROM transactions WHERE provider_key = ?1",
			params![provider_key],
			|row| row.get(0),
		)?;
		Ok(max.and_then(|b| u64::try_from(b).ok()))
	}

	fn write_watermark(
		conn: &Connection,
		provider_key: &str,
		block: BlockHeight,
		last_transaction_block: Option<u64>,
		old_value: &str,
		reason: AuditReason,
	) -> Result<(), LedgerError> {
		let recorded_at = now();
		conn.execute(
			r#"
			INSERT INTO watermarks (provider_key, last_processed_block, last_transaction_block, updated_at)
			VALUES (?1, ?2, ?3, ?4)
			ON CONFLICT(provider_key) DO UPDATE SET
				last_processed_block = excluded.last_processed_block,
				last_transaction_block = excluded.last_transaction_block,
				updated_at = excluded.updated_at
			"#,
			params![
				provider_key,
				block.as_sql(),
				last_transaction_block.map(|b| b as i64),
				recorded_at
			],
		)?;
		conn.execute(
			"INSERT INTO watermark_audit (provider_key, old_value, new_value, reason, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
			params![provider_key, old_value, block.as_sql(), reason.as_str(), recorded_at],
		)?;
		Ok(())
	}

	fn trusted_block(&self, provider_key: &str, stored: &StoredBlock) -> Result<u64, LedgerError> {
		stored
			.numeric()
			.filter(|block| *block < self.policy.sanity_ceiling)
			.ok_or_else(|| LedgerError::CorruptWatermark {
				provider: provider_key.to_string(),
				raw: stored.describe(),
			})
	}

	fn stats_from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<LeaderboardStats> {
		Ok(LeaderboardStats {
			total_received: row.get::<_, i64>(offset)?.max(0) as u128,
			transaction_count: row.get::<_, i64>(offset + 1)?.max(0) as u64,
			unique_sender_count: row.get::<_, i64>(offset + 2)?.max(0) as u64,
			first_transaction_at: row.get(offset + 3)?,
			last_transaction_at: row.get(offset + 4)?,
		})
	}

	fn recompute_with(conn: &Connection, provider_key: &str) -> Result<LeaderboardStats, LedgerError> {
		Ok(conn.query_row(
			r#"
			SELECT COALESCE(SUM(value_raw), 0), COUNT(*), COUNT(DISTINCT from_address),
				MIN(timestamp), MAX(timestamp)
			FROM transactions WHERE provider_key = ?1
			"#,
			params![provider_key],
			|row| Self::stats_from_row(row, 0),
		)?)
	}

	/// Aggregates for one provider rebuilt from its transaction records.
	pub fn recompute_leaderboard(&self, provider_key: &str) -> Result<LeaderboardStats, LedgerError> {
		let conn = self.lock()?;
		Self::recompute_with(&conn, provider_key)
	}

	/// Leaderboard ordered by total received, largest first.
	pub fn leaderboard(&self) -> Result<Vec<LeaderboardEntry>, LedgerError> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare(
			r#"
			SELECT namehash, display_name, provider_id, wallet_address,
				total_received, transaction_count, unique_sender_count,
				first_transaction_at, last_transaction_at
			FROM providers
			ORDER BY total_received DESC, display_name ASC
			"#,
		)?;
		let entries = stmt
			.query_map([], |row| {
				Ok(LeaderboardEntry {
					namehash: row.get(0)?,
					display_name: row.get(1)?,
					provider_id: row.get(2)?,
					wallet_address: row.get(3)?,
					stats: Self::stats_from_row(row, 4)?,
				})
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(entries)
	}

	/// Compare every stored aggregate with a recomputation and return the disagreements.
	pub fn verify_leaderboard(&self) -> Result<Vec<LeaderboardMismatch>, LedgerError> {
		let entries = self.leaderboard()?;
		let conn = self.lock()?;
		let mut mismatches = Vec::new();
		for entry in entries {
			let recomputed = Self::recompute_with(&conn, &entry.namehash)?;
			if recomputed != entry.stats {
				warn!(
					"Aggregates for {} disagree with transaction records",
					entry.display_name
				);
				mismatches.push(LeaderboardMismatch {
					namehash: entry.namehash,
					display_name: entry.display_name,
					stored: entry.stats,
					recomputed,
				});
			}
		}
		Ok(mismatches)
	}

	/// Audit trail of one provider's watermark, oldest first.
	pub fn audit_trail(&self, provider_key: &str) -> Result<Vec<AuditEntry>, LedgerError> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare(
			r#"
			SELECT provider_key, old_value, new_value, reason, recorded_at
			FROM watermark_audit WHERE provider_key = ?1 ORDER BY id
			"#,
		)?;
		let entries = stmt
			.query_map(params![provider_key], |row| {
				Ok(AuditEntry {
					provider_key: row.get(0)?,
					old_value: row.get(1)?,
					new_value: row.get::<_, i64>(2)?.max(0) as u64,
					reason: row.get(3)?,
					recorded_at: row.get(4)?,
				})
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(entries)
	}

	pub fn run_counters(&self) -> Result<RunCounters, LedgerError> {
		let conn = self.lock()?;
		Ok(conn.query_row(
			"SELECT runs_attempted, runs_succeeded, runs_failed, last_error, last_run_at FROM sync_status WHERE id = 1",
			[],
			|row| {
				Ok(RunCounters {
					runs_attempted: row.get::<_, i64>(0)?.max(0) as u64,
					runs_succeeded: row.get::<_, i64>(1)?.max(0) as u64,
					runs_failed: row.get::<_, i64>(2)?.max(0) as u64,
					last_error: row.get(3)?,
					last_run_at: row.get(4)?,
				})
			},
		)?)
	}
}

#[async_trait]
impl WatermarkStore for SqliteLedgerStore {
	async fn get(&self, provider_key: &str) -> Result<Watermark, LedgerError> {
		let conn = self.lock()?;
		let (stored, last_transaction_block) = Self::read_stored(&conn, provider_key)?;
		let last_processed_block = self.trusted_block(provider_key, &stored)?;
		Ok(Watermark {
			last_processed_block,
			last_transaction_block,
		})
	}

	async fn set(
		&self,
		provider_key: &str,
		block: u64,
		reason: AuditReason,
	) -> Result<(), LedgerError> {
		let block = BlockHeight::new(block, self.policy.sanity_ceiling)?;
		let mut conn = self.lock()?;
		let tx = conn.transaction()?;
		let (stored, last_transaction_block) = Self::read_stored(&tx, provider_key)?;
		Self::write_watermark(
			&tx,
			provider_key,
			block,
			last_transaction_block,
			&stored.describe(),
			reason,
		)?;
		tx.commit()?;

		info!(
			"Watermark for {} set from {} to {} ({})",
			provider_key,
			stored.describe(),
			block.get(),
			reason.as_str()
		);
		Ok(())
	}

	async fn validate_and_repair(
		&self,
		provider_key: &str,
		observed_height: u64,
	) -> Result<u64, LedgerError> {
		let mut conn = self.lock()?;
		let tx = conn.transaction()?;
		let (stored, last_transaction_block) = Self::read_stored(&tx, provider_key)?;
		let ledger_max = Self::ledger_max_block(&tx, provider_key)?;

		let Some((repaired, reason)) = self.policy.plan_repair(&stored, observed_height, ledger_max)
		else {
			return Ok(stored.numeric().unwrap_or_default());
		};

		let block = BlockHeight::new(repaired, self.policy.sanity_ceiling)?;
		// A reset watermark cannot vouch for transactions above it.
		let last_transaction_block = last_transaction_block.map(|b| b.min(repaired));
		Self::write_watermark(
			&tx,
			provider_key,
			block,
			last_transaction_block,
			&stored.describe(),
			reason,
		)?;
		tx.commit()?;

		warn!(
			"Repaired watermark for {}: {} -> {} ({}, observed height {})",
			provider_key,
			stored.describe(),
			repaired,
			reason.as_str(),
			observed_height
		);
		Ok(repaired)
	}
}

#[async_trait]
impl LedgerWriter for SqliteLedgerStore {
	async fn upsert_provider(&self, provider: &Provider) -> Result<(), LedgerError> {
		let conn = self.lock()?;
		let timestamp = now();
		conn.execute(
			r#"
			INSERT INTO providers (namehash, display_name, provider_id, wallet_address, created_at, updated_at)
			VALUES (?1, ?2, ?3, ?4, ?5, ?5)
			ON CONFLICT(namehash) DO UPDATE SET
				display_name = excluded.display_name,
				provider_id = excluded.provider_id,
				wallet_address = excluded.wallet_address,
				updated_at = excluded.updated_at
			"#,
			params![
				provider.namehash,
				provider.display_name,
				provider.provider_id,
				provider.wallet_address,
				timestamp
			],
		)?;
		Ok(())
	}

	async fn apply(
		&self,
		provider: &Provider,
		transactions: &[TransactionRecord],
		new_watermark: u64,
	) -> Result<usize, LedgerError> {
		let key = provider.namehash.as_str();
		let new_block = BlockHeight::new(new_watermark, self.policy.sanity_ceiling)?;

		let mut conn = self.lock()?;
		let tx = conn.transaction()?;

		let registered = tx
			.query_row(
				"SELECT 1 FROM providers WHERE namehash = ?1",
				params![key],
				|_| Ok(()),
			)
			.optional()?
			.is_some();
		if !registered {
			return Err(LedgerError::ProviderNotRegistered(key.to_string()));
		}

		let (stored, last_transaction_block) = Self::read_stored(&tx, key)?;
		let current = self.trusted_block(key, &stored)?;
		if new_block.get() < current {
			return Err(LedgerError::WatermarkRegression {
				provider: key.to_string(),
				current,
				requested: new_block.get(),
			});
		}

		let recorded_at = now();
		let mut inserted: Vec<&TransactionRecord> = Vec::new();
		for record in transactions {
			if record.provider_key != key {
				return Err(LedgerError::ForeignTransaction(record.tx_hash.clone()));
			}
			let value = i64::try_from(record.value_raw)
				.map_err(|_| LedgerError::ValueOverflow(record.tx_hash.clone()))?;
			let changed = tx.execute(
				r#"
				INSERT INTO transactions (
					tx_hash, block_number, timestamp, from_address, from_display_name,
					to_address, provider_key, provider_id, provider_entry_name,
					value_raw, gas_used, recorded_at
				) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
				ON CONFLICT(tx_hash) DO NOTHING
				"#,
				params![
					record.tx_hash,
					record.block_number as i64,
					record.timestamp,
					record.from_address,
					record.from_display_name,
					record.to_address,
					record.provider_key,
					record.provider_id,
					record.provider_entry_name,
					value,
					record.gas_used as i64,
					recorded_at
				],
			)?;
			if changed == 1 {
				inserted.push(record);
			} else {
				debug!("Transaction {} already recorded", record.tx_hash);
			}
		}

		let mut highest_recorded = last_transaction_block;
		if !inserted.is_empty() {
			let total = inserted.iter().try_fold(0i64, |acc, record| {
				// Each value already fit in i64 above.
				acc.checked_add(record.value_raw as i64)
					.ok_or_else(|| LedgerError::ValueOverflow(record.tx_hash.clone()))
			})?;
			let min_block = inserted.iter().map(|r| r.block_number).min().unwrap_or_default();
			let max_block = inserted.iter().map(|r| r.block_number).max().unwrap_or_default();
			let first_at = inserted.iter().map(|r| r.timestamp).min().unwrap_or_default();
			let last_at = inserted.iter().map(|r| r.timestamp).max().unwrap_or_default();

			let mut new_senders = 0i64;
			for sender in inserted.iter().map(|r| r.from_address.as_str()).unique() {
				let seen_before: bool = tx.query_row(
					r#"
					SELECT EXISTS(
						SELECT 1 FROM transactions
						WHERE provider_key = ?1 AND from_address = ?2 AND block_number < ?3
					)
					"#,
					params![key, sender, min_block as i64],
					|row| row.get(0),
				)?;
				if !seen_before {
					new_senders += 1;
				}
			}

			tx.execute(
				r#"
				UPDATE providers SET
					total_received = total_received + ?2,
					transaction_count = transaction_count + ?3,
					unique_sender_count = unique_sender_count + ?4,
					first_transaction_at = MIN(COALESCE(first_transaction_at, ?5), ?5),
					last_transaction_at = MAX(COALESCE(last_transaction_at, ?6), ?6),
					updated_at = ?7
				WHERE namehash = ?1
				"#,
				params![
					key,
					total,
					inserted.len() as i64,
					new_senders,
					first_at,
					last_at,
					recorded_at
				],
			)?;

			highest_recorded = Some(highest_recorded.map_or(max_block, |b| b.max(max_block)));
		}

		if new_block.get() != current || highest_recorded != last_transaction_block {
			Self::write_watermark(
				&tx,
				key,
				new_block,
				highest_recorded,
				&stored.describe(),
				AuditReason::Advance,
			)?;
		}

		tx.commit()?;

		debug!(
			"Applied {} new transactions for {}; watermark {} -> {}",
			inserted.len(),
			provider.display_name,
			current,
			new_block.get()
		);
		Ok(inserted.len())
	}
}

#[async_trait]
impl RunRecorder for SqliteLedgerStore {
	async fn begin_run(&self) -> Result<i64, LedgerError> {
		let mut conn = self.lock()?;
		let started_at = now();
		let tx = conn.transaction()?;
		tx.execute(
			"INSERT INTO sync_runs (started_at) VALUES (?1)",
			params![started_at],
		)?;
		let run_id = tx.last_insert_rowid();
		tx.execute(
			"UPDATE sync_status SET runs_attempted = runs_attempted + 1, last_run_at = ?1 WHERE id = 1",
			params![started_at],
		)?;
		tx.commit()?;
		Ok(run_id)
	}

	async fn finish_run(&self, run_id: i64, report: &RunReport) -> Result<(), LedgerError> {
		let mut conn = self.lock()?;
		let tx = conn.transaction()?;
		tx.execute(
			r#"
			UPDATE sync_runs SET
				finished_at = ?2,
				status = ?3,
				providers_processed = ?4,
				providers_skipped = ?5,
				providers_failed = ?6,
				transactions_added = ?7,
				error = ?8
			WHERE id = ?1
			"#,
			params![
				run_id,
				now(),
				report.status.as_str(),
				report.providers_processed as i64,
				report.providers_skipped as i64,
				report.providers_failed as i64,
				report.transactions_added as i64,
				report.error
			],
		)?;
		let succeeded = i64::from(report.status == RunStatus::Succeeded);
		tx.execute(
			r#"
			UPDATE sync_status SET
				runs_succeeded = runs_succeeded + ?1,
				runs_failed = runs_failed + ?2,
				last_error = COALESCE(?3, last_error)
			WHERE id = 1
			"#,
			params![succeeded, 1 - succeeded, report.error],
		)?;
		tx.commit()?;
		Ok(())
	}
}
