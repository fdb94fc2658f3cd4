mod config;
mod indexer;
mod ledger;
mod registry;
mod sync;
mod utils;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use crate::config::{Cli, Command, Settings};
use crate::indexer::ExplorerClient;
use crate::ledger::{AuditReason, RunStatus, SqliteLedgerStore, WatermarkStore};
use crate::registry::SqliteNamespaceRegistry;
use crate::sync::{ReconciliationEngine, RunOrchestrator, SyncError};
use crate::utils::format_token_amount;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
	let cli = Cli::parse();

	// RUST_LOG wins over --log-level
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.settings.log_level)),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = cli.settings.validate() {
		error!("{}", e);
		return ExitCode::FAILURE;
	}

	let result = match cli.command {
		Command::Run => run(&cli.settings).await,
		Command::Daemon => daemon(&cli.settings).await,
		Command::Status => status(&cli.settings).await,
		Command::Verify => verify(&cli.settings),
		Command::Repair { provider, block } => repair(&cli.settings, &provider, block).await,
	};

	match result {
		Ok(code) => code,
		Err(e) => {
			error!("{}", e);
			ExitCode::FAILURE
		}
	}
}

fn open_ledger(settings: &Settings) -> Result<Arc<SqliteLedgerStore>, SyncError> {
	Ok(Arc::new(SqliteLedgerStore::open(
		&settings.ledger_db_path,
		settings.watermark_policy(),
	)?))
}

/// Wire the registry, explorer and ledger into an orchestrator.
fn build_orchestrator(settings: &Settings) -> Result<RunOrchestrator, SyncError> {
	let explorer_config = settings.explorer_config()?;

	let registry = Arc::new(SqliteNamespaceRegistry::open(
		&settings.registry_db_path,
		settings.member_root.clone(),
	)?);
	info!("Opened registry at {:?}", settings.registry_db_path);

	let explorer = Arc::new(ExplorerClient::new(explorer_config)?);
	info!("Created explorer client for {}", settings.explorer_api_url);

	let store = open_ledger(settings)?;
	let engine = ReconciliationEngine::new(
		explorer.clone(),
		store.clone(),
		settings.conservative_step,
	);

	Ok(RunOrchestrator::new(
		registry,
		explorer,
		engine,
		store.clone(),
		store,
		settings.orchestrator_config(),
	))
}

async fn run(settings: &Settings) -> Result<ExitCode, SyncError> {
	let orchestrator = build_orchestrator(settings)?;
	let report = orchestrator.run_once().await?;

	info!(
		"Run {}: {} processed, {} skipped, {} failed, {} transactions added",
		report.status.as_str(),
		report.providers_processed,
		report.providers_skipped,
		report.providers_failed,
		report.transactions_added
	);

	Ok(match report.status {
		RunStatus::Failed => ExitCode::FAILURE,
		RunStatus::Succeeded | RunStatus::PartiallyFailed => ExitCode::SUCCESS,
	})
}

async fn daemon(settings: &Settings) -> Result<ExitCode, SyncError> {
	let orchestrator = build_orchestrator(settings)?;
	orchestrator
		.run_daemon(async {
			if let Err(e) = tokio::signal::ctrl_c().await {
				error!("Failed to listen for CTRL+C: {}", e);
				std::future::pending::<()>().await;
			}
		})
		.await;
	Ok(ExitCode::SUCCESS)
}

async fn status(settings: &Settings) -> Result<ExitCode, SyncError> {
	let store = open_ledger(settings)?;
	let counters = store.run_counters()?;

	println!("Runs attempted: {}", counters.runs_attempted);
	println!("Runs succeeded: {}", counters.runs_succeeded);
	println!("Runs failed:    {}", counters.runs_failed);
	println!(
		"Last run:       {}",
		counters.last_run_at.as_deref().unwrap_or("never")
	);
	if let Some(last_error) = &counters.last_error {
		println!("Last error:     {}", last_error);
	}

	let leaderboard = store.leaderboard()?;
	println!();
	println!("Leaderboard ({} providers):", leaderboard.len());
	for (rank, entry) in leaderboard.iter().enumerate() {
		let watermark = match store.get(&entry.namehash).await {
			Ok(watermark) => watermark.last_processed_block.to_string(),
			Err(e) => {
				warn!("{}", e);
				"corrupt".to_string()
			}
		};
		println!(
			"{:>3}. {} ({}) {} USDC from {} transactions, {} senders, synced to block {}",
			rank + 1,
			entry.display_name,
			entry.provider_id,
			format_token_amount(entry.stats.total_received, settings.token_decimals),
			entry.stats.transaction_count,
			entry.stats.unique_sender_count,
			watermark
		);
	}

	Ok(ExitCode::SUCCESS)
}

fn verify(settings: &Settings) -> Result<ExitCode, SyncError> {
	let store = open_ledger(settings)?;
	let mismatches = store.verify_leaderboard()?;

	if mismatches.is_empty() {
		info!("All leaderboard aggregates match their transaction records");
		return Ok(ExitCode::SUCCESS);
	}

	for mismatch in &mismatches {
		error!(
			"{} ({}): stored {:?}, recomputed {:?}",
			mismatch.display_name, mismatch.namehash, mismatch.stored, mismatch.recomputed
		);
	}
	error!("{} providers have inconsistent aggregates", mismatches.len());
	Ok(ExitCode::FAILURE)
}

async fn repair(settings: &Settings, provider: &str, block: u64) -> Result<ExitCode, SyncError> {
	let store = open_ledger(settings)?;
	store.set(provider, block, AuditReason::OperatorRepair).await?;

	for entry in store.audit_trail(provider)?.iter().rev().take(5) {
		info!(
			"{} {} -> {} ({})",
			entry.recorded_at, entry.old_value, entry.new_value, entry.reason
		);
	}
	Ok(ExitCode::SUCCESS)
}
