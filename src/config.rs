//! Command line and environment configuration.
//!
//! Every knob is a flag with an environment variable fallback, so the job can be driven entirely
//! from a scheduler's environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::indexer::{ExplorerConfig, RetryPolicy};
use crate::ledger::WatermarkPolicy;
use crate::sync::OrchestratorConfig;
use crate::utils::normalize_address;

/// USDC on Base.
pub const DEFAULT_TOKEN_CONTRACT: &str = "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913";

#[derive(Debug, Parser)]
#[command(name = "provider-leaderboard-sync")]
#[command(about = "Reconciles USDC payments to registered providers into a leaderboard")]
#[command(version)]
pub struct Cli {
	#[command(flatten)]
	pub settings: Settings,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
	/// Run one reconciliation cycle and exit (1 on failure)
	Run,

	/// Reconcile repeatedly, pausing the poll interval between runs
	Daemon,

	/// Show run counters and the current leaderboard
	Status,

	/// Recompute every provider's aggregates from its transactions and compare (1 on mismatch)
	Verify,

	/// Overwrite a provider's watermark; the change is audited
	Repair {
		/// Namehash of the provider entry
		#[arg(long)]
		provider: String,

		/// New last processed block
		#[arg(long)]
		block: u64,
	},
}

#[derive(Debug, Clone, Args)]
pub struct Settings {
	/// Namespace index database (read-only)
	#[arg(long, env = "REGISTRY_DB_PATH", global = true, default_value = "registry.db")]
	pub registry_db_path: PathBuf,

	/// Registry entry whose direct children are the tracked providers
	#[arg(long, env = "NAMESPACE_ROOT", global = true, default_value = "grid.hypr")]
	pub namespace_root: String,

	/// Only accounts below this entry may appear as senders (whole registry if unset)
	#[arg(long, env = "MEMBER_ROOT", global = true)]
	pub member_root: Option<String>,

	/// Ledger database
	#[arg(long, env = "LEDGER_DB_PATH", global = true, default_value = "leaderboard.db")]
	pub ledger_db_path: PathBuf,

	#[arg(long, env = "EXPLORER_API_URL", global = true, default_value = "https://api.basescan.org/api")]
	pub explorer_api_url: String,

	#[arg(long, env = "EXPLORER_API_KEY", global = true, hide_env_values = true)]
	pub explorer_api_key: Option<String>,

	#[arg(long, env = "TOKEN_CONTRACT", global = true, default_value = DEFAULT_TOKEN_CONTRACT)]
	pub token_contract: String,

	#[arg(long, env = "TOKEN_DECIMALS", global = true, default_value_t = 6)]
	pub token_decimals: u32,

	/// Trailing blocks below the chain head that are not reconciled yet
	#[arg(long, env = "SAFETY_BUFFER", global = true, default_value_t = 10)]
	pub safety_buffer: u64,

	/// Largest watermark advance over a range the explorer reports as empty
	#[arg(long, env = "CONSERVATIVE_STEP", global = true, default_value_t = 100)]
	pub conservative_step: u64,

	#[arg(long, env = "MAX_RETRIES", global = true, default_value_t = 5)]
	pub max_retries: u32,

	#[arg(long, env = "RETRY_BASE_MS", global = true, default_value_t = 500)]
	pub retry_base_ms: u64,

	/// Minimum spacing between explorer requests
	#[arg(long, env = "RATE_LIMIT_MS", global = true, default_value_t = 250)]
	pub rate_limit_ms: u64,

	#[arg(long, env = "POLL_INTERVAL_SECS", global = true, default_value_t = 300)]
	pub poll_interval_secs: u64,

	/// Exclusive upper bound for any plausible block number
	#[arg(long, env = "SANITY_CEILING", global = true, default_value_t = 100_000_000)]
	pub sanity_ceiling: u64,

	/// How far past the safe height a stored watermark may sit before it is repaired
	#[arg(long, env = "REPAIR_TOLERANCE", global = true, default_value_t = 1_000)]
	pub repair_tolerance: u64,

	#[arg(long, env = "PAGE_SIZE", global = true, default_value_t = 1_000)]
	pub page_size: u32,

	#[arg(long, env = "HTTP_TIMEOUT_SECS", global = true, default_value_t = 30)]
	pub http_timeout_secs: u64,

	/// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
	#[arg(long, env = "LOG_LEVEL", global = true, default_value = "info")]
	pub log_level: String,
}

/// Settings that parse but cannot be used
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Invalid token contract address: {0}")]
	InvalidTokenContract(String),

	#[error("Invalid setting: {0}")]
	InvalidSetting(String),
}

impl Settings {
	/// Reject combinations that would make every run fail or loop forever.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if normalize_address(&self.token_contract).is_none() {
			return Err(ConfigError::InvalidTokenContract(self.token_contract.clone()));
		}
		if self.page_size == 0 {
			return Err(ConfigError::InvalidSetting("PAGE_SIZE must be positive".to_string()));
		}
		if self.conservative_step == 0 {
			return Err(ConfigError::InvalidSetting(
				"CONSERVATIVE_STEP must be positive".to_string(),
			));
		}
		if self.sanity_ceiling == 0 {
			return Err(ConfigError::InvalidSetting(
				"SANITY_CEILING must be positive".to_string(),
			));
		}
		if self.token_decimals > 38 {
			return Err(ConfigError::InvalidSetting(
				"TOKEN_DECIMALS must be at most 38".to_string(),
			));
		}
		Ok(())
	}

	pub fn explorer_config(&self) -> Result<ExplorerConfig, ConfigError> {
		let token_contract = normalize_address(&self.token_contract)
			.ok_or_else(|| ConfigError::InvalidTokenContract(self.token_contract.clone()))?;

		Ok(ExplorerConfig {
			api_url: self.explorer_api_url.clone(),
			api_key: self.explorer_api_key.clone().filter(|key| !key.is_empty()),
			token_contract,
			page_size: self.page_size,
			request_timeout: Duration::from_secs(self.http_timeout_secs),
			rate_limit_interval: Duration::from_millis(self.rate_limit_ms),
			retry: RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_base_ms)),
		})
	}

	pub fn watermark_policy(&self) -> WatermarkPolicy {
		WatermarkPolicy {
			sanity_ceiling: self.sanity_ceiling,
			repair_tolerance: self.repair_tolerance,
		}
	}

	pub fn orchestrator_config(&self) -> OrchestratorConfig {
		OrchestratorConfig {
			namespace_root: self.namespace_root.clone(),
			safety_buffer: self.safety_buffer,
			token_decimals: self.token_decimals,
			poll_interval: Duration::from_secs(self.poll_interval_secs),
		}
	}
}
