//!
//! HTTP client for an Etherscan-compatible block explorer.
//!
//! Provides the chain height oracle and the paginated token-transfer source. Every request
//! goes through a shared [`RateLimiter`] and the [`RetryPolicy`], so callers only ever see
//! a final result or an exhausted-retry error.

use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::rate_limiter::RateLimiter;
use super::retry::RetryPolicy;
use super::source::{ChainHeightSource, TransferSource};
use super::types::*;

/// Explorers refuse `page * offset` beyond this many results for one query.
const RESULT_WINDOW: u32 = 10_000;

/// Settings for [`ExplorerClient`].
#[derive(Debug, Clone)]
pub struct ExplorerConfig {
	pub api_url: String,
	pub api_key: Option<String>,
	/// Token contract whose transfers are tracked (normalized lower-case).
	pub token_contract: String,
	pub page_size: u32,
	pub request_timeout: Duration,
	pub rate_limit_interval: Duration,
	pub retry: RetryPolicy,
}

/// Block-explorer client
pub struct ExplorerClient {
	http_client: Client,
	config: ExplorerConfig,
	rate_limiter: RateLimiter,
}

impl ExplorerClient {
	/// Create a new explorer client.
	///
	/// # Errors
	/// Returns `IndexerError::HttpError` if the underlying HTTP client cannot be built.
	pub fn new(config: ExplorerConfig) -> Result<Self, IndexerError> {
		let http_client = Client::builder().timeout(config.request_timeout).build()?;
		let rate_limiter = RateLimiter::new(config.rate_limit_interval);

		Ok(Self {
			http_client,
			config,
			rate_limiter,
		})
	}

	/// Issue one rate-limited GET and decode the body as JSON.
	async fn get_json(&self, params: &[(&str, String)]) -> Result<Value, IndexerError> {
		self.rate_limiter.acquire().await;

		let mut query: Vec<(&str, String)> = params.to_vec();
		if let Some(key) = &self.config.api_key {
			query.push(("apikey", key.clone()));
		}

		let response = self
			.http_client
			.get(&self.config.api_url)
			.query(&query)
			.send()
			.await?;

		let status = response.status();
		if status == StatusCode::TOO_MANY_REQUESTS {
			return Err(IndexerError::RateLimited(format!("HTTP {}", status)));
		}
		if !status.is_success() {
			return Err(IndexerError::StatusError(status.as_u16()));
		}

		Ok(response.json::<Value>().await?)
	}

	async fn fetch_page(
		&self,
		wallet: &str,
		from_block: u64,
		to_block: u64,
		page: u32,
	) -> Result<Vec<RawTransfer>, IndexerError> {
		let params = [
			("module", "account".to_string()),
			("action", "tokentx".to_string()),
			("contractaddress", self.config.token_contract.clone()),
			("address", wallet.to_string()),
			("startblock", from_block.to_string()),
			("endblock", to_block.to_string()),
			("page", page.to_string()),
			("offset", self.config.page_size.to_string()),
			("sort", "asc".to_string()),
		];

		self.config
			.retry
			.run("tokentx", || async {
				let body = self.get_json(&params).await?;
				parse_transfer_page(body)
			})
			.await
	}
}

#[async_trait]
impl ChainHeightSource for ExplorerClient {
	async fn current_height(&self) -> Result<u64, IndexerError> {
		let params = [
			("module", "proxy".to_string()),
			("action", "eth_blockNumber".to_string()),
		];

		let height = self
			.config
			.retry
			.run("eth_blockNumber", || async {
				let body = self.get_json(&params).await?;
				parse_block_number(&body)
			})
			.await?;

		debug!("Upstream chain height is {}", height);
		Ok(height)
	}
}

#[async_trait]
impl TransferSource for ExplorerClient {
	async fn fetch_incoming(
		&self,
		wallet: &str,
		from_block: u64,
		to_block: u64,
	) -> Result<IncomingTransfers, IndexerError> {
		let (raw_transfers, truncated) = collect_pages(self.config.page_size, |page| {
			self.fetch_page(wallet, from_block, to_block, page)
		})
		.await?;

		let incoming = select_incoming(
			raw_transfers,
			truncated,
			wallet,
			&self.config.token_contract,
		)?;

		if let Some(scanned_to) = incoming.scanned_to {
			info!(
				"Result window exhausted for {} in [{}, {}]; complete through block {}",
				wallet, from_block, to_block, scanned_to
			);
		}
		debug!(
			"Fetched {} incoming transfers for {} in [{}, {}]",
			incoming.transfers.len(),
			wallet,
			from_block,
			to_block
		);
		Ok(incoming)
	}
}

/// Request pages `1..` through `fetch_page` until one comes back short or the result window
/// is used up. Returns every transfer seen and whether the window cut the result short.
async fn collect_pages<F, Fut>(
	page_size: u32,
	mut fetch_page: F,
) -> Result<(Vec<RawTransfer>, bool), IndexerError>
where
	F: FnMut(u32) -> Fut,
	Fut: Future<Output = Result<Vec<RawTransfer>, IndexerError>>,
{
	let page_size = page_size.max(1);
	let max_pages = (RESULT_WINDOW / page_size).max(1);
	let mut raw_transfers = Vec::new();

	for page in 1..=max_pages {
		let batch = fetch_page(page).await?;
		let full = batch.len() >= page_size as usize;
		raw_transfers.extend(batch);
		if !full {
			return Ok((raw_transfers, false));
		}
	}
	Ok((raw_transfers, true))
}

/// Keep the transfers of `token_contract` into `wallet`.
///
/// The completeness bound of a truncated result comes from every transfer the explorer
/// returned, outgoing ones included: its highest block may continue past the window, so
/// transfers in that block are dropped and the result only vouches for the blocks below.
/// A window filled by a single block is kept whole, since nothing below it could vouch instead.
fn select_incoming(
	raw_transfers: Vec<RawTransfer>,
	truncated: bool,
	wallet: &str,
	token_contract: &str,
) -> Result<IncomingTransfers, IndexerError> {
	let transfers = raw_transfers
		.into_iter()
		.map(TokenTransfer::try_from)
		.collect::<Result<Vec<_>, _>>()?;

	let window = if truncated {
		transfers
			.iter()
			.map(|t| t.block_number)
			.minmax()
			.into_option()
	} else {
		None
	};

	let mut incoming: Vec<TokenTransfer> = transfers
		.into_iter()
		.filter(|t| t.to_address == wallet && t.contract_address == token_contract)
		.collect();

	let scanned_to = match window {
		None => None,
		Some((first, last)) if first == last => {
			warn!(
				"Truncated result consists of block {} only; keeping it",
				last
			);
			Some(last)
		}
		Some((_, last)) => {
			incoming.retain(|t| t.block_number < last);
			Some(last - 1)
		}
	};

	Ok(IncomingTransfers {
		transfers: incoming,
		scanned_to,
	})
}

fn is_rate_limit_message(text: &str) -> bool {
	text.to_lowercase().contains("rate limit")
}

fn is_busy_message(text: &str) -> bool {
	let lower = text.to_lowercase();
	lower.contains("timeout") || lower.contains("timed out") || lower.contains("busy")
}

/// Decode one `tokentx` page. An explorer "No transactions found" reply is an empty page.
pub fn parse_transfer_page(body: Value) -> Result<Vec<RawTransfer>, IndexerError> {
	let envelope: ExplorerEnvelope = serde_json::from_value(body)?;

	if envelope.status == "1" {
		return match envelope.result {
			Value::Array(_) => Ok(serde_json::from_value(envelope.result)?),
			other => Err(IndexerError::Malformed(format!(
				"expected transfer array, got {}",
				other
			))),
		};
	}

	let detail = match &envelope.result {
		Value::String(s) => s.clone(),
		Value::Array(items) if items.is_empty() => String::new(),
		other => other.to_string(),
	};

	if envelope.message.starts_with("No transactions found") {
		return Ok(Vec::new());
	}
	if is_rate_limit_message(&detail) || is_rate_limit_message(&envelope.message) {
		return Err(IndexerError::RateLimited(detail));
	}
	if is_busy_message(&detail) {
		return Err(IndexerError::Unavailable(detail));
	}
	Err(IndexerError::ApiError(format!(
		"{}: {}",
		envelope.message, detail
	)))
}

/// Decode an `eth_blockNumber` reply (hex quantity) or classify the explorer's error.
pub fn parse_block_number(body: &Value) -> Result<u64, IndexerError> {
	// Rate limiting on proxy endpoints comes back in the account-envelope shape.
	if body.get("status").and_then(|s| s.as_str()) == Some("0") {
		let detail = body
			.get("result")
			.and_then(|r| r.as_str())
			.unwrap_or_default()
			.to_string();
		if is_rate_limit_message(&detail) {
			return Err(IndexerError::RateLimited(detail));
		}
		return Err(IndexerError::ApiError(detail));
	}

	let response: ProxyResponse = serde_json::from_value(body.clone())?;
	if let Some(error) = response.error {
		let message = error
			.get("message")
			.and_then(|m| m.as_str())
			.map(str::to_string)
			.unwrap_or_else(|| error.to_string());
		if is_rate_limit_message(&message) {
			return Err(IndexerError::RateLimited(message));
		}
		return Err(IndexerError::Unavailable(message));
	}

	let hex_height = response
		.result
		.as_ref()
		.and_then(|r| r.as_str())
		.ok_or_else(|| IndexerError::Malformed("eth_blockNumber without result".to_string()))?;

	let digits = hex_height
		.strip_prefix("0x")
		.ok_or_else(|| IndexerError::Malformed(format!("not a hex quantity: {}", hex_height)))?;

	u64::from_str_radix(digits, 16)
		.map_err(|_| IndexerError::Malformed(format!("not a hex quantity: {}", hex_height)))
}
