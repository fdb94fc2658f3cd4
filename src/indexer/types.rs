//! Types for the block-explorer transfer API

use serde::{Deserialize, Serialize};

use crate::utils::normalize_address;

/// Response envelope shared by every `module=account` explorer call.
///
/// `result` is an array on success and a bare string when the explorer reports
/// an error or a rate limit, so it stays untyped until the status is known.
#[derive(Debug, Clone, Deserialize)]
pub struct ExplorerEnvelope {
	pub status: String,
	pub message: String,
	#[serde(default)]
	pub result: serde_json::Value,
}

/// Response of the JSON-RPC proxy endpoints (`module=proxy`).
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyResponse {
	#[serde(default)]
	pub result: Option<serde_json::Value>,
	#[serde(default)]
	pub error: Option<serde_json::Value>,
}

/// A token transfer exactly as the explorer returns it. Every numeric field is a decimal string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransfer {
	#[serde(rename = "blockNumber")]
	pub block_number: String,
	#[serde(rename = "timeStamp")]
	pub time_stamp: String,
	pub hash: String,
	pub from: String,
	pub to: String,
	pub value: String,
	#[serde(rename = "contractAddress")]
	pub contract_address: String,
	#[serde(rename = "gasUsed", default)]
	pub gas_used: String,
}

/// A validated incoming transfer with typed fields and normalized addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
	pub tx_hash: String,
	pub block_number: u64,
	pub timestamp: i64,
	pub from_address: String,
	pub to_address: String,
	pub contract_address: String,
	/// Raw integer amount in the token's smallest unit.
	pub value: u128,
	pub gas_used: u64,
}

impl TryFrom<RawTransfer> for TokenTransfer {
	type Error = IndexerError;

	fn try_from(raw: RawTransfer) -> Result<Self, Self::Error> {
		let malformed = |field: &str, value: &str| {
			IndexerError::Malformed(format!(
				"transfer {}: invalid {} '{}'",
				raw.hash, field, value
			))
		};

		let block_number = raw
			.block_number
			.parse::<u64>()
			.map_err(|_| malformed("blockNumber", &raw.block_number))?;
		let timestamp = raw
			.time_stamp
			.parse::<i64>()
			.map_err(|_| malformed("timeStamp", &raw.time_stamp))?;
		let value = raw
			.value
			.parse::<u128>()
			.map_err(|_| malformed("value", &raw.value))?;
		// Older explorer deployments omit gasUsed on token transfers.
		let gas_used = if raw.gas_used.is_empty() {
			0
		} else {
			raw.gas_used
				.parse::<u64>()
				.map_err(|_| malformed("gasUsed", &raw.gas_used))?
		};
		let from_address =
			normalize_address(&raw.from).ok_or_else(|| malformed("from", &raw.from))?;
		let to_address = normalize_address(&raw.to).ok_or_else(|| malformed("to", &raw.to))?;
		let contract_address = normalize_address(&raw.contract_address)
			.ok_or_else(|| malformed("contractAddress", &raw.contract_address))?;

		Ok(Self {
			tx_hash: raw.hash.to_lowercase(),
			block_number,
			timestamp,
			from_address,
			to_address,
			contract_address,
			value,
			gas_used,
		})
	}
}

/// Incoming transfers for one wallet over a requested block range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingTransfers {
	pub transfers: Vec<TokenTransfer>,
	/// Last block the result is known to be complete through, when the explorer cut it short.
	/// `None` means the whole requested range was covered.
	pub scanned_to: Option<u64>,
}

impl IncomingTransfers {
	pub fn complete(transfers: Vec<TokenTransfer>) -> Self {
		Self {
			transfers,
			scanned_to: None,
		}
	}
}

/// Error types for block-explorer operations
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("Unexpected HTTP status: {0}")]
	StatusError(u16),

	#[error("Rate limited by upstream: {0}")]
	RateLimited(String),

	#[error("Malformed response: {0}")]
	Malformed(String),

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Explorer temporarily unavailable: {0}")]
	Unavailable(String),

	#[error("Explorer rejected request: {0}")]
	ApiError(String),

	#[error("Upstream unavailable after {attempts} attempts: {last}")]
	UpstreamUnavailable {
		attempts: u32,
		#[source]
		last: Box<IndexerError>,
	},
}

impl IndexerError {
	/// Whether repeating the same request can reasonably succeed.
	pub fn is_retryable(&self) -> bool {
		match self {
			IndexerError::HttpError(_)
			| IndexerError::RateLimited(_)
			| IndexerError::Malformed(_)
			| IndexerError::Unavailable(_)
			| IndexerError::JsonError(_) => true,
			IndexerError::StatusError(code) => *code == 429 || *code >= 500,
			IndexerError::ApiError(_) | IndexerError::UpstreamUnavailable { .. } => false,
		}
	}
}
