use async_trait::async_trait;

use super::types::{IncomingTransfers, IndexerError};

/// Reports the highest block the upstream source knows about.
#[async_trait]
pub trait ChainHeightSource: Send + Sync {
	async fn current_height(&self) -> Result<u64, IndexerError>;
}

/// Supplies incoming token transfers for a wallet over an inclusive block range.
///
/// No transfers in range is an empty result, never an error. A result the upstream truncated
/// carries the block it is complete through in [`IncomingTransfers::scanned_to`].
#[async_trait]
pub trait TransferSource: Send + Sync {
	async fn fetch_incoming(
		&self,
		wallet: &str,
		from_block: u64,
		to_block: u64,
	) -> Result<IncomingTransfers, IndexerError>;
}
