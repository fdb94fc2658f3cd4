//! Per-provider reconciliation.
//!
//! The engine loads and repairs a provider's watermark, fetches the safe block range from the
//! transfer source and turns the result into a [`ReconcileOutcome`]. It never writes ledger
//! state beyond the watermark repair; committing the outcome is the ledger writer's job.

use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, warn};

use super::SyncError;
use crate::indexer::{IncomingTransfers, TokenTransfer, TransferSource};
use crate::ledger::{TransactionRecord, WatermarkStore};
use crate::registry::{AllowList, Provider};

/// Result of reconciling one provider against one safe height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Watermark the range was computed from, after any repair.
    pub previous_watermark: u64,
    /// Watermark to commit together with `new_transactions`.
    pub new_watermark: u64,
    /// Allow-listed transfers inside the scanned range, ordered by block.
    pub new_transactions: Vec<TransactionRecord>,
    pub reached_safe_height: bool,
    /// The provider was already at the safe height; nothing was fetched.
    pub caught_up: bool,
    /// Distinct transfers returned by the source.
    pub fetched: usize,
    /// Transfers dropped for lying outside the scanned range.
    pub out_of_range: usize,
    /// In-range transfers from senders that are not registered members.
    pub unregistered_senders: usize,
}

impl ReconcileOutcome {
    fn caught_up(watermark: u64) -> Self {
        Self {
            previous_watermark: watermark,
            new_watermark: watermark,
            new_transactions: Vec::new(),
            reached_safe_height: false,
            caught_up: true,
            fetched: 0,
            out_of_range: 0,
            unregistered_senders: 0,
        }
    }
}

/// Reconciles providers one at a time against a shared transfer source.
pub struct ReconciliationEngine {
    source: Arc<dyn TransferSource>,
    watermarks: Arc<dyn WatermarkStore>,
    conservative_step: u64,
}

impl ReconciliationEngine {
    pub fn new(
        source: Arc<dyn TransferSource>,
        watermarks: Arc<dyn WatermarkStore>,
        conservative_step: u64,
    ) -> Self {
        Self {
            source,
            watermarks,
            conservative_step: conservative_step.max(1),
        }
    }

    /// Reconcile `provider` up to `safe_height`.
    pub async fn reconcile(
        &self,
        provider: &Provider,
        allow_list: &AllowList,
        safe_height: u64,
    ) -> Result<ReconcileOutcome, SyncError> {
        let watermark = self
            .watermarks
            .validate_and_repair(&provider.namehash, safe_height)
            .await?;

        let from_block = watermark + 1;
        if from_block > safe_height {
            debug!(
                "{} already at block {} (safe height {})",
                provider.display_name, watermark, safe_height
            );
            return Ok(ReconcileOutcome::caught_up(watermark));
        }

        let fetched = self
            .source
            .fetch_incoming(&provider.wallet_address, from_block, safe_height)
            .await?;

        Ok(plan(
            provider,
            allow_list,
            fetched,
            watermark,
            safe_height,
            self.conservative_step,
        ))
    }
}

/// Decide which transfers to record and where the watermark moves.
///
/// `watermark` must be below `safe_height`. The watermark advances to the highest in-range
/// block the source returned, whether or not its sender is registered. When the source returned
/// nothing in range, it only creeps forward by `conservative_step`, since an empty answer from
/// a lagging explorer cannot be told apart from an empty range. A truncated result caps the
/// range at the block it is complete through, and the watermark never passes that block.
pub fn plan(
    provider: &Provider,
    allow_list: &AllowList,
    fetched: IncomingTransfers,
    watermark: u64,
    safe_height: u64,
    conservative_step: u64,
) -> ReconcileOutcome {
    let from_block = watermark + 1;
    let scan_limit = fetched
        .scanned_to
        .map_or(safe_height, |scanned_to| scanned_to.min(safe_height));

    let mut transfers: Vec<TokenTransfer> = fetched
        .transfers
        .into_iter()
        .unique_by(|transfer| transfer.tx_hash.clone())
        .collect();
    transfers.sort_by_key(|transfer| transfer.block_number);
    let fetched = transfers.len();

    let (in_range, out_of_range): (Vec<_>, Vec<_>) = transfers
        .into_iter()
        .partition(|transfer| (from_block..=scan_limit).contains(&transfer.block_number));

    for transfer in &out_of_range {
        warn!(
            "Dropping transfer {} at block {} outside [{}, {}] for {}",
            transfer.tx_hash, transfer.block_number, from_block, scan_limit, provider.display_name
        );
    }

    let max_block_seen = in_range.iter().map(|transfer| transfer.block_number).max();

    let mut unregistered_senders = 0;
    let new_transactions: Vec<TransactionRecord> = in_range
        .into_iter()
        .filter_map(|transfer| match allow_list.resolve(&transfer.from_address) {
            Some(name) => Some(TransactionRecord::from_transfer(transfer, provider, name)),
            None => {
                debug!(
                    "Ignoring transfer {} from unregistered sender {}",
                    transfer.tx_hash, transfer.from_address
                );
                unregistered_senders += 1;
                None
            }
        })
        .collect();

    let new_watermark = match max_block_seen {
        Some(block) => block.min(scan_limit),
        None => watermark.saturating_add(conservative_step).min(scan_limit),
    }
    .max(watermark);

    ReconcileOutcome {
        previous_watermark: watermark,
        new_watermark,
        new_transactions,
        reached_safe_height: new_watermark >= safe_height,
        caught_up: false,
        fetched,
        out_of_range: out_of_range.len(),
        unregistered_senders,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AuditReason, SqliteLedgerStore, WatermarkPolicy};
    use crate::sync::fakes::{FakeTransferSource, transfer};

    const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
    const BOB: &str = "0x0000000000000000000000000000000000000b0b";
    const MALLORY: &str = "0x000000000000000000000000000000000000bad0";

    fn provider(wallet: &str) -> Provider {
        Provider {
            namehash: format!("0xhash-{}", wallet),
            display_name: "weather.grid.hypr".to_string(),
            provider_id: "weather-api".to_string(),
            wallet_address: wallet.to_string(),
        }
    }

    fn allow_list() -> AllowList {
        [
            (ALICE.to_string(), "alice.grid-wallet.hypr".to_string()),
            (BOB.to_string(), "bob.alice.grid-wallet.hypr".to_string()),
        ]
        .into_iter()
        .collect()
    }

    async fn engine_at(
        provider: &Provider,
        watermark: u64,
        source: FakeTransferSource,
    ) -> (ReconciliationEngine, Arc<FakeTransferSource>) {
        let store = Arc::new(SqliteLedgerStore::in_memory(WatermarkPolicy::default()).unwrap());
        if watermark > 0 {
            store
                .set(&provider.namehash, watermark, AuditReason::OperatorRepair)
                .await
                .unwrap();
        }
        let source = Arc::new(source);
        (ReconciliationEngine::new(source.clone(), store, 100), source)
    }

    #[tokio::test]
    async fn keeps_only_registered_senders_and_advances_to_last_block() {
        let provider = provider("0xabc");
        let source = FakeTransferSource::default().with(
            "0xabc",
            vec![
                transfer("0x90", 90, ALICE, "0xabc", 3),
                transfer("0x10", 10, ALICE, "0xabc", 1),
                transfer("0x50", 50, MALLORY, "0xabc", 2),
            ],
        );
        let (engine, source) = engine_at(&provider, 0, source).await;

        let outcome = engine.reconcile(&provider, &allow_list(), 100).await.unwrap();

        let blocks: Vec<u64> = outcome.new_transactions.iter().map(|t| t.block_number).collect();
        assert_eq!(blocks, vec![10, 90]);
        assert_eq!(outcome.new_transactions[0].from_display_name, "alice.grid-wallet.hypr");
        assert_eq!(outcome.new_transactions[0].provider_key, provider.namehash);
        assert_eq!(outcome.new_watermark, 90);
        assert_eq!(outcome.unregistered_senders, 1);
        assert!(!outcome.reached_safe_height);
        assert_eq!(
            *source.calls.lock().unwrap(),
            vec![("0xabc".to_string(), 1, 100)]
        );
    }

    #[tokio::test]
    async fn empty_range_advances_by_conservative_step() {
        let provider = provider("0xdef");
        let (engine, _) = engine_at(&provider, 500, FakeTransferSource::default()).await;

        let outcome = engine.reconcile(&provider, &allow_list(), 600).await.unwrap();
        assert_eq!(outcome.new_watermark, 600);
        assert!(outcome.reached_safe_height);
        assert!(outcome.new_transactions.is_empty());
    }

    #[tokio::test]
    async fn conservative_step_is_capped_at_safe_height() {
        let provider = provider("0xaaa");
        let (engine, _) = engine_at(&provider, 590, FakeTransferSource::default()).await;

        let outcome = engine.reconcile(&provider, &allow_list(), 600).await.unwrap();
        assert_eq!(outcome.new_watermark, 600);
        assert!(outcome.reached_safe_height);
    }

    #[tokio::test]
    async fn stale_transfers_are_dropped() {
        let provider = provider("0xabc");
        let source = FakeTransferSource::default().with(
            "0xabc",
            vec![
                transfer("0x05", 5, ALICE, "0xabc", 1),
                transfer("0x20", 20, BOB, "0xabc", 1),
            ],
        );
        let (engine, _) = engine_at(&provider, 10, source).await;

        let outcome = engine.reconcile(&provider, &allow_list(), 1_000).await.unwrap();
        assert_eq!(outcome.out_of_range, 1);
        assert_eq!(outcome.new_transactions.len(), 1);
        assert_eq!(outcome.new_transactions[0].tx_hash, "0x20");
        assert_eq!(outcome.new_watermark, 20);
    }

    #[tokio::test]
    async fn only_stale_transfers_count_as_an_empty_range() {
        let provider = provider("0xabc");
        let source = FakeTransferSource::default()
            .with("0xabc", vec![transfer("0x05", 5, ALICE, "0xabc", 1)]);
        let (engine, _) = engine_at(&provider, 10, source).await;

        let outcome = engine.reconcile(&provider, &allow_list(), 1_000).await.unwrap();
        assert!(outcome.new_transactions.is_empty());
        assert_eq!(outcome.new_watermark, 110);
    }

    #[tokio::test]
    async fn caught_up_provider_is_not_fetched() {
        let provider = provider("0xabc");
        let (engine, source) = engine_at(&provider, 600, FakeTransferSource::default()).await;

        let outcome = engine.reconcile(&provider, &allow_list(), 600).await.unwrap();
        assert!(outcome.caught_up);
        assert!(!outcome.reached_safe_height);
        assert_eq!(outcome.new_watermark, 600);
        assert!(source.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupted_watermark_is_repaired_before_fetching() {
        let provider = provider("0xabc");
        let (engine, source) = engine_at(&provider, 0, FakeTransferSource::default()).await;
        engine
            .watermarks
            .set(&provider.namehash, 99_999_999, AuditReason::OperatorRepair)
            .await
            .unwrap();

        let outcome = engine.reconcile(&provider, &allow_list(), 5_000_000).await.unwrap();
        assert_eq!(outcome.previous_watermark, 0);
        assert_eq!(outcome.new_watermark, 100);
        assert_eq!(
            *source.calls.lock().unwrap(),
            vec![("0xabc".to_string(), 1, 5_000_000)]
        );
    }

    #[test]
    fn pagination_overlap_is_deduplicated() {
        let provider = provider("0xabc");
        let transfers = vec![
            transfer("0x10", 10, ALICE, "0xabc", 1),
            transfer("0x10", 10, ALICE, "0xabc", 1),
        ];
        let outcome = plan(&provider, &allow_list(), IncomingTransfers::complete(transfers), 0, 100, 100);
        assert_eq!(outcome.fetched, 1);
        assert_eq!(outcome.new_transactions.len(), 1);
    }

    #[test]
    fn unregistered_transfers_still_prove_the_range() {
        let provider = provider("0xabc");
        let transfers = vec![transfer("0x70", 70, MALLORY, "0xabc", 1)];
        let outcome = plan(&provider, &allow_list(), IncomingTransfers::complete(transfers), 0, 100, 10);
        assert!(outcome.new_transactions.is_empty());
        assert_eq!(outcome.new_watermark, 70);
    }

    #[test]
    fn empty_ranges_reach_safe_height_in_bounded_steps() {
        let provider = provider("0xabc");
        let mut watermark = 0;
        let mut runs = 0;
        while watermark < 1_050 {
            let outcome = plan(
                &provider,
                &allow_list(),
                IncomingTransfers::default(),
                watermark,
                1_050,
                100,
            );
            assert!(outcome.new_watermark - watermark <= 100);
            watermark = outcome.new_watermark;
            runs += 1;
        }
        assert_eq!(runs, 11);
    }

    #[test]
    fn truncated_empty_result_does_not_advance_past_scanned_block() {
        let provider = provider("0xabc");
        let fetched = IncomingTransfers {
            transfers: Vec::new(),
            scanned_to: Some(20),
        };
        let outcome = plan(&provider, &allow_list(), fetched, 0, 1_000, 100);
        assert_eq!(outcome.new_watermark, 20);
        assert!(!outcome.reached_safe_height);
    }

    #[test]
    fn truncated_result_bounds_the_range() {
        let provider = provider("0xabc");
        let fetched = IncomingTransfers {
            transfers: vec![
                transfer("0x30", 30, ALICE, "0xabc", 1),
                transfer("0x60", 60, ALICE, "0xabc", 2),
            ],
            scanned_to: Some(49),
        };
        let outcome = plan(&provider, &allow_list(), fetched, 0, 1_000, 100);
        let blocks: Vec<u64> = outcome.new_transactions.iter().map(|t| t.block_number).collect();
        assert_eq!(blocks, vec![30]);
        assert_eq!(outcome.out_of_range, 1);
        assert_eq!(outcome.new_watermark, 30);
    }

    #[tokio::test]
    async fn truncated_fetch_stops_at_scanned_block() {
        let provider = provider("0xabc");
        let source = FakeTransferSource::default().with_truncated("0xabc", Vec::new(), 219);
        let (engine, source) = engine_at(&provider, 200, source).await;

        let outcome = engine.reconcile(&provider, &allow_list(), 5_000).await.unwrap();
        assert_eq!(outcome.new_watermark, 219);
        assert!(!outcome.reached_safe_height);
        assert_eq!(
            *source.calls.lock().unwrap(),
            vec![("0xabc".to_string(), 201, 5_000)]
        );
    }
}
