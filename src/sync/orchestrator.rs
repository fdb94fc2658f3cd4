//! Reconciliation run orchestrator and integration point for all sync services.
//!
//! The `RunOrchestrator` sequences one run: discover providers and registered senders, make sure
//! every provider has a leaderboard row, ask the height oracle for the chain head, then reconcile
//! each provider in turn and commit its outcome through the ledger writer.
//!
//! The orchestrator is responsible for:
//! - Treating discovery and height failures as fatal for the run
//! - Scoping any other failure to the provider it happened on, so the run continues
//! - Recording every run, its counts and its terminal status
//! - Repeating runs on an interval in daemon mode

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::SyncError;
use super::engine::ReconciliationEngine;
use super::progress_tracker::RunProgressTracker;
use crate::indexer::ChainHeightSource;
use crate::ledger::{LedgerWriter, RunRecorder, RunReport, RunStatus};
use crate::registry::{AllowList, IdentityRegistry, Provider};
use crate::utils::format_token_amount;

/// Settings for the run loop.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Registry entry whose direct children are the tracked providers
    pub namespace_root: String,
    /// Trailing blocks below the chain head that are not yet trusted
    pub safety_buffer: u64,
    pub token_decimals: u32,
    /// Pause between runs in daemon mode
    pub poll_interval: Duration,
}

/// What committing one provider's outcome changed.
struct Committed {
    added: usize,
    amount: u128,
    reached_safe_height: bool,
}

/// Main coordinator for reconciliation runs.
pub struct RunOrchestrator {
    registry: Arc<dyn IdentityRegistry>,
    heights: Arc<dyn ChainHeightSource>,
    engine: ReconciliationEngine,
    ledger: Arc<dyn LedgerWriter>,
    runs: Arc<dyn RunRecorder>,
    config: OrchestratorConfig,
}

impl RunOrchestrator {
    pub fn new(
        registry: Arc<dyn IdentityRegistry>,
        heights: Arc<dyn ChainHeightSource>,
        engine: ReconciliationEngine,
        ledger: Arc<dyn LedgerWriter>,
        runs: Arc<dyn RunRecorder>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            heights,
            engine,
            ledger,
            runs,
            config,
        }
    }

    /// Execute one reconciliation run and record it.
    ///
    /// Fails only when the run itself cannot be recorded; everything else ends up in the report.
    pub async fn run_once(&self) -> Result<RunReport, SyncError> {
        let run_id = self.runs.begin_run().await?;
        info!("Starting reconciliation run {}", run_id);

        let mut tracker = RunProgressTracker::new(0);
        if let Err(e) = self.execute(&mut tracker).await {
            error!("Run {} aborted: {}", run_id, e);
            tracker.record_fatal(&e.to_string());
        }

        let stats = tracker.get_stats();
        let report = tracker.into_report();
        self.runs.finish_run(run_id, &report).await?;

        info!("{}", stats.summary(self.config.token_decimals));
        match report.status {
            RunStatus::Succeeded => info!("Run {} succeeded", run_id),
            status => warn!("Run {} finished as {}", run_id, status.as_str()),
        }
        Ok(report)
    }

    /// Run until `shutdown` resolves, pausing `poll_interval` between runs.
    pub async fn run_daemon(&self, shutdown: impl Future<Output = ()>) {
        info!(
            "Starting daemon, reconciling every {}s",
            self.config.poll_interval.as_secs()
        );
        tokio::pin!(shutdown);

        loop {
            if let Err(e) = self.run_once().await {
                error!("Failed to record run: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping daemon");
                    return;
                }
            }
        }
    }

    async fn execute(&self, tracker: &mut RunProgressTracker) -> Result<(), SyncError> {
        let providers = self
            .registry
            .list_providers(&self.config.namespace_root)
            .await?;
        tracker.set_providers_total(providers.len());
        if providers.is_empty() {
            warn!(
                "No providers with a wallet under {}; nothing to do",
                self.config.namespace_root
            );
            return Ok(());
        }

        let allow_list = self.registry.build_allow_list().await?;
        if allow_list.is_empty() {
            warn!("Allow-list is empty; transfers will advance watermarks without being recorded");
        }

        let mut registered = Vec::with_capacity(providers.len());
        for provider in providers {
            match self.ledger.upsert_provider(&provider).await {
                Ok(()) => registered.push(provider),
                Err(e) => {
                    error!("Failed to register {}: {}", provider.display_name, e);
                    tracker.record_failed(&provider.display_name, &e.to_string());
                }
            }
        }

        let height = self.heights.current_height().await?;
        let safe_height = height.saturating_sub(self.config.safety_buffer);
        tracker.set_safe_height(safe_height);
        info!(
            "Chain height {}, reconciling {} providers up to block {}",
            height,
            registered.len(),
            safe_height
        );

        for provider in &registered {
            match self
                .reconcile_provider(provider, &allow_list, safe_height)
                .await
            {
                Ok(Some(committed)) => tracker.record_processed(
                    committed.added,
                    committed.amount,
                    committed.reached_safe_height,
                ),
                Ok(None) => tracker.record_skipped(),
                Err(e) => {
                    error!("Failed to reconcile {}: {}", provider.display_name, e);
                    tracker.record_failed(&provider.display_name, &e.to_string());
                }
            }
            tracker.log_progress(false);
        }
        tracker.log_progress(true);

        Ok(())
    }

    /// Reconcile and commit one provider. `None` when it was already caught up.
    async fn reconcile_provider(
        &self,
        provider: &Provider,
        allow_list: &AllowList,
        safe_height: u64,
    ) -> Result<Option<Committed>, SyncError> {
        let outcome = self
            .engine
            .reconcile(provider, allow_list, safe_height)
            .await?;
        if outcome.caught_up {
            return Ok(None);
        }

        let added = self
            .ledger
            .apply(provider, &outcome.new_transactions, outcome.new_watermark)
            .await?;
        let amount = outcome
            .new_transactions
            .iter()
            .fold(0u128, |acc, tx| acc.saturating_add(tx.value_raw));

        info!(
            "{}: watermark {} -> {} (safe height {}), {} fetched ({} out of range, {} unregistered), {} new ({} USDC)",
            provider.display_name,
            outcome.previous_watermark,
            outcome.new_watermark,
            safe_height,
            outcome.fetched,
            outcome.out_of_range,
            outcome.unregistered_senders,
            added,
            format_token_amount(amount, self.config.token_decimals)
        );

        Ok(Some(Committed {
            added,
            amount,
            reached_safe_height: outcome.reached_safe_height,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{SqliteLedgerStore, WatermarkPolicy, WatermarkStore};
    use crate::registry::{SqliteNamespaceRegistry, seed_registry};
    use crate::sync::fakes::{FakeHeights, FakeTransferSource, transfer};
    use rusqlite::Connection;

    const WEATHER: &str = "0x000000000000000000000000000000000000abc1";
    const SEARCH: &str = "0x000000000000000000000000000000000000def1";
    const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
    const BOB: &str = "0x0000000000000000000000000000000000000b0b";
    const MALLORY: &str = "0x000000000000000000000000000000000000bad0";

    fn registry(root: Option<&str>) -> Arc<SqliteNamespaceRegistry> {
        let conn = Connection::open_in_memory().unwrap();
        seed_registry(&conn);
        Arc::new(SqliteNamespaceRegistry::from_connection(
            conn,
            root.map(str::to_string),
        ))
    }

    fn config(namespace_root: &str) -> OrchestratorConfig {
        OrchestratorConfig {
            namespace_root: namespace_root.to_string(),
            safety_buffer: 10,
            token_decimals: 6,
            poll_interval: Duration::from_secs(60),
        }
    }

    fn orchestrator(
        source: FakeTransferSource,
        height: Option<u64>,
        namespace_root: &str,
    ) -> (RunOrchestrator, Arc<SqliteLedgerStore>) {
        let store = Arc::new(SqliteLedgerStore::in_memory(WatermarkPolicy::default()).unwrap());
        let engine = ReconciliationEngine::new(Arc::new(source), store.clone(), 100);
        let orchestrator = RunOrchestrator::new(
            registry(Some("grid-wallet.hypr")),
            Arc::new(FakeHeights(height)),
            engine,
            store.clone(),
            store.clone(),
            config(namespace_root),
        );
        (orchestrator, store)
    }

    #[tokio::test]
    async fn run_records_registered_payments() {
        let source = FakeTransferSource::default()
            .with(
                WEATHER,
                vec![
                    transfer("0x01", 100, ALICE, WEATHER, 1_500_000),
                    transfer("0x02", 150, MALLORY, WEATHER, 9_000_000),
                    transfer("0x03", 180, BOB, WEATHER, 250_000),
                ],
            )
            .with(SEARCH, vec![]);
        let (orchestrator, store) = orchestrator(source, Some(1_010), "grid.hypr");

        let report = orchestrator.run_once().await.unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.providers_processed, 2);
        assert_eq!(report.transactions_added, 2);

        let leaderboard = store.leaderboard().unwrap();
        assert_eq!(leaderboard[0].display_name, "weather.grid.hypr");
        assert_eq!(leaderboard[0].stats.total_received, 1_750_000);
        assert_eq!(leaderboard[0].stats.unique_sender_count, 2);
        assert_eq!(leaderboard[1].stats.transaction_count, 0);

        assert_eq!(store.get("0xweather").await.unwrap().last_processed_block, 180);
        assert_eq!(store.get("0xsearch").await.unwrap().last_processed_block, 100);

        let counters = store.run_counters().unwrap();
        assert_eq!(counters.runs_attempted, 1);
        assert_eq!(counters.runs_succeeded, 1);
    }

    #[tokio::test]
    async fn rerunning_the_same_data_is_idempotent() {
        let source = FakeTransferSource::default().with(
            WEATHER,
            vec![transfer("0x01", 100, ALICE, WEATHER, 1_500_000)],
        );
        let (orchestrator, store) = orchestrator(source, Some(1_010), "grid.hypr");

        orchestrator.run_once().await.unwrap();
        let before = store.leaderboard().unwrap();
        let second = orchestrator.run_once().await.unwrap();

        assert_eq!(second.transactions_added, 0);
        assert_eq!(store.leaderboard().unwrap(), before);
        assert!(store.verify_leaderboard().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_provider_does_not_stop_the_run() {
        let source = FakeTransferSource::default()
            .failing_for(WEATHER)
            .with(SEARCH, vec![transfer("0x09", 40, ALICE, SEARCH, 10)]);
        let (orchestrator, store) = orchestrator(source, Some(1_010), "grid.hypr");

        let report = orchestrator.run_once().await.unwrap();
        assert_eq!(report.status, RunStatus::PartiallyFailed);
        assert_eq!(report.providers_failed, 1);
        assert_eq!(report.providers_processed, 1);
        assert!(report.error.unwrap().starts_with("weather.grid.hypr"));

        assert_eq!(store.get("0xweather").await.unwrap().last_processed_block, 0);
        assert_eq!(store.get("0xsearch").await.unwrap().last_processed_block, 40);
        assert_eq!(store.run_counters().unwrap().runs_failed, 1);
    }

    #[tokio::test]
    async fn missing_namespace_fails_the_run() {
        let (orchestrator, store) =
            orchestrator(FakeTransferSource::default(), Some(1_010), "nope.hypr");

        let report = orchestrator.run_once().await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.error.unwrap().contains("nope.hypr"));
        assert!(store.leaderboard().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_height_oracle_fails_the_run() {
        let (orchestrator, store) = orchestrator(FakeTransferSource::default(), None, "grid.hypr");

        let report = orchestrator.run_once().await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        // Providers are registered before the height is needed.
        assert_eq!(store.leaderboard().unwrap().len(), 2);
        assert_eq!(store.get("0xweather").await.unwrap().last_processed_block, 0);
    }

    #[tokio::test]
    async fn caught_up_providers_are_skipped() {
        let (orchestrator, store) = orchestrator(FakeTransferSource::default(), Some(60), "grid.hypr");
        store
            .set("0xweather", 50, crate::ledger::AuditReason::OperatorRepair)
            .await
            .unwrap();

        let report = orchestrator.run_once().await.unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.providers_skipped, 1);
        assert_eq!(report.providers_processed, 1);
    }

    #[tokio::test]
    async fn namespace_without_providers_is_a_successful_noop() {
        let (orchestrator, _) =
            orchestrator(FakeTransferSource::default(), Some(1_010), "grid-wallet.hypr");

        let report = orchestrator.run_once().await.unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.providers_processed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn daemon_repeats_until_shutdown() {
        let (orchestrator, store) = orchestrator(FakeTransferSource::default(), Some(1_010), "grid.hypr");

        orchestrator
            .run_daemon(tokio::time::sleep(Duration::from_secs(150)))
            .await;

        assert_eq!(store.run_counters().unwrap().runs_attempted, 3);
    }
}
