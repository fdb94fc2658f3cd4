//! Progress tracking for reconciliation runs.
//!
//! The `RunProgressTracker` counts what happened to each provider during a run (reconciled,
//! skipped because already caught up, or failed), accumulates the transactions added, logs
//! progress periodically and produces the [`RunReport`] that is persisted and shown to operators.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::ledger::{RunReport, RunStatus};
use crate::utils::format_token_amount;

/// Service for tracking the progress of a single run
#[derive(Debug, Clone)]
pub struct RunProgressTracker {
    /// Providers discovered for this run
    providers_total: usize,
    /// Providers whose range was scanned and committed
    providers_processed: usize,
    /// Providers already at the safe height
    providers_skipped: usize,
    /// Providers whose reconciliation failed, with the error text
    failures: Vec<(String, String)>,
    /// Transactions newly written to the ledger
    transactions_added: usize,
    /// Raw token units newly credited across all providers
    amount_added: u128,
    /// Providers that reached the safe height this run
    reached_safe_height: usize,
    /// Safe height the run reconciled against, once known
    safe_height: Option<u64>,
    /// Error that aborted the whole run
    fatal_error: Option<String>,
    started: Instant,
}

impl RunProgressTracker {
    pub fn new(providers_total: usize) -> Self {
        Self {
            providers_total,
            providers_processed: 0,
            providers_skipped: 0,
            failures: Vec::new(),
            transactions_added: 0,
            amount_added: 0,
            reached_safe_height: 0,
            safe_height: None,
            fatal_error: None,
            started: Instant::now(),
        }
    }

    pub fn set_providers_total(&mut self, providers_total: usize) {
        self.providers_total = providers_total;
    }

    pub fn set_safe_height(&mut self, safe_height: u64) {
        self.safe_height = Some(safe_height);
    }

    /// Record a provider whose outcome was committed.
    pub fn record_processed(&mut self, added: usize, amount: u128, reached_safe_height: bool) {
        self.providers_processed += 1;
        self.transactions_added += added;
        self.amount_added = self.amount_added.saturating_add(amount);
        if reached_safe_height {
            self.reached_safe_height += 1;
        }
    }

    /// Record a provider with nothing to scan.
    pub fn record_skipped(&mut self) {
        self.providers_skipped += 1;
    }

    pub fn record_failed(&mut self, provider: &str, error: &str) {
        self.failures.push((provider.to_string(), error.to_string()));
    }

    /// Record an error that ended the run before every provider could be attempted.
    pub fn record_fatal(&mut self, error: &str) {
        self.fatal_error = Some(error.to_string());
    }

    fn providers_done(&self) -> usize {
        self.providers_processed + self.providers_skipped + self.failures.len()
    }

    /// Log progress every ten providers or when forced
    pub fn log_progress(&self, force: bool) {
        let done = self.providers_done();
        if force || (done > 0 && done % 10 == 0) {
            info!(
                "Run progress: {}/{} providers, {} transactions added",
                done, self.providers_total, self.transactions_added
            );
        }
    }

    /// Terminal status: any fatal error, or a run in which every attempted provider failed,
    /// is a failure; some failures make it partial.
    pub fn status(&self) -> RunStatus {
        if self.fatal_error.is_some() {
            RunStatus::Failed
        } else if self.failures.is_empty() {
            RunStatus::Succeeded
        } else if self.providers_processed + self.providers_skipped == 0 {
            RunStatus::Failed
        } else {
            RunStatus::PartiallyFailed
        }
    }

    pub fn get_stats(&self) -> RunStats {
        RunStats {
            safe_height: self.safe_height,
            providers_total: self.providers_total,
            providers_processed: self.providers_processed,
            providers_skipped: self.providers_skipped,
            providers_failed: self.failures.len(),
            reached_safe_height: self.reached_safe_height,
            transactions_added: self.transactions_added,
            amount_added: self.amount_added,
            elapsed: self.started.elapsed(),
        }
    }

    /// Warn about every failed provider and build the report for this run.
    pub fn into_report(self) -> RunReport {
        for (provider, error) in &self.failures {
            warn!("Provider {} failed: {}", provider, error);
        }

        let status = self.status();
        let error = self.fatal_error.clone().or_else(|| match self.failures.as_slice() {
            [] => None,
            [(provider, error)] => Some(format!("{}: {}", provider, error)),
            [(provider, error), rest @ ..] => Some(format!(
                "{}: {} (and {} more failed providers)",
                provider,
                error,
                rest.len()
            )),
        });

        RunReport {
            status,
            providers_processed: self.providers_processed,
            providers_skipped: self.providers_skipped,
            providers_failed: self.failures.len(),
            transactions_added: self.transactions_added,
            error,
        }
    }
}

/// Statistics about a run
#[derive(Debug, Clone)]
pub struct RunStats {
    pub safe_height: Option<u64>,
    pub providers_total: usize,
    pub providers_processed: usize,
    pub providers_skipped: usize,
    pub providers_failed: usize,
    pub reached_safe_height: usize,
    pub transactions_added: usize,
    pub amount_added: u128,
    pub elapsed: Duration,
}

impl RunStats {
    /// Get a human-readable summary of the run
    pub fn summary(&self, token_decimals: u32) -> String {
        format!(
            "Run to block {}: {}/{} providers processed ({} at safe height), {} skipped, {} failed; {} transactions, {} USDC added in {:.1}s",
            self.safe_height
                .map(|h| h.to_string())
                .unwrap_or_else(|| "?".to_string()),
            self.providers_processed,
            self.providers_total,
            self.reached_safe_height,
            self.providers_skipped,
            self.providers_failed,
            self.transactions_added,
            format_token_amount(self.amount_added, token_decimals),
            self.elapsed.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_run_succeeds() {
        let mut tracker = RunProgressTracker::new(3);
        tracker.record_processed(2, 3_500_000, true);
        tracker.record_processed(0, 0, false);
        tracker.record_skipped();

        let stats = tracker.get_stats();
        assert_eq!(stats.transactions_added, 2);
        assert_eq!(stats.reached_safe_height, 1);
        assert!(stats.summary(6).contains("3.500000 USDC"));

        let report = tracker.into_report();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.providers_processed, 2);
        assert_eq!(report.providers_skipped, 1);
        assert_eq!(report.error, None);
    }

    #[test]
    fn some_failures_make_a_partial_run() {
        let mut tracker = RunProgressTracker::new(3);
        tracker.record_processed(1, 1, false);
        tracker.record_failed("search.grid.hypr", "Indexer error: upstream unavailable");
        tracker.record_failed("maps.grid.hypr", "Ledger error: database is locked");

        let report = tracker.into_report();
        assert_eq!(report.status, RunStatus::PartiallyFailed);
        assert_eq!(report.providers_failed, 2);
        assert_eq!(
            report.error.as_deref(),
            Some("search.grid.hypr: Indexer error: upstream unavailable (and 1 more failed providers)")
        );
    }

    #[test]
    fn all_providers_failing_fails_the_run() {
        let mut tracker = RunProgressTracker::new(1);
        tracker.record_failed("search.grid.hypr", "boom");
        assert_eq!(tracker.status(), RunStatus::Failed);
    }

    #[test]
    fn fatal_error_wins() {
        let mut tracker = RunProgressTracker::new(0);
        tracker.record_fatal("Registry error: Namespace not found: grid.hypr");
        let report = tracker.into_report();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(
            report.error.as_deref(),
            Some("Registry error: Namespace not found: grid.hypr")
        );
    }

    #[test]
    fn empty_run_succeeds() {
        assert_eq!(RunProgressTracker::new(0).status(), RunStatus::Succeeded);
    }
}
