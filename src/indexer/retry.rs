//! Bounded retry shared by every upstream call.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::future::retry_notify;
use backoff::ExponentialBackoffBuilder;
use tracing::warn;

use super::types::IndexerError;

/// Retry policy: at most `max_attempts` calls, exponential delays between them,
/// and only errors that report themselves retryable are repeated.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			base_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(30),
		}
	}
}

impl RetryPolicy {
	pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
		Self {
			max_attempts: max_attempts.max(1),
			base_delay,
			..Self::default()
		}
	}

	fn schedule(&self) -> impl Backoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(self.base_delay)
			.with_multiplier(2.0)
			.with_randomization_factor(0.1)
			.with_max_interval(self.max_delay)
			.with_max_elapsed_time(None)
			.build()
	}

	/// Run `operation` until it succeeds, fails permanently, or the attempt budget is spent.
	///
	/// Exhaustion is reported as [`IndexerError::UpstreamUnavailable`] carrying the last error.
	pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, IndexerError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, IndexerError>>,
	{
		let max_attempts = self.max_attempts.max(1);
		let mut attempt = 0u32;

		retry_notify(
			self.schedule(),
			|| {
				attempt += 1;
				let current = attempt;
				let call = operation();
				async move {
					call.await.map_err(|e| {
						if !e.is_retryable() {
							backoff::Error::permanent(e)
						} else if current >= max_attempts {
							backoff::Error::permanent(IndexerError::UpstreamUnavailable {
								attempts: current,
								last: Box::new(e),
							})
						} else {
							backoff::Error::transient(e)
						}
					})
				}
			},
			|e: IndexerError, delay: Duration| {
				warn!("{} failed: {}; retrying in {:?}", label, e, delay);
			},
		)
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[tokio::test(start_paused = true)]
	async fn retries_transient_errors_until_success() {
		let calls = AtomicU32::new(0);
		let policy = RetryPolicy::new(4, Duration::from_millis(10));

		let result = policy
			.run("height", || async {
				if calls.fetch_add(1, Ordering::SeqCst) < 2 {
					Err(IndexerError::RateLimited("Max rate limit reached".into()))
				} else {
					Ok(7u64)
				}
			})
			.await
			.unwrap();

		assert_eq!(result, 7);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn gives_up_after_max_attempts() {
		let calls = AtomicU32::new(0);
		let policy = RetryPolicy::new(3, Duration::from_millis(10));

		let err = policy
			.run("height", || async {
				calls.fetch_add(1, Ordering::SeqCst);
				Err::<u64, _>(IndexerError::StatusError(502))
			})
			.await
			.unwrap_err();

		assert_eq!(calls.load(Ordering::SeqCst), 3);
		assert!(matches!(
			err,
			IndexerError::UpstreamUnavailable { attempts: 3, .. }
		));
	}

	#[tokio::test(start_paused = true)]
	async fn does_not_retry_permanent_errors() {
		let calls = AtomicU32::new(0);
		let policy = RetryPolicy::new(5, Duration::from_millis(10));

		let err = policy
			.run("transfers", || async {
				calls.fetch_add(1, Ordering::SeqCst);
				Err::<u64, _>(IndexerError::ApiError("Invalid API Key".into()))
			})
			.await
			.unwrap_err();

		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert!(matches!(err, IndexerError::ApiError(_)));
	}
}
