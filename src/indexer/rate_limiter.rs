//! Request spacing for the explorer API.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Hands out one permit per `interval`. Callers wait for their turn instead of being rejected.
#[derive(Debug)]
pub struct RateLimiter {
	interval: Duration,
	next_permit: Mutex<Option<Instant>>,
}

impl RateLimiter {
	pub fn new(interval: Duration) -> Self {
		Self {
			interval,
			next_permit: Mutex::new(None),
		}
	}

	/// Suspend until the next permit is available, then reserve the following slot.
	pub async fn acquire(&self) {
		// The guard is held across the sleep so waiters queue in order.
		let mut next_permit = self.next_permit.lock().await;
		if let Some(at) = *next_permit {
			if at > Instant::now() {
				tokio::time::sleep_until(at).await;
			}
		}
		*next_permit = Some(Instant::now() + self.interval);
	}
}
