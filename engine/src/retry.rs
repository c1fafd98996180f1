//! One retry policy object per component.
//!
//! Delays grow exponentially per attempt and carry jitter; a delay is never
//! less than half its nominal value so retries cannot collapse into a tight
//! loop. What happens once attempts are exhausted is part of the policy,
//! not of the call site.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OnExhausted {
	/// Negative-ack with requeue; the bus redelivers later.
	Requeue,
	/// Divert the affected messages to the review queue.
	ToReview,
	/// Give up and stop the process.
	FailProcess,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub multiplier: u32,
	pub on_exhausted: OnExhausted,
}

const MAX_DELAY: Duration = Duration::from_secs(10 * 60);

impl RetryPolicy {
	pub fn aggregator_batches(settings: &crate::settings::Aggregator) -> Self {
		Self {
			max_attempts: settings.max_retry,
			base_delay: Duration::from_millis(settings.retry_base_ms),
			multiplier: 2,
			on_exhausted: OnExhausted::ToReview,
		}
	}

	/// Nominal (unjittered) delay before retrying after `attempt` failures,
	/// zero-based: attempt 0 waits `base_delay`.
	pub fn delay(&self, attempt: u32) -> Duration {
		std::cmp::min(
			MAX_DELAY,
			self.base_delay.saturating_mul(self.multiplier.saturating_pow(attempt)),
		)
	}

	/// Delay with jitter applied, in `[delay/2, delay)`.
	pub fn jittered_delay(&self, attempt: u32) -> Duration {
		let half = self.delay(attempt) / 2;
		if half.is_zero() {
			return Duration::ZERO;
		}
		half + rand::thread_rng().gen_range(Duration::ZERO..half)
	}

	/// Run `operation` until it succeeds or attempts are exhausted,
	/// sleeping the jittered delay between attempts. Returns the last
	/// error when exhausted; the caller applies `on_exhausted`.
	pub async fn run<T, E, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, E>
	where
		E: std::fmt::Display,
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = Result<T, E>>,
	{
		let mut attempt = 0;
		loop {
			match operation().await {
				Ok(value) => return Ok(value),
				Err(error) => {
					attempt += 1;
					if attempt >= self.max_attempts {
						tracing::error!(
							"{name}: attempt {attempt}/{} failed, giving up: {error}",
							self.max_attempts
						);
						return Err(error);
					}
					let sleep_duration = self.jittered_delay(attempt - 1);
					tracing::warn!(
						"{name}: attempt {attempt}/{} failed: {error}. Delaying for {}ms",
						self.max_attempts,
						sleep_duration.as_millis()
					);
					tokio::time::sleep(sleep_duration).await;
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	fn policy(max_attempts: u32) -> RetryPolicy {
		RetryPolicy {
			max_attempts,
			base_delay: Duration::from_millis(1),
			multiplier: 2,
			on_exhausted: OnExhausted::ToReview,
		}
	}

	#[test]
	fn delays_double_per_attempt_and_cap() {
		let policy = RetryPolicy {
			max_attempts: 3,
			base_delay: Duration::from_millis(1000),
			multiplier: 2,
			on_exhausted: OnExhausted::ToReview,
		};
		assert_eq!(policy.delay(0), Duration::from_millis(1000));
		assert_eq!(policy.delay(1), Duration::from_millis(2000));
		assert_eq!(policy.delay(2), Duration::from_millis(4000));
		assert_eq!(policy.delay(100), MAX_DELAY);
	}

	#[test]
	fn jitter_stays_within_bounds() {
		let policy = policy(3);
		for attempt in 0..4 {
			let nominal = policy.delay(attempt);
			for _ in 0..16 {
				let jittered = policy.jittered_delay(attempt);
				assert!(jittered >= nominal / 2);
				assert!(jittered < nominal);
			}
		}
	}

	#[tokio::test]
	async fn run_stops_after_max_attempts() {
		let calls = AtomicU32::new(0);
		let result: Result<(), &str> = policy(3)
			.run("test", || {
				calls.fetch_add(1, Ordering::Relaxed);
				async { Err("nope") }
			})
			.await;
		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::Relaxed), 3);
	}

	#[tokio::test]
	async fn run_returns_first_success() {
		let calls = AtomicU32::new(0);
		let result: Result<u32, &str> = policy(5)
			.run("test", || {
				let n = calls.fetch_add(1, Ordering::Relaxed);
				async move {
					if n < 2 {
						Err("not yet")
					} else {
						Ok(n)
					}
				}
			})
			.await;
		assert_eq!(result.unwrap(), 2);
		assert_eq!(calls.load(Ordering::Relaxed), 3);
	}
}
