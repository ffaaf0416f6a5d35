use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token-bucket throttle for refresh attempts.
///
/// Tokens leak in lazily on [`acquire`](AsyncRateLimiter::acquire); there is
/// no background timer. The bucket never rejects — a caller short on tokens
/// sleeps for exactly the deficit. Waiters are serviced in FIFO order because
/// the lock is held across the sleep and `tokio::sync::Mutex` queues fairly.
#[derive(Debug)]
pub(crate) struct AsyncRateLimiter {
	rate: f64,
	max_capacity: f64,
	state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
	tokens: f64,
	last_update: Instant,
}

impl AsyncRateLimiter {
	/// `max_capacity` tokens stored at rest, refilled at `rate` tokens per
	/// second.
	pub(crate) fn new(max_capacity: u32, rate: f64) -> Self {
		AsyncRateLimiter {
			rate,
			max_capacity: f64::from(max_capacity),
			state: Mutex::new(BucketState {
				tokens: f64::from(max_capacity),
				last_update: Instant::now(),
			}),
		}
	}

	fn update_token_count(&self, state: &mut BucketState) {
		let now = Instant::now();
		let elapsed = now.duration_since(state.last_update).as_secs_f64();
		state.tokens = (state.tokens + elapsed * self.rate).min(self.max_capacity);
		state.last_update = now;
	}

	/// Block until one token can be removed.
	pub(crate) async fn acquire(&self) {
		let mut state = self.state.lock().await;
		self.update_token_count(&mut state);
		if state.tokens < 1.0 {
			let deficit = 1.0 - state.tokens;
			tokio::time::sleep(Duration::from_secs_f64(deficit / self.rate)).await;
			self.update_token_count(&mut state);
		}
		state.tokens -= 1.0;
	}
}
