use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::trace;

/// Token bucket refilled continuously at `rate_per_sec`, holding at most
/// one second of burst. `acquire` sleeps until a token is available, so
/// callers simply await it before dispatch.
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64) -> Self {
        Self {
            rate_per_sec,
            capacity: rate_per_sec,
            state: Mutex::new(BucketState {
                tokens: rate_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - state.tokens) / self.rate_per_sec,
                    ))
                }
            };

            match wait {
                None => return,
                Some(d) => {
                    trace!(wait_ms = d.as_millis() as u64, "rate limit backpressure");
                    tokio::time::sleep(d).await;
                }
            }
        }
    }
}

/// One bucket per Coinbase rate-limit class.
pub struct ApiBuckets {
    pub public: TokenBucket,
    pub private: TokenBucket,
    pub order: TokenBucket,
}

impl ApiBuckets {
    pub fn new(public_rps: f64, private_rps: f64, order_rps: f64) -> Self {
        Self {
            public: TokenBucket::new(public_rps),
            private: TokenBucket::new(private_rps),
            order: TokenBucket::new(order_rps),
        }
    }
}
