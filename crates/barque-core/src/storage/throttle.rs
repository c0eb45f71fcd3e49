use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Process-wide byte-per-second token bucket. One instance throttles one
/// transfer direction; a zero rate disables throttling.
pub struct TokenBucket {
    rate: u64,
    state: Mutex<BucketState>,
}

struct BucketState {
    available: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_second: u64) -> Self {
        TokenBucket {
            rate: bytes_per_second,
            state: Mutex::new(BucketState {
                available: bytes_per_second as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Block until `bytes` tokens are available, then consume them.
    /// Requests larger than one second's budget drain in rate-sized gulps.
    pub fn consume(&self, bytes: u64) {
        if self.rate == 0 || bytes == 0 {
            return;
        }
        let mut remaining = bytes as f64;
        let capacity = self.rate as f64;
        while remaining > 0.0 {
            let wait = {
                let mut state = self.state.lock().unwrap();
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.available = (state.available + elapsed * capacity).min(capacity);
                state.last_refill = Instant::now();

                if state.available >= 1.0 {
                    let take = state.available.min(remaining);
                    state.available -= take;
                    remaining -= take;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - state.available) / capacity,
                    ))
                }
            };
            if let Some(wait) = wait {
                std::thread::sleep(wait.min(Duration::from_millis(250)));
            }
        }
    }
}
