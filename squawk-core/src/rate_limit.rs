// ABOUTME: Sliding-window rate limiter for outbound chat messages
// ABOUTME: Callers wait for a slot instead of having messages dropped

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Message cap Twitch applies to a regular account
pub const DEFAULT_BURST: usize = 20;
/// Sliding window the cap applies over
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);

/// Sliding-window limiter: at most `burst` sends inside any `window`.
///
/// `acquire` blocks until a slot is free and records the claim before
/// returning, so concurrent callers each take their own slot. Claims are
/// never dropped; a burst of callers drains out in acquisition order.
pub struct RateLimiter {
    burst: usize,
    window: Duration,
    sends: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(burst: usize, window: Duration) -> Self {
        Self {
            // A zero burst would never admit anything
            burst: burst.max(1),
            window,
            sends: Mutex::new(VecDeque::new()),
        }
    }

    /// Limiter matching Twitch's per-channel message throttle
    pub fn twitch_default() -> Self {
        Self::new(DEFAULT_BURST, DEFAULT_WINDOW)
    }

    /// Wait until a send slot is free and claim it.
    ///
    /// After each sleep the bucket is re-checked, since another caller may
    /// have claimed the freed slot first.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut sends = self.sends.lock().await;
                let now = Instant::now();
                while let Some(front) = sends.front() {
                    if now.duration_since(*front) >= self.window {
                        sends.pop_front();
                    } else {
                        break;
                    }
                }
                if sends.len() < self.burst {
                    sends.push_back(now);
                    return;
                }
                let Some(oldest) = sends.front().copied() else {
                    sends.push_back(now);
                    return;
                };
                // Lock drops here so other senders are not queued behind
                // this sleep.
                self.window - now.duration_since(oldest)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Number of sends currently recorded in the bucket
    pub async fn len(&self) -> usize {
        self.sends.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sends.lock().await.is_empty()
    }
}
