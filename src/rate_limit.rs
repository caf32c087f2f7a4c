//! Keyed sliding-window rate limiter.
//!
//! Each key ("broker", "control_poll", "control_send") has its own window.
//! `acquire` waits until a slot frees up instead of failing, so callers can
//! just `limiter.acquire("broker").await` before every outbound call.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Block until a call slot is available for `key`, then claim it.
    /// The wait is bounded by the window length.
    pub async fn acquire(&self, key: &str) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let window = calls.entry(key.to_string()).or_default();
                let now = Instant::now();
                while let Some(&front) = window.front() {
                    if now.duration_since(front) >= self.window {
                        window.pop_front();
                    } else {
                        break;
                    }
                }
                if window.len() < self.max_calls {
                    window.push_back(now);
                    return;
                }
                // oldest call is still inside the window
                let oldest = *window.front().expect("window is non-empty");
                self.window - now.duration_since(oldest)
            };
            debug!(key, wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            sleep(wait).await;
        }
    }

    /// Slots currently free for `key` without claiming one.
    pub async fn remaining(&self, key: &str) -> usize {
        let mut calls = self.calls.lock().await;
        let window = calls.entry(key.to_string()).or_default();
        let now = Instant::now();
        while let Some(&front) = window.front() {
            if now.duration_since(front) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }
        self.max_calls.saturating_sub(window.len())
    }
}
