//! Fixed-window rate limiter keyed by caller (or dependency) name.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
struct Window {
    count: u32,
    reset_at: Instant,
}

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request against `key`.
    ///
    /// Returns the time until the window resets when the key is over its limit.
    /// Expired windows are reset lazily here and purged by [`Self::purge_expired`].
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        match windows.get_mut(key) {
            Some(w) if now < w.reset_at => {
                if w.count >= self.limit {
                    return Err(w.reset_at - now);
                }
                w.count += 1;
                Ok(())
            }
            Some(w) => {
                *w = Window {
                    count: 1,
                    reset_at: now + self.window,
                };
                Ok(())
            }
            None => {
                let _ = windows.insert(
                    key.to_string(),
                    Window {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                Ok(())
            }
        }
    }

    /// Drop windows whose reset time has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now < w.reset_at);
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }
}
