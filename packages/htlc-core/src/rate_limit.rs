//! Per-recipient initiation throttle
//!
//! Each key (the recipient address) may initiate at most `max_per_window`
//! swaps in any trailing `window_seconds`. Keys whose window has emptied are
//! pruned so memory stays proportional to recently active recipients.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::add_seconds;
use crate::error::SwapError;
use crate::hash::remaining_seconds;

/// Prune idle keys once the map grows past this size
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_per_window: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 10,
            window_seconds: 3600,
        }
    }
}

#[derive(Debug)]
pub struct InitiationLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl InitiationLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take one slot for `key`, or fail with `RateLimitExceeded`
    pub async fn try_acquire(&self, key: &str, now: DateTime<Utc>) -> Result<(), SwapError> {
        let mut windows = self.windows.lock().await;
        if windows.len() >= PRUNE_THRESHOLD {
            let before = windows.len();
            windows.retain(|_, stamps| {
                Self::expire(stamps, self.config.window_seconds, now);
                !stamps.is_empty()
            });
            debug!(before, after = windows.len(), "Pruned idle rate limit windows");
        }

        let stamps = windows.entry(key.to_string()).or_default();
        Self::expire(stamps, self.config.window_seconds, now);

        if stamps.len() >= self.config.max_per_window as usize {
            let oldest = stamps.front().copied().unwrap_or(now);
            let frees_at = add_seconds(oldest, self.config.window_seconds);
            return Err(SwapError::RateLimitExceeded {
                limit: self.config.max_per_window,
                window_seconds: self.config.window_seconds,
                retry_after_seconds: remaining_seconds(frees_at, now).max(1),
            });
        }

        stamps.push_back(now);
        Ok(())
    }

    /// Slots left for `key` at `now`
    pub async fn remaining(&self, key: &str, now: DateTime<Utc>) -> u32 {
        let windows = self.windows.lock().await;
        let used = windows
            .get(key)
            .map(|stamps| {
                stamps
                    .iter()
                    .filter(|at| add_seconds(**at, self.config.window_seconds) > now)
                    .count()
            })
            .unwrap_or(0);
        self.config
            .max_per_window
            .saturating_sub(used.min(u32::MAX as usize) as u32)
    }

    fn expire(stamps: &mut VecDeque<DateTime<Utc>>, window_seconds: u64, now: DateTime<Utc>) {
        while let Some(at) = stamps.front() {
            if add_seconds(*at, window_seconds) > now {
                break;
            }
            stamps.pop_front();
        }
    }
}
