//! Burst, hourly and daily send limits.
//!
//! Every recorded send costs one unit in all three windows at once. The
//! windows are checked in order burst → hourly → daily and the first one
//! that is full decides both the verdict and the wait estimate.
//!
//! Checking ([`RateLimiter::can_schedule`]) and committing
//! ([`RateLimiter::record_scheduled`]) are separate calls: callers may ask
//! without spending budget and must record exactly once per actual dispatch.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::{start_of_local_day, TimeSource};
use crate::error::ConfigError;
use crate::storage::StateSlot;

/// Longest accepted burst window: one day.
pub const MAX_BURST_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Rate limit thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sends allowed per burst window
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,
    /// Length of the burst window in seconds
    #[serde(default = "default_burst_window_secs")]
    pub burst_window_secs: u64,
    /// Sends allowed per sliding hour
    #[serde(default = "default_hourly_limit")]
    pub hourly_limit: u32,
    /// Sends allowed per local calendar day (None = unlimited)
    #[serde(default)]
    pub daily_limit: Option<u32>,
}

fn default_burst_limit() -> u32 {
    3
}
fn default_burst_window_secs() -> u64 {
    60
}
fn default_hourly_limit() -> u32 {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_limit: default_burst_limit(),
            burst_window_secs: default_burst_window_secs(),
            hourly_limit: default_hourly_limit(),
            daily_limit: None,
        }
    }
}

impl RateLimitConfig {
    /// Rejects zero limits and a zero-length burst window.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.burst_limit == 0 {
            return Err(ConfigError::ZeroRateLimit("burst_limit"));
        }
        if self.burst_window_secs == 0 {
            return Err(ConfigError::ZeroRateLimit("burst_window_secs"));
        }
        if self.burst_window_secs > MAX_BURST_WINDOW_SECS {
            return Err(ConfigError::InvalidValue {
                key: "burst_window_secs".into(),
                message: format!("must be at most {MAX_BURST_WINDOW_SECS} seconds"),
            });
        }
        if self.hourly_limit == 0 {
            return Err(ConfigError::ZeroRateLimit("hourly_limit"));
        }
        if self.daily_limit == Some(0) {
            return Err(ConfigError::ZeroRateLimit("daily_limit"));
        }
        Ok(())
    }

    /// Only called on validated configs, where the window is at most a day.
    fn burst_window(&self) -> Duration {
        Duration::seconds(self.burst_window_secs.min(MAX_BURST_WINDOW_SECS) as i64)
    }
}

/// One of the three limit windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateWindow {
    Burst,
    Hourly,
    Daily,
}

impl RateWindow {
    pub fn as_str(self) -> &'static str {
        match self {
            RateWindow::Burst => "burst",
            RateWindow::Hourly => "hourly",
            RateWindow::Daily => "daily",
        }
    }
}

/// Send timestamps per window, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCounters {
    burst: VecDeque<DateTime<Utc>>,
    hourly: VecDeque<DateTime<Utc>>,
    daily: VecDeque<DateTime<Utc>>,
}

impl RateCounters {
    /// Sends currently held by `window`.
    pub fn count(&self, window: RateWindow) -> usize {
        self.window(window).len()
    }

    fn window(&self, window: RateWindow) -> &VecDeque<DateTime<Utc>> {
        match window {
            RateWindow::Burst => &self.burst,
            RateWindow::Hourly => &self.hourly,
            RateWindow::Daily => &self.daily,
        }
    }

    fn newest(&self) -> Option<DateTime<Utc>> {
        [&self.burst, &self.hourly, &self.daily]
            .into_iter()
            .filter_map(|w| w.back().copied())
            .max()
    }

    fn push(&mut self, at: DateTime<Utc>) {
        self.burst.push_back(at);
        self.hourly.push_back(at);
        self.daily.push_back(at);
    }

    fn clear(&mut self) {
        self.burst.clear();
        self.hourly.clear();
        self.daily.clear();
    }

    /// Restores ordering of a snapshot written by an older or damaged
    /// process.
    fn normalize(&mut self) {
        for window in [&mut self.burst, &mut self.hourly, &mut self.daily] {
            window.make_contiguous().sort();
        }
    }
}

/// Point-in-time view of the limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub burst_count: u32,
    pub burst_limit: u32,
    pub hourly_count: u32,
    pub hourly_limit: u32,
    pub daily_count: u32,
    pub daily_limit: Option<u32>,
    /// Window currently blocking sends, if any
    pub blocked_by: Option<RateWindow>,
    /// Seconds until a send is allowed again
    pub retry_after_secs: Option<i64>,
}

/// Sliding-window rate limiter with persisted counters.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn TimeSource>,
    slot: StateSlot,
    counters: Mutex<RateCounters>,
}

impl RateLimiter {
    /// Create a limiter, restoring counters from `slot` when present.
    pub fn new(
        config: RateLimitConfig,
        clock: Arc<dyn TimeSource>,
        slot: StateSlot,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut counters = slot.load::<RateCounters>().unwrap_or_default();
        counters.normalize();
        tracing::debug!(
            burst = counters.count(RateWindow::Burst),
            hourly = counters.count(RateWindow::Hourly),
            daily = counters.count(RateWindow::Daily),
            "rate limiter restored"
        );
        Ok(Self {
            config,
            clock,
            slot,
            counters: Mutex::new(counters),
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Whether a send would be admitted right now. Does not consume budget.
    pub fn can_schedule(&self) -> bool {
        let now = self.clock.now();
        let mut counters = self.lock();
        self.purge(&mut counters, now);
        self.first_violation(&counters, now).is_none()
    }

    /// Records one send against all three windows and persists the result.
    pub fn record_scheduled(&self) {
        let now = self.clock.now();
        let mut counters = self.lock();
        self.purge(&mut counters, now);
        // Keep every window non-decreasing even if the clock stepped back.
        let at = counters.newest().map_or(now, |newest| newest.max(now));
        counters.push(at);
        tracing::debug!(
            burst = counters.count(RateWindow::Burst),
            hourly = counters.count(RateWindow::Hourly),
            daily = counters.count(RateWindow::Daily),
            "send recorded"
        );
        self.slot.save(&*counters);
    }

    /// Sends left in the current sliding hour.
    pub fn remaining_this_hour(&self) -> u32 {
        let now = self.clock.now();
        let mut counters = self.lock();
        self.purge(&mut counters, now);
        remaining(self.config.hourly_limit, counters.count(RateWindow::Hourly))
    }

    /// Sends left today, `None` when there is no daily cap.
    pub fn remaining_today(&self) -> Option<u32> {
        let now = self.clock.now();
        let mut counters = self.lock();
        self.purge(&mut counters, now);
        self.config
            .daily_limit
            .map(|limit| remaining(limit, counters.count(RateWindow::Daily)))
    }

    /// Sends left in the current burst window.
    pub fn remaining_in_burst(&self) -> u32 {
        let now = self.clock.now();
        let mut counters = self.lock();
        self.purge(&mut counters, now);
        remaining(self.config.burst_limit, counters.count(RateWindow::Burst))
    }

    /// How long until a send is admitted; `None` if one is admitted now.
    pub fn time_until_next_allowed(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut counters = self.lock();
        self.purge(&mut counters, now);
        self.first_violation(&counters, now).map(|(_, wait)| wait)
    }

    /// Wipes all three windows.
    pub fn reset(&self) {
        let mut counters = self.lock();
        counters.clear();
        tracing::info!("rate limiter reset");
        self.slot.save(&*counters);
    }

    pub fn status(&self) -> RateLimitStatus {
        let now = self.clock.now();
        let mut counters = self.lock();
        self.purge(&mut counters, now);
        let violation = self.first_violation(&counters, now);
        RateLimitStatus {
            burst_count: counters.count(RateWindow::Burst) as u32,
            burst_limit: self.config.burst_limit,
            hourly_count: counters.count(RateWindow::Hourly) as u32,
            hourly_limit: self.config.hourly_limit,
            daily_count: counters.count(RateWindow::Daily) as u32,
            daily_limit: self.config.daily_limit,
            blocked_by: violation.map(|(window, _)| window),
            retry_after_secs: violation.map(|(_, wait)| wait.num_seconds()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops timestamps that fell out of their window.
    fn purge(&self, counters: &mut RateCounters, now: DateTime<Utc>) {
        let burst_horizon = now - self.config.burst_window();
        while counters.burst.front().is_some_and(|t| *t <= burst_horizon) {
            counters.burst.pop_front();
        }

        let hour_horizon = now - Duration::hours(1);
        while counters.hourly.front().is_some_and(|t| *t <= hour_horizon) {
            counters.hourly.pop_front();
        }

        let day_start = self.day_start(now);
        while counters.daily.front().is_some_and(|t| *t < day_start) {
            counters.daily.pop_front();
        }
    }

    /// First full window and how long until it frees a slot.
    fn first_violation(
        &self,
        counters: &RateCounters,
        now: DateTime<Utc>,
    ) -> Option<(RateWindow, Duration)> {
        if counters.burst.len() >= self.config.burst_limit as usize {
            let wait = counters
                .burst
                .front()
                .map_or(Duration::zero(), |oldest| *oldest + self.config.burst_window() - now);
            return Some((RateWindow::Burst, wait.max(Duration::zero())));
        }

        if counters.hourly.len() >= self.config.hourly_limit as usize {
            let wait = counters
                .hourly
                .front()
                .map_or(Duration::zero(), |oldest| *oldest + Duration::hours(1) - now);
            return Some((RateWindow::Hourly, wait.max(Duration::zero())));
        }

        if let Some(limit) = self.config.daily_limit {
            if counters.daily.len() >= limit as usize {
                let wait = self.day_start(now) + Duration::days(1) - now;
                return Some((RateWindow::Daily, wait.max(Duration::zero())));
            }
        }

        None
    }

    fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let offset = self.clock.offset();
        start_of_local_day(offset, now.with_timezone(&offset).date_naive())
    }
}

fn remaining(limit: u32, used: usize) -> u32 {
    limit.saturating_sub(u32::try_from(used).unwrap_or(u32::MAX))
}
