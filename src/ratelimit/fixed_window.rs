//! Fixed-window counter limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::cancel::CancellationToken;
use super::clock::{Clock, MonotonicClock};
use super::limiter::TryRateLimiter;
use crate::error::{LimiterError, Result};

/// Upper bound on how long the slow path waits for the window lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(200);

/// Granularity at which a lock wait checks for cancellation.
const LOCK_SLICE: Duration = Duration::from_millis(10);

/// Time window for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    #[default]
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

/// A per-process counter that admits `limit` calls per window.
///
/// The common case is a single lock-free increment. Only once the count runs
/// past `limit` does a caller take the window lock (waiting at most
/// [`LOCK_TIMEOUT`]) to check whether the window has rolled over and reset it.
/// Because the fast-path increment is unconditional, concurrent callers can
/// push the count above `limit` before a reset; they are all denied, so the
/// overshoot costs accuracy of `current_count`, not admissions.
///
/// Under lock contention the limiter fails closed.
pub struct FixedWindowLimiter {
    /// Calls counted in the current window
    count: AtomicU64,
    /// The limit for this counter
    limit: u64,
    /// Time window for this counter
    window: TimeWindow,
    /// When the current window started, on the clock's timeline.
    /// The mutex is also the reset lock.
    window_start: Mutex<Duration>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    /// Create a limiter admitting `limit` calls per second.
    pub fn new(limit: u64) -> Result<Self> {
        Self::with_clock(limit, Arc::new(MonotonicClock::new()))
    }

    /// Create a per-second limiter driven by `clock`.
    pub fn with_clock(limit: u64, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_window(limit, TimeWindow::Second, clock)
    }

    /// Create a limiter admitting `limit` calls per `window`.
    pub fn with_window(limit: u64, window: TimeWindow, clock: Arc<dyn Clock>) -> Result<Self> {
        if limit == 0 {
            return Err(LimiterError::InvalidLimit);
        }
        let window_start = clock.elapsed();
        Ok(Self {
            count: AtomicU64::new(0),
            limit,
            window,
            window_start: Mutex::new(window_start),
            clock,
        })
    }

    /// Decide one call, giving up the slow-path lock wait if `cancel` fires.
    pub fn try_acquire_with(&self, cancel: &CancellationToken) -> bool {
        let added = self.count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if added <= self.limit {
            trace!(count = added, limit = self.limit, "Admitted on fast path");
            return true;
        }

        let Some(mut window_start) = self.lock_window(cancel) else {
            return false;
        };

        let now = self.clock.elapsed();
        if now.saturating_sub(*window_start) >= self.window.duration() {
            debug!(
                previous_count = self.count.load(Ordering::SeqCst),
                limit = self.limit,
                window = ?self.window,
                "Window expired, resetting counter"
            );
            self.count.store(0, Ordering::SeqCst);
            *window_start = now;
        }

        let added = self.count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let admitted = added <= self.limit;
        if !admitted {
            debug!(count = added, limit = self.limit, "Fixed window limit exceeded");
        }
        admitted
    }

    /// Take the reset lock within [`LOCK_TIMEOUT`], or `None` on timeout or
    /// cancellation.
    fn lock_window(&self, cancel: &CancellationToken) -> Option<parking_lot::MutexGuard<'_, Duration>> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            if cancel.is_cancelled() {
                warn!("Fixed window lock wait cancelled, denying");
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(timeout = ?LOCK_TIMEOUT, "Fixed window lock contended, denying");
                return None;
            }
            if let Some(guard) = self.window_start.try_lock_for(remaining.min(LOCK_SLICE)) {
                return Some(guard);
            }
        }
    }

    /// Get the limit for this counter.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Get the time window for this counter.
    pub fn window(&self) -> TimeWindow {
        self.window
    }

    /// Get the raw count, which may exceed the limit.
    pub fn current_count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Get the remaining quota in the current window.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current_count())
    }
}

impl TryRateLimiter for FixedWindowLimiter {
    fn try_acquire(&self) -> bool {
        self.try_acquire_with(&CancellationToken::new())
    }
}
