//! Leaky-bucket limiter drained by a periodic releaser thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use super::cancel::CancellationToken;
use super::limiter::{check_permits, check_rate, Acquired, RateLimiter};
use crate::error::{LimiterError, Result};

/// How often a blocked caller re-checks its cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// A bounded FIFO of blocked callers, released one per tick.
///
/// `acquire` queues the caller (blocking while the bucket is full) and parks
/// it until a dedicated releaser thread pops it off the head of the queue.
/// The releaser fires every `1 / rate` seconds, so outflow never exceeds
/// `rate` regardless of how bursty the arrivals are.
///
/// Ticks with nobody waiting are not banked: the releaser waits for the next
/// arrival and releases it immediately, then resumes its cadence.
pub struct LeakyBucketLimiter {
    bucket: Arc<Bucket>,
    capacity: usize,
    period: Duration,
    releaser: Option<JoinHandle<()>>,
}

struct Bucket {
    state: Mutex<BucketState>,
    /// Signalled when a slot frees up
    not_full: Condvar,
    /// Signalled when a caller arrives or the bucket closes
    not_empty: Condvar,
}

struct BucketState {
    waiting: VecDeque<Arc<Waiter>>,
    closed: bool,
}

/// A parked caller.
struct Waiter {
    released: Mutex<bool>,
    wake: Condvar,
}

impl Waiter {
    fn new() -> Self {
        Self {
            released: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn release(&self) {
        let mut released = self.released.lock();
        *released = true;
        self.wake.notify_one();
    }

    fn is_released(&self) -> bool {
        *self.released.lock()
    }

    /// Park until released. Returns `false` if cancelled first.
    fn park(&self, cancel: &CancellationToken) -> bool {
        let mut released = self.released.lock();
        while !*released {
            if cancel.is_cancelled() {
                return false;
            }
            self.wake.wait_for(&mut released, CANCEL_POLL);
        }
        true
    }
}

impl LeakyBucketLimiter {
    /// Create a bucket holding at most `capacity` waiting callers, drained
    /// at `rate` callers per second.
    pub fn new(capacity: usize, rate: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(LimiterError::InvalidCapacity);
        }
        check_rate(rate)?;

        let period_micros = (1_000_000.0 / rate) as u64;
        let period = Duration::from_micros(period_micros.max(1));

        let bucket = Arc::new(Bucket {
            state: Mutex::new(BucketState {
                waiting: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        });

        let releaser = {
            let bucket = bucket.clone();
            thread::Builder::new()
                .name("leaky-bucket-releaser".to_string())
                .spawn(move || bucket.run_releaser(period))?
        };

        debug!(capacity = capacity, period = ?period, "Leaky bucket started");

        Ok(Self {
            bucket,
            capacity,
            period,
            releaser: Some(releaser),
        })
    }

    /// Block until the releaser lets this caller through or `cancel` fires.
    ///
    /// A cancelled caller leaves the queue and returns without retrying;
    /// check [`Acquired::is_interrupted`] to tell the two apart.
    pub fn acquire_with(&self, cancel: &CancellationToken) -> Acquired {
        let started = Instant::now();
        let waiter = Arc::new(Waiter::new());

        {
            let mut state = self.bucket.state.lock();
            while state.waiting.len() >= self.capacity {
                if cancel.is_cancelled() {
                    warn!("Cancelled while waiting for a bucket slot");
                    return Acquired::interrupted(started.elapsed());
                }
                self.bucket.not_full.wait_for(&mut state, CANCEL_POLL);
            }
            state.waiting.push_back(waiter.clone());
            trace!(waiting = state.waiting.len(), "Caller queued");
            self.bucket.not_empty.notify_one();
        }

        if waiter.park(cancel) {
            return Acquired::completed(started.elapsed());
        }

        let mut state = self.bucket.state.lock();
        if let Some(position) = state.waiting.iter().position(|w| Arc::ptr_eq(w, &waiter)) {
            state.waiting.remove(position);
            self.bucket.not_full.notify_one();
        } else if waiter.is_released() {
            // The releaser got to us first; the release stands
            return Acquired::completed(started.elapsed());
        }
        warn!("Cancelled while parked in the bucket");
        Acquired::interrupted(started.elapsed())
    }

    /// Number of callers currently queued.
    pub fn waiting(&self) -> usize {
        self.bucket.state.lock().waiting.len()
    }

    /// Maximum number of queued callers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Spacing between releases.
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Bucket {
    fn run_releaser(&self, period: Duration) {
        let mut next_tick = Instant::now();
        let mut state = self.state.lock();
        loop {
            while !state.closed && Instant::now() < next_tick {
                self.not_empty.wait_until(&mut state, next_tick);
            }
            while !state.closed && state.waiting.is_empty() {
                self.not_empty.wait(&mut state);
            }
            if state.closed {
                break;
            }

            let Some(waiter) = state.waiting.pop_front() else {
                continue;
            };
            self.not_full.notify_one();
            waiter.release();
            trace!(waiting = state.waiting.len(), "Released caller");

            let released_at = Instant::now();
            let scheduled = next_tick + period;
            next_tick = if released_at > scheduled {
                released_at + period
            } else {
                scheduled
            };
        }
        debug!("Leaky bucket releaser stopped");
    }
}

impl RateLimiter for LeakyBucketLimiter {
    /// Each permit is one release; `permits` releases are taken in turn.
    fn acquire_permits_with(&self, permits: u32, cancel: &CancellationToken) -> Result<Acquired> {
        check_permits(permits)?;
        let mut waited = Duration::ZERO;
        for _ in 0..permits {
            let acquired = self.acquire_with(cancel);
            waited += acquired.waited();
            if acquired.is_interrupted() {
                return Ok(Acquired::interrupted(waited));
            }
        }
        Ok(Acquired::completed(waited))
    }
}

impl Drop for LeakyBucketLimiter {
    fn drop(&mut self) {
        {
            let mut state = self.bucket.state.lock();
            state.closed = true;
            self.bucket.not_empty.notify_all();
        }
        if let Some(releaser) = self.releaser.take() {
            if releaser.join().is_err() {
                error!("Leaky bucket releaser panicked");
            }
        }
    }
}
