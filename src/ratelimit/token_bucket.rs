//! Token-bucket limiter with burst capacity and reservation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::cancel::CancellationToken;
use super::clock::{Clock, MonotonicClock};
use super::limiter::{check_permits, check_rate, Acquired, RateLimiter};
use crate::error::Result;

/// How many seconds of unused permits the bucket may bank.
pub const MAX_BURST_SECONDS: f64 = 1.0;

const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// A smooth token bucket that lets a caller pre-consume future permits.
///
/// Each acquisition pays off the debt left by the *previous* one and leaves
/// its own debt for whoever comes next. The accounting happens under a
/// mutex; the resulting sleep happens after the mutex is released, so
/// concurrent callers get their answers without queueing behind each
/// other's sleeps.
///
/// Accrual is lazy: permits earned while idle are computed on the next call
/// and capped at `MAX_BURST_SECONDS * rate`.
pub struct TokenBucketLimiter {
    state: Mutex<Reservoir>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
struct Reservoir {
    /// Permits banked while idle, in `[0, max_permits]`
    stored_permits: f64,
    max_permits: f64,
    /// Time to produce one permit
    stable_interval_micros: f64,
    /// When the next caller may proceed without waiting. Never decreases.
    next_free_ticket_micros: u64,
}

impl Reservoir {
    fn resync(&mut self, now_micros: u64) {
        if now_micros > self.next_free_ticket_micros {
            let idle = (now_micros - self.next_free_ticket_micros) as f64;
            let new_permits = idle / self.stable_interval_micros;
            self.stored_permits = self.max_permits.min(self.stored_permits + new_permits);
            self.next_free_ticket_micros = now_micros;
        }
    }

    fn set_rate(&mut self, permits_per_second: f64, now_micros: u64) {
        self.resync(now_micros);
        self.stable_interval_micros = MICROS_PER_SECOND / permits_per_second;

        let old_max_permits = self.max_permits;
        self.max_permits = MAX_BURST_SECONDS * permits_per_second;
        self.stored_permits = if old_max_permits == 0.0 {
            0.0
        } else {
            self.stored_permits * self.max_permits / old_max_permits
        };
    }

    /// Book `permits` and return the instant the caller may proceed.
    fn reserve_earliest_available(&mut self, permits: u32, now_micros: u64) -> u64 {
        self.resync(now_micros);
        let moment_available = self.next_free_ticket_micros;

        let requested = f64::from(permits);
        let spent = requested.min(self.stored_permits);
        let fresh_permits = requested - spent;
        // Float to int casts saturate
        let wait_micros = (fresh_permits * self.stable_interval_micros) as u64;

        self.next_free_ticket_micros = self.next_free_ticket_micros.saturating_add(wait_micros);
        self.stored_permits -= spent;
        moment_available
    }
}

impl TokenBucketLimiter {
    /// Create a limiter issuing `permits_per_second` permits.
    pub fn new(permits_per_second: f64) -> Result<Self> {
        Self::with_clock(permits_per_second, Arc::new(MonotonicClock::new()))
    }

    /// Create a limiter driven by `clock`.
    pub fn with_clock(permits_per_second: f64, clock: Arc<dyn Clock>) -> Result<Self> {
        check_rate(permits_per_second)?;
        let now = now_micros(clock.as_ref());
        let mut reservoir = Reservoir {
            stored_permits: 0.0,
            max_permits: 0.0,
            stable_interval_micros: MICROS_PER_SECOND / permits_per_second,
            next_free_ticket_micros: now,
        };
        reservoir.set_rate(permits_per_second, now);
        Ok(Self {
            state: Mutex::new(reservoir),
            clock,
        })
    }

    /// Change the rate. Banked permits are rescaled to the new burst size.
    pub fn set_rate(&self, permits_per_second: f64) -> Result<()> {
        check_rate(permits_per_second)?;
        let mut state = self.state.lock();
        state.set_rate(permits_per_second, now_micros(self.clock.as_ref()));
        Ok(())
    }

    /// Permits issued per second.
    pub fn rate(&self) -> f64 {
        MICROS_PER_SECOND / self.state.lock().stable_interval_micros
    }

    /// Permits currently banked (as of the last call).
    pub fn stored_permits(&self) -> f64 {
        self.state.lock().stored_permits
    }

    /// The most permits the bucket can bank.
    pub fn max_permits(&self) -> f64 {
        self.state.lock().max_permits
    }

    /// Book `permits` without sleeping and return how long the caller
    /// must wait before proceeding.
    pub fn reserve(&self, permits: u32) -> Result<Duration> {
        check_permits(permits)?;
        let (moment_available, now) = {
            let mut state = self.state.lock();
            let now = now_micros(self.clock.as_ref());
            (state.reserve_earliest_available(permits, now), now)
        };
        let wait = Duration::from_micros(moment_available.saturating_sub(now));
        trace!(permits = permits, wait_micros = wait.as_micros() as u64, "Reserved permits");
        Ok(wait)
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn acquire_permits_with(&self, permits: u32, cancel: &CancellationToken) -> Result<Acquired> {
        let wait = self.reserve(permits)?;
        let started = Instant::now();
        if cancel.sleep(wait) {
            return Ok(Acquired::completed(wait));
        }
        let slept = started.elapsed().min(wait);
        warn!(
            permits = permits,
            wait = ?wait,
            slept = ?slept,
            "Token bucket sleep cancelled; remaining wait dropped"
        );
        Ok(Acquired::interrupted(slept))
    }
}

fn now_micros(clock: &dyn Clock) -> u64 {
    u64::try_from(clock.elapsed().as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimiterError;
    use crate::ratelimit::clock::ManualClock;
    use rand::Rng;
    use std::thread;

    fn limiter_with_clock(rate: f64) -> (TokenBucketLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = TokenBucketLimiter::with_clock(rate, clock.clone()).unwrap();
        (limiter, clock)
    }

    fn next_free_ticket(limiter: &TokenBucketLimiter) -> u64 {
        limiter.state.lock().next_free_ticket_micros
    }

    #[test]
    fn test_invalid_rates_rejected() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(
                matches!(TokenBucketLimiter::new(rate), Err(LimiterError::InvalidRate(_))),
                "rate {} should be rejected",
                rate
            );
        }
    }

    #[test]
    fn test_parameters_derived_from_rate() {
        let (limiter, _clock) = limiter_with_clock(4.0);
        assert!((limiter.rate() - 4.0).abs() < 1e-9);
        assert!((limiter.max_permits() - 4.0).abs() < 1e-9);
        assert_eq!(limiter.stored_permits(), 0.0);
    }

    #[test]
    fn test_first_call_free_second_pays_debt() {
        let (limiter, _clock) = limiter_with_clock(1.0);
        assert_eq!(limiter.reserve(1).unwrap(), Duration::ZERO);
        assert_eq!(limiter.reserve(1).unwrap(), Duration::from_secs(1));
        assert_eq!(limiter.reserve(1).unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn test_acquire_returns_wait_seconds() {
        let (limiter, _clock) = limiter_with_clock(1.0);
        let first = limiter.acquire().unwrap();
        let second = limiter.acquire().unwrap();
        assert!(first.abs() < 1e-6);
        assert!((second - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_large_request_is_paid_by_next_caller() {
        let (limiter, _clock) = limiter_with_clock(2.0);
        // Pre-consumes 10 permits, which take 5 seconds to produce
        assert_eq!(limiter.reserve(10).unwrap(), Duration::ZERO);
        assert_eq!(limiter.reserve(1).unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_idle_time_banks_burst() {
        let (limiter, clock) = limiter_with_clock(1.0);
        clock.advance(Duration::from_secs(10));

        // Idle accrual is capped at one second's worth of permits
        assert_eq!(limiter.reserve(1).unwrap(), Duration::ZERO);
        assert_eq!(limiter.stored_permits(), 0.0);
        assert_eq!(limiter.reserve(1).unwrap(), Duration::ZERO);
        assert_eq!(limiter.reserve(1).unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_debt_shrinks_as_time_passes() {
        let (limiter, clock) = limiter_with_clock(1.0);
        limiter.reserve(1).unwrap();
        clock.advance(Duration::from_millis(400));
        assert_eq!(limiter.reserve(1).unwrap(), Duration::from_millis(600));
        assert_eq!(limiter.reserve(1).unwrap(), Duration::from_millis(1600));
    }

    #[test]
    fn test_zero_permits_rejected_without_mutation() {
        let (limiter, clock) = limiter_with_clock(1.0);
        limiter.reserve(1).unwrap();
        clock.advance(Duration::from_millis(300));

        let stored = limiter.stored_permits();
        let ticket = next_free_ticket(&limiter);

        assert!(matches!(limiter.acquire_permits(0), Err(LimiterError::InvalidPermits(0))));
        assert!(limiter.reserve(0).is_err());

        assert_eq!(limiter.stored_permits(), stored);
        assert_eq!(next_free_ticket(&limiter), ticket);
    }

    #[test]
    fn test_set_rate_rescales_stored_permits() {
        let (limiter, clock) = limiter_with_clock(2.0);
        clock.advance(Duration::from_secs(5));
        limiter.set_rate(4.0).unwrap();

        assert!((limiter.max_permits() - 4.0).abs() < 1e-9);
        assert!((limiter.stored_permits() - 4.0).abs() < 1e-9);
        assert!(limiter.set_rate(0.0).is_err());
        assert!((limiter.rate() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_ticket_saturates_instead_of_wrapping() {
        let (limiter, _clock) = limiter_with_clock(1e-9);
        limiter.reserve(u32::MAX).unwrap();
        limiter.reserve(u32::MAX).unwrap();
        assert_eq!(next_free_ticket(&limiter), u64::MAX);
    }

    #[test]
    fn test_invariants_hold_for_random_sequences() {
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let rate = rng.gen_range(0.5..50.0);
            let (limiter, clock) = limiter_with_clock(rate);
            let mut last_ticket = next_free_ticket(&limiter);

            for _ in 0..200 {
                match rng.gen_range(0..10) {
                    0 => limiter.set_rate(rng.gen_range(0.5..50.0)).unwrap(),
                    1..=4 => clock.advance(Duration::from_micros(rng.gen_range(0..3_000_000))),
                    _ => {
                        limiter.reserve(rng.gen_range(1..=5)).unwrap();
                    }
                }

                let stored = limiter.stored_permits();
                assert!(stored >= 0.0);
                assert!(stored <= limiter.max_permits() + 1e-9);

                let ticket = next_free_ticket(&limiter);
                assert!(ticket >= last_ticket);
                last_ticket = ticket;
            }
        }
    }

    #[test]
    fn test_concurrent_callers_get_staggered_waits() {
        let (limiter, _clock) = limiter_with_clock(10.0);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let limiter = limiter.clone();
                thread::spawn(move || limiter.reserve(1).unwrap())
            })
            .collect();

        let mut waits: Vec<Duration> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        waits.sort();
        assert_eq!(
            waits,
            vec![Duration::ZERO, Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn test_reserve_reads_clock_after_taking_lock() {
        let (limiter, clock) = limiter_with_clock(1.0);
        let limiter = Arc::new(limiter);
        limiter.reserve(1).unwrap();

        let guard = limiter.state.lock();
        let blocked = {
            let limiter = limiter.clone();
            thread::spawn(move || limiter.reserve(1).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        // Permits accrue while the caller waits for the lock
        clock.advance(Duration::from_secs(2));
        drop(guard);

        assert_eq!(blocked.join().unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_sleeping_caller_does_not_hold_lock() {
        let limiter = Arc::new(TokenBucketLimiter::new(1.0).unwrap());
        limiter.reserve(1).unwrap();

        let sleeper = {
            let limiter = limiter.clone();
            thread::spawn(move || limiter.acquire().unwrap())
        };
        // The sleeper has booked its permit once the ticket moves past one second
        while next_free_ticket(&limiter) < 1_500_000 {
            thread::sleep(Duration::from_millis(5));
        }

        let started = Instant::now();
        let wait = limiter.reserve(1).unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "reserve blocked for {:?}",
            started.elapsed()
        );
        assert!(!sleeper.is_finished());
        assert!(wait > Duration::from_millis(1500), "unexpected wait {:?}", wait);

        let slept = sleeper.join().unwrap();
        assert!(slept > 0.5, "sleeper waited {}s", slept);
    }

    #[test]
    fn test_cancelled_sleep_reports_partial_wait() {
        let (limiter, _clock) = limiter_with_clock(1.0);
        limiter.reserve(5).unwrap();

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                cancel.cancel();
            })
        };

        let acquired = limiter.acquire_permits_with(1, &cancel).unwrap();
        canceller.join().unwrap();

        assert!(acquired.is_interrupted());
        assert!(acquired.waited() < Duration::from_secs(5));

        // The booking is not rolled back
        assert_eq!(limiter.reserve(1).unwrap(), Duration::from_secs(6));
    }
}
