//! The contract shared by every limiter.

use std::time::Duration;

use super::cancel::CancellationToken;
use crate::error::{LimiterError, Result};

/// Outcome of a blocking acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    waited: Duration,
    interrupted: bool,
}

impl Acquired {
    /// The caller waited the full `waited` duration.
    pub fn completed(waited: Duration) -> Self {
        Self {
            waited,
            interrupted: false,
        }
    }

    /// The wait was cut short after `waited`.
    pub fn interrupted(waited: Duration) -> Self {
        Self {
            waited,
            interrupted: true,
        }
    }

    /// Time charged to the caller.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Time charged to the caller, in seconds.
    pub fn seconds(&self) -> f64 {
        self.waited.as_secs_f64()
    }

    /// Whether a cancellation ended the wait early.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }
}

/// A limiter that blocks the caller until the requested permits are granted.
///
/// Implementors supply [`acquire_permits_with`](Self::acquire_permits_with);
/// the single-permit and non-cancellable forms come for free.
pub trait RateLimiter: Send + Sync {
    /// Acquire `permits`, blocking until granted or until `cancel` fires.
    ///
    /// Fails only when `permits` is zero, before any state is touched.
    fn acquire_permits_with(&self, permits: u32, cancel: &CancellationToken) -> Result<Acquired>;

    /// Acquire `permits` and return the seconds spent waiting.
    fn acquire_permits(&self, permits: u32) -> Result<f64> {
        let acquired = self.acquire_permits_with(permits, &CancellationToken::new())?;
        Ok(acquired.seconds())
    }

    /// Acquire a single permit and return the seconds spent waiting.
    fn acquire(&self) -> Result<f64> {
        self.acquire_permits(1)
    }
}

/// A limiter that answers immediately instead of blocking.
pub trait TryRateLimiter: Send + Sync {
    /// Returns `true` if the caller may proceed.
    fn try_acquire(&self) -> bool;
}

/// Reject a permit request of zero.
pub fn check_permits(permits: u32) -> Result<()> {
    if permits == 0 {
        return Err(LimiterError::InvalidPermits(permits));
    }
    Ok(())
}

/// Reject rates that are not strictly positive and finite.
pub fn check_rate(rate: f64) -> Result<()> {
    if rate.is_nan() || rate <= 0.0 || rate.is_infinite() {
        return Err(LimiterError::InvalidRate(rate));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records the permit count it was asked for.
    #[derive(Default)]
    struct RecordingLimiter {
        last_permits: AtomicU32,
    }

    impl RateLimiter for RecordingLimiter {
        fn acquire_permits_with(
            &self,
            permits: u32,
            _cancel: &CancellationToken,
        ) -> Result<Acquired> {
            check_permits(permits)?;
            self.last_permits.store(permits, Ordering::SeqCst);
            Ok(Acquired::completed(Duration::from_millis(500)))
        }
    }

    #[test]
    fn test_acquire_defaults_to_one_permit() {
        let limiter = RecordingLimiter::default();
        let waited = limiter.acquire().unwrap();
        assert_eq!(limiter.last_permits.load(Ordering::SeqCst), 1);
        assert!((waited - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_acquire_permits_forwards_count() {
        let limiter = RecordingLimiter::default();
        limiter.acquire_permits(7).unwrap();
        assert_eq!(limiter.last_permits.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_zero_permits_rejected() {
        let limiter = RecordingLimiter::default();
        let err = limiter.acquire_permits(0).unwrap_err();
        assert!(matches!(err, LimiterError::InvalidPermits(0)));
        assert_eq!(limiter.last_permits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_check_rate() {
        assert!(check_rate(1.0).is_ok());
        assert!(check_rate(0.5).is_ok());
        assert!(check_rate(0.0).is_err());
        assert!(check_rate(-3.0).is_err());
        assert!(check_rate(f64::NAN).is_err());
        assert!(check_rate(f64::INFINITY).is_err());
    }

    #[test]
    fn test_acquired_accessors() {
        let done = Acquired::completed(Duration::from_millis(1500));
        assert!(!done.is_interrupted());
        assert!((done.seconds() - 1.5).abs() < 1e-9);

        let cut = Acquired::interrupted(Duration::from_millis(10));
        assert!(cut.is_interrupted());
        assert_eq!(cut.waited(), Duration::from_millis(10));
    }
}
