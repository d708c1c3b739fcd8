//! Rate limiting algorithms and their shared contract.

mod cancel;
mod clock;
mod distributed;
mod fixed_window;
mod leaky_bucket;
mod limiter;
mod token_bucket;

pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use distributed::{
    limit_script_handler, DistributedFixedWindowLimiter, LIMIT_SCRIPT, LIMIT_SCRIPT_SHA1, WINDOW_TTL,
};
pub use fixed_window::{FixedWindowLimiter, TimeWindow, LOCK_TIMEOUT};
pub use leaky_bucket::LeakyBucketLimiter;
pub use limiter::{check_permits, check_rate, Acquired, RateLimiter, TryRateLimiter};
pub use token_bucket::{TokenBucketLimiter, MAX_BURST_SECONDS};
