//! Distributed fixed-window limiter backed by an atomic store script.
//!
//! Every process shares one counter key on the store. The counting step runs
//! as a script on the store so that increment, compare and expiry happen
//! atomically with respect to all other clients.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::{debug, error, trace, warn};

use super::limiter::TryRateLimiter;
use crate::error::{LimiterError, Result};
use crate::store::{script_sha1, Keyspace, ScriptExecutor, StoreError};

/// Counts one call against `KEYS[1]` with limit `ARGV[1]`; returns 1 to admit,
/// 0 to deny. The first increment of a window sets a one second TTL.
///
/// The text is hashed for `EVALSHA`; any edit changes [`LIMIT_SCRIPT_SHA1`].
pub const LIMIT_SCRIPT: &str = concat!(
    "local key = KEYS[1] ",
    "local limit = tonumber(ARGV[1]) ",
    "local current = tonumber(redis.call('incr', key)) ",
    "if current > limit then ",
    "   return 0 ",
    "elseif current == 1 then ",
    "   redis.call('expire', key, '1') ",
    "end ",
    "return 1 ",
);

/// SHA-1 of [`LIMIT_SCRIPT`], computed once.
pub static LIMIT_SCRIPT_SHA1: Lazy<String> = Lazy::new(|| script_sha1(LIMIT_SCRIPT));

/// Lifetime of a window's counter key.
pub const WINDOW_TTL: Duration = Duration::from_secs(1);

/// Native equivalent of [`LIMIT_SCRIPT`] for [`MemoryStore`](crate::store::MemoryStore).
pub fn limit_script_handler(
    keyspace: &mut Keyspace,
    keys: &[&str],
    args: &[&str],
) -> std::result::Result<i64, StoreError> {
    let key = keys
        .first()
        .ok_or_else(|| StoreError::Response("limit script needs KEYS[1]".to_string()))?;
    let limit: i64 = args
        .first()
        .and_then(|arg| arg.parse().ok())
        .ok_or_else(|| StoreError::Response("limit script needs a numeric ARGV[1]".to_string()))?;

    let current = keyspace.incr(key)?;
    if current > limit {
        return Ok(0);
    }
    if current == 1 {
        keyspace.expire(key, WINDOW_TTL);
    }
    Ok(1)
}

/// A fixed-window limiter whose counter lives on a shared store.
///
/// Holds no mutable local state. Each decision is one `EVALSHA` round trip;
/// if that fails for any reason (script evicted, store restarted, transient
/// error) the full script is sent with `EVAL`, which also re-primes the
/// store's script cache. If `EVAL` fails too, the call is denied.
pub struct DistributedFixedWindowLimiter {
    key: String,
    limit: u64,
    /// `limit` as sent in `ARGV[1]`
    limit_arg: String,
    executor: Arc<dyn ScriptExecutor>,
}

impl DistributedFixedWindowLimiter {
    /// Create a limiter admitting `limit` calls per second across every
    /// process that shares `key` on the store behind `executor`.
    pub fn new(key: impl Into<String>, limit: u64, executor: Arc<dyn ScriptExecutor>) -> Result<Self> {
        if limit == 0 {
            return Err(LimiterError::InvalidLimit);
        }
        Ok(Self {
            key: key.into(),
            limit,
            limit_arg: limit.to_string(),
            executor,
        })
    }

    /// The store key holding the window counter.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Calls admitted per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Load the limit script into the store's cache so the first decision
    /// is a single `EVALSHA`.
    ///
    /// Optional: `try_acquire` primes the cache itself on a miss.
    pub fn preload_script(&self) -> Result<()> {
        let sha1 = self.executor.script_load(LIMIT_SCRIPT)?;
        if sha1 != *LIMIT_SCRIPT_SHA1 {
            return Err(StoreError::Response(format!(
                "store hashed limit script as {}, expected {}",
                sha1, *LIMIT_SCRIPT_SHA1
            ))
            .into());
        }
        debug!(key = %self.key, sha1 = %sha1, "Limit script loaded");
        Ok(())
    }
}

impl TryRateLimiter for DistributedFixedWindowLimiter {
    fn try_acquire(&self) -> bool {
        let keys = [self.key.as_str()];
        let args = [self.limit_arg.as_str()];

        match self.executor.evalsha(&LIMIT_SCRIPT_SHA1, &keys, &args) {
            Ok(result) => {
                trace!(key = %self.key, result = result, "Limit script ran by hash");
                return result == 1;
            }
            Err(StoreError::NoScript) => {
                warn!(key = %self.key, "Limit script not cached on store, sending source");
            }
            Err(e) => {
                error!(key = %self.key, error = %e, "EVALSHA failed, retrying with source");
            }
        }

        match self.executor.eval(LIMIT_SCRIPT, &keys, &args) {
            Ok(result) => {
                trace!(key = %self.key, result = result, "Limit script ran from source");
                result == 1
            }
            Err(e) => {
                error!(key = %self.key, error = %e, "Store unavailable, denying");
                false
            }
        }
    }
}
