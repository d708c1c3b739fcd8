//! Shared-store script execution.
//!
//! The distributed limiter never touches counters directly; it asks a
//! store to run a script atomically and reads back a scalar. This module
//! defines that contract, an in-process store for tests and single-node use,
//! and (with the `redis` feature) a Redis-backed executor.

mod memory;
#[cfg(feature = "redis")]
mod redis_executor;

use sha1::{Digest, Sha1};
use thiserror::Error;

pub use memory::{Keyspace, MemoryStore};
#[cfg(feature = "redis")]
pub use redis_executor::RedisScriptExecutor;

/// Errors reported by a script executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store has no cached script for the given hash
    #[error("NOSCRIPT no matching script for hash")]
    NoScript,

    /// The store could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store answered with an error
    #[error("Store error response: {0}")]
    Response(String),
}

/// Runs parameterized scripts on a shared store and returns their scalar result.
///
/// Script execution must be atomic with respect to every other client of
/// the store; that atomicity is what the distributed limiter relies on.
pub trait ScriptExecutor: Send + Sync {
    /// Run a script the store has cached, identified by its SHA-1 hex digest.
    fn evalsha(&self, sha1: &str, keys: &[&str], args: &[&str]) -> Result<i64, StoreError>;

    /// Run a script from its source text.
    fn eval(&self, script: &str, keys: &[&str], args: &[&str]) -> Result<i64, StoreError>;

    /// Cache a script without running it and return its SHA-1 hex digest.
    fn script_load(&self, script: &str) -> Result<String, StoreError>;
}

/// Lowercase hex SHA-1 of a script's UTF-8 source, as stores key their
/// script caches.
pub fn script_sha1(script: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(script.as_bytes());
    hex::encode(hasher.finalize())
}
