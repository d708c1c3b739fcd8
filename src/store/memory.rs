//! In-process script store with key expiry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{script_sha1, ScriptExecutor, StoreError};
use crate::ratelimit::{Clock, MonotonicClock};

/// Native implementation of a script, run against the keyspace under the
/// store lock.
type ScriptHandler =
    Arc<dyn Fn(&mut Keyspace, &[&str], &[&str]) -> Result<i64, StoreError> + Send + Sync>;

/// Integer counters with optional expiry, as seen by a running script.
///
/// Expired keys are dropped when touched, and swept from the whole
/// keyspace before each script run.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
    /// Store time at which the current script started
    now: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<Duration>,
}

impl Keyspace {
    fn live_entry(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map_or(false, |deadline| deadline <= self.now);
        if expired {
            trace!(key = %key, "Key expired");
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn purge_expired(&mut self) {
        let now = self.now;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |deadline| deadline > now));
        let purged = before - self.entries.len();
        if purged > 0 {
            trace!(purged = purged, "Swept expired keys");
        }
    }

    /// Increment the counter at `key`, creating it at zero first if absent.
    pub fn incr(&mut self, key: &str) -> Result<i64, StoreError> {
        match self.live_entry(key) {
            Some(entry) => {
                entry.value = entry
                    .value
                    .checked_add(1)
                    .ok_or_else(|| StoreError::Response("increment would overflow".to_string()))?;
                Ok(entry.value)
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: 1,
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    /// Set a time-to-live on `key`. Returns `false` if the key does not exist.
    pub fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        let now = self.now;
        match self.live_entry(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }
    }

    /// Current value of `key`, if it exists.
    pub fn get(&mut self, key: &str) -> Option<i64> {
        self.live_entry(key).map(|entry| entry.value)
    }

    /// Remaining time-to-live of `key`, if it exists and has one.
    pub fn ttl(&mut self, key: &str) -> Option<Duration> {
        let now = self.now;
        self.live_entry(key)
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline.saturating_sub(now))
    }
}

struct StoreState {
    keyspace: Keyspace,
    /// Every script the store knows how to run, by hash
    scripts: HashMap<String, ScriptHandler>,
    /// Hashes callable through `evalsha`
    cached: HashSet<String>,
    available: bool,
}

/// A single-node stand-in for a scripted key-value store.
///
/// One lock serializes every script run, which gives the same atomicity a
/// single-threaded store provides. Scripts must be registered with a native
/// handler before they can run; like Redis, a script becomes callable by
/// hash once it has been loaded or run through `eval`, and `script_flush`
/// forgets all of them.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store on the monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// Create an empty store whose key expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                keyspace: Keyspace::default(),
                scripts: HashMap::new(),
                cached: HashSet::new(),
                available: true,
            }),
            clock,
        }
    }

    /// Teach the store how to run `source`. Does not cache it.
    pub fn register_script<F>(&self, source: &str, handler: F) -> String
    where
        F: Fn(&mut Keyspace, &[&str], &[&str]) -> Result<i64, StoreError> + Send + Sync + 'static,
    {
        let sha1 = script_sha1(source);
        self.state.lock().scripts.insert(sha1.clone(), Arc::new(handler));
        sha1
    }

    /// Drop every cached script, as a store restart would.
    pub fn script_flush(&self) {
        debug!("Flushing script cache");
        self.state.lock().cached.clear();
    }

    /// Whether `sha1` can currently be run by hash.
    pub fn script_exists(&self, sha1: &str) -> bool {
        self.state.lock().cached.contains(sha1)
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        debug!(available = available, "Store availability changed");
        self.state.lock().available = available;
    }

    /// Current value of `key`, honouring expiry.
    pub fn get(&self, key: &str) -> Option<i64> {
        let mut state = self.state.lock();
        state.keyspace.now = self.clock.elapsed();
        state.keyspace.get(key)
    }

    /// Remaining time-to-live of `key`.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.state.lock();
        state.keyspace.now = self.clock.elapsed();
        state.keyspace.ttl(key)
    }

    /// Number of keys held, including expired ones not yet swept.
    pub fn key_count(&self) -> usize {
        self.state.lock().keyspace.entries.len()
    }

    fn run(&self, state: &mut StoreState, sha1: &str, keys: &[&str], args: &[&str]) -> Result<i64, StoreError> {
        let handler = state
            .scripts
            .get(sha1)
            .cloned()
            .ok_or_else(|| StoreError::Response(format!("unknown script {}", sha1)))?;
        state.keyspace.now = self.clock.elapsed();
        state.keyspace.purge_expired();
        handler(&mut state.keyspace, keys, args)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptExecutor for MemoryStore {
    fn evalsha(&self, sha1: &str, keys: &[&str], args: &[&str]) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(StoreError::Connection("store unavailable".to_string()));
        }
        if !state.cached.contains(sha1) {
            return Err(StoreError::NoScript);
        }
        self.run(&mut state, sha1, keys, args)
    }

    fn eval(&self, script: &str, keys: &[&str], args: &[&str]) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(StoreError::Connection("store unavailable".to_string()));
        }
        let sha1 = script_sha1(script);
        let result = self.run(&mut state, &sha1, keys, args)?;
        state.cached.insert(sha1);
        Ok(result)
    }

    fn script_load(&self, script: &str) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(StoreError::Connection("store unavailable".to_string()));
        }
        let sha1 = script_sha1(script);
        if !state.scripts.contains_key(&sha1) {
            return Err(StoreError::Response(format!("unknown script {}", sha1)));
        }
        state.cached.insert(sha1.clone());
        Ok(sha1)
    }
}
