//! Redis-backed script executor.

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{ScriptExecutor, StoreError};
use crate::error::{LimiterError, Result};

/// Runs scripts on a Redis server with `EVALSHA` / `EVAL`.
///
/// Keeps one connection and reuses it across calls. A connection that fails
/// with an I/O error is dropped and reopened on the next call. Calls share
/// that connection one at a time; pooling is left to the caller's deployment.
pub struct RedisScriptExecutor {
    client: ::redis::Client,
    connection: Mutex<Option<::redis::Connection>>,
}

impl RedisScriptExecutor {
    /// Create an executor for a `redis://` URL. Does not connect yet.
    pub fn open(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| LimiterError::Config(format!("Invalid Redis URL {}: {}", url, e)))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    fn query<T: ::redis::FromRedisValue>(&self, command: &::redis::Cmd) -> std::result::Result<T, StoreError> {
        let mut slot = self.connection.lock();
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => {
                debug!("Opening Redis connection");
                self.client.get_connection()?
            }
        };

        let result = command.query::<T>(&mut connection).map_err(StoreError::from);
        match result {
            Err(StoreError::Connection(ref e)) => {
                debug!(error = %e, "Dropping broken Redis connection");
            }
            _ => *slot = Some(connection),
        }
        result
    }

    fn run(&self, command: &str, script: &str, keys: &[&str], args: &[&str]) -> std::result::Result<i64, StoreError> {
        trace!(command = command, keys = ?keys, "Sending script command");
        let mut cmd = ::redis::cmd(command);
        cmd.arg(script).arg(keys.len()).arg(keys).arg(args);
        self.query(&cmd)
    }
}

impl ScriptExecutor for RedisScriptExecutor {
    fn evalsha(&self, sha1: &str, keys: &[&str], args: &[&str]) -> std::result::Result<i64, StoreError> {
        self.run("EVALSHA", sha1, keys, args)
    }

    fn eval(&self, script: &str, keys: &[&str], args: &[&str]) -> std::result::Result<i64, StoreError> {
        self.run("EVAL", script, keys, args)
    }

    fn script_load(&self, script: &str) -> std::result::Result<String, StoreError> {
        let mut cmd = ::redis::cmd("SCRIPT");
        cmd.arg("LOAD").arg(script);
        self.query(&cmd)
    }
}

impl From<::redis::RedisError> for StoreError {
    fn from(e: ::redis::RedisError) -> Self {
        if e.kind() == ::redis::ErrorKind::NoScriptError {
            StoreError::NoScript
        } else if e.is_io_error()
            || e.is_connection_refusal()
            || e.is_connection_dropped()
            || e.is_timeout()
        {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Response(e.to_string())
        }
    }
}
