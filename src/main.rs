use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use admission::config::{AdmissionConfig, LoggingConfig};
use admission::ratelimit::{
    limit_script_handler, DistributedFixedWindowLimiter, FixedWindowLimiter, LeakyBucketLimiter,
    MonotonicClock, RateLimiter, TokenBucketLimiter, TryRateLimiter, LIMIT_SCRIPT,
};
use admission::store::{MemoryStore, ScriptExecutor};

/// Drive one of the admission limiters and log its decisions.
#[derive(Parser, Debug)]
#[command(name = "admission", version, about)]
struct Cli {
    /// Path to a configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the fixed-window limiter at a steady interval
    FixedWindow {
        #[arg(short, long, default_value_t = 20)]
        iterations: u64,
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
    },
    /// Acquire from the leaky bucket on several threads
    LeakyBucket {
        #[arg(short, long, default_value_t = 5)]
        iterations: u64,
        #[arg(short, long, default_value_t = 2)]
        threads: usize,
    },
    /// Acquire from the token bucket on several threads
    TokenBucket {
        #[arg(short, long, default_value_t = 5)]
        iterations: u64,
        #[arg(short, long, default_value_t = 2)]
        threads: usize,
    },
    /// Poll the distributed limiter at a steady interval
    Distributed {
        #[arg(short, long, default_value_t = 20)]
        iterations: u64,
        #[arg(long, default_value_t = 50)]
        interval_ms: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AdmissionConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging)?;

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match cli.config.as_deref() {
        Some(path) => info!(path = %path.display(), "Loaded configuration file"),
        None => info!("No configuration file, using defaults and environment"),
    }

    match cli.command {
        Command::FixedWindow {
            iterations,
            interval_ms,
        } => {
            let limiter = FixedWindowLimiter::with_window(
                config.fixed_window.limit,
                config.fixed_window.window,
                Arc::new(MonotonicClock::new()),
            )?;
            info!(
                limit = limiter.limit(),
                window = ?limiter.window(),
                "Fixed window limiter initialized"
            );
            poll(&limiter, iterations, interval_ms);
        }
        Command::LeakyBucket { iterations, threads } => {
            let limiter = LeakyBucketLimiter::new(config.leaky_bucket.capacity, config.leaky_bucket.rate)?;
            info!(
                capacity = limiter.capacity(),
                period = ?limiter.period(),
                "Leaky bucket limiter initialized"
            );
            hammer(Arc::new(limiter), iterations, threads)?;
        }
        Command::TokenBucket { iterations, threads } => {
            let limiter = TokenBucketLimiter::new(config.token_bucket.permits_per_second)?;
            info!(
                rate = limiter.rate(),
                max_permits = limiter.max_permits(),
                "Token bucket limiter initialized"
            );
            hammer(Arc::new(limiter), iterations, threads)?;
        }
        Command::Distributed {
            iterations,
            interval_ms,
        } => {
            let executor = match config.distributed.redis_url.as_deref() {
                Some(url) => remote_executor(url)?,
                None => None,
            };
            let executor = executor.unwrap_or_else(|| {
                info!("Using in-memory store");
                let store = MemoryStore::new();
                store.register_script(LIMIT_SCRIPT, limit_script_handler);
                Arc::new(store) as Arc<dyn ScriptExecutor>
            });
            let limiter = DistributedFixedWindowLimiter::new(
                config.distributed.key.clone(),
                config.distributed.limit,
                executor,
            )?;
            info!(
                key = %limiter.key(),
                limit = limiter.limit(),
                "Distributed limiter initialized"
            );
            if let Err(e) = limiter.preload_script() {
                warn!(error = %e, "Could not preload limit script, first call will send source");
            }
            poll(&limiter, iterations, interval_ms);
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .with_context(|| format!("invalid log level {:?}", logging.level))?,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    Ok(())
}

fn poll(limiter: &dyn TryRateLimiter, iterations: u64, interval_ms: u64) {
    for attempt in 1..=iterations {
        let admitted = limiter.try_acquire();
        info!(attempt = attempt, admitted = admitted, "try_acquire");
        thread::sleep(Duration::from_millis(interval_ms));
    }
}

fn hammer<L>(limiter: Arc<L>, iterations: u64, threads: usize) -> anyhow::Result<()>
where
    L: RateLimiter + 'static,
{
    let handles: Vec<_> = (0..threads)
        .map(|worker| {
            let limiter = limiter.clone();
            thread::spawn(move || -> admission::error::Result<()> {
                for _ in 0..iterations {
                    let waited = limiter.acquire()?;
                    info!(worker = worker, waited_secs = waited, "acquire");
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
    }
    Ok(())
}

#[cfg(feature = "redis")]
fn remote_executor(url: &str) -> anyhow::Result<Option<Arc<dyn ScriptExecutor>>> {
    info!(url = %url, "Using Redis store");
    let executor: Arc<dyn ScriptExecutor> =
        Arc::new(admission::store::RedisScriptExecutor::open(url)?);
    Ok(Some(executor))
}

#[cfg(not(feature = "redis"))]
fn remote_executor(url: &str) -> anyhow::Result<Option<Arc<dyn ScriptExecutor>>> {
    warn!(url = %url, "Built without the `redis` feature, ignoring redis_url");
    Ok(None)
}
