use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::services::retry::{CallPolicy, RetryConfig};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub objects_dir: String,
    pub database_url: String,
    pub max_connections: u32,
    pub op_timeout_ms: u64,
    pub max_retries: usize,
    pub batch_concurrency: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Object metadata indexer")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_INDEXER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_INDEXER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory of the object namespace (overrides OBJECT_INDEXER_OBJECTS_DIR)
    #[arg(long)]
    pub objects_dir: Option<String>,

    /// Database URL (overrides OBJECT_INDEXER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Size of the metadata connection pool (overrides OBJECT_INDEXER_MAX_CONNECTIONS)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Per-call timeout for store and source operations (overrides OBJECT_INDEXER_OP_TIMEOUT_MS)
    #[arg(long)]
    pub op_timeout_ms: Option<u64>,

    /// Retries for retryable store/source failures (overrides OBJECT_INDEXER_MAX_RETRIES)
    #[arg(long)]
    pub max_retries: Option<usize>,

    /// Distinct keys reconciled concurrently per batch (overrides OBJECT_INDEXER_BATCH_CONCURRENCY)
    #[arg(long)]
    pub batch_concurrency: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI arguments over values from `lookup` (normally the process
    /// environment) over built-in defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_str = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.into());

        Ok(Self {
            host: args
                .host
                .unwrap_or_else(|| env_str("OBJECT_INDEXER_HOST", "0.0.0.0")),
            port: or_env(args.port, &lookup, "OBJECT_INDEXER_PORT", 3000)?,
            objects_dir: args
                .objects_dir
                .unwrap_or_else(|| env_str("OBJECT_INDEXER_OBJECTS_DIR", "./data/objects")),
            database_url: args.database_url.unwrap_or_else(|| {
                env_str(
                    "OBJECT_INDEXER_DATABASE_URL",
                    "sqlite://./data/meta/file_metadata.db",
                )
            }),
            max_connections: or_env(
                args.max_connections,
                &lookup,
                "OBJECT_INDEXER_MAX_CONNECTIONS",
                5,
            )?,
            op_timeout_ms: or_env(
                args.op_timeout_ms,
                &lookup,
                "OBJECT_INDEXER_OP_TIMEOUT_MS",
                5000,
            )?,
            max_retries: or_env(args.max_retries, &lookup, "OBJECT_INDEXER_MAX_RETRIES", 2)?,
            batch_concurrency: or_env(
                args.batch_concurrency,
                &lookup,
                "OBJECT_INDEXER_BATCH_CONCURRENCY",
                1,
            )?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy::new(
            Duration::from_millis(self.op_timeout_ms),
            RetryConfig::query(self.max_retries),
        )
    }
}

fn or_env<T>(
    arg: Option<T>,
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = arg {
        return Ok(value);
    }
    match lookup(name) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}
