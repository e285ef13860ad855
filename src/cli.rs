/// CLI Module
///
/// Command-line interface configuration using clap.
use clap::Parser;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::BlockHeight;
use crate::pipeline::PipelineConfig;
use crate::retry::RetryPolicy;

/// Steem Block Harvester - Ingestion Pipeline
///
/// Harvest blocks, new accounts and votes from a ledger node into PostgreSQL and a relationship graph
#[derive(Parser, Debug)]
#[command(name = "steem-block-harvester")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Ledger node JSON-RPC endpoint (overrides STEEM_RPC_URL env var)
    #[arg(short = 'r', long = "rpc_endpoint", value_name = "URL")]
    pub rpc_endpoint: Option<String>,

    /// Re-establish the node connection after a connection failure
    #[arg(long, value_name = "BOOL", default_value_t = true, action = clap::ArgAction::Set)]
    pub reconnect: bool,

    /// Database connection URL (overrides DATABASE_URL env var)
    #[arg(short = 'd', long = "database_url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Number of concurrent block workers
    #[arg(short = 'w', long, value_name = "COUNT", default_value = "12")]
    pub workers: usize,

    /// Capacity of the task queue and of each writer queue
    #[arg(long = "queue_capacity", value_name = "SIZE", default_value = "1024")]
    pub queue_capacity: usize,

    /// First height to process
    #[arg(short = 's', long = "start_height", value_name = "HEIGHT", default_value = "1")]
    pub start_height: BlockHeight,

    /// Last height to process (defaults to the last irreversible height)
    #[arg(short = 'e', long = "end_height", value_name = "HEIGHT")]
    pub end_height: Option<BlockHeight>,

    /// Maximum attempts for each RPC call
    #[arg(long = "max_retries", value_name = "COUNT", default_value = "3")]
    pub max_retries: usize,

    /// Base backoff delay in milliseconds (doubles on every retry)
    #[arg(long = "retry_delay_ms", value_name = "MS", default_value = "500")]
    pub retry_delay_ms: u64,

    /// Maximum attempts for each sink write
    #[arg(long = "write_retries", value_name = "COUNT", default_value = "6")]
    pub write_retries: usize,

    /// History entries fetched per new account
    #[arg(long = "history_limit", value_name = "COUNT", default_value = "1000")]
    pub history_limit: u32,

    /// RPC request timeout in seconds
    #[arg(long = "rpc_timeout", value_name = "SECONDS", default_value = "30")]
    pub rpc_timeout: u64,

    /// Keep following the irreversible height once the initial range is done
    #[arg(short = 'c', long)]
    pub continuous: bool,

    /// Interval between irreversible height polls in continuous mode, in seconds
    #[arg(long, value_name = "SECONDS", default_value = "3")]
    pub interval: u64,
}

/// Fully resolved settings
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rpc_endpoint: String,
    pub reconnect: bool,
    pub rpc_timeout: Duration,
    pub database_url: String,
    /// Pool size shared by the operations and account writers
    pub db_max_connections: u32,
    pub pipeline: PipelineConfig,
}

impl Cli {
    /// Validate CLI arguments
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |name: &'static str, value: usize| {
            if value == 0 {
                Err(ConfigError::InvalidValue { name, reason: "must be greater than 0".to_string() })
            } else {
                Ok(())
            }
        };

        positive("workers", self.workers)?;
        positive("queue_capacity", self.queue_capacity)?;
        positive("max_retries", self.max_retries)?;
        positive("write_retries", self.write_retries)?;

        if self.start_height == 0 {
            return Err(ConfigError::InvalidValue { name: "start_height", reason: "heights start at 1".to_string() });
        }

        if let Some(end) = self.end_height {
            if self.start_height > end {
                return Err(ConfigError::InvalidValue {
                    name: "end_height",
                    reason: format!("start height ({}) must be <= end height ({})", self.start_height, end),
                });
            }
        }

        Ok(())
    }

    /// Resolve flags and environment into the final configuration
    pub fn into_config(self) -> Result<AppConfig, ConfigError> {
        self.resolve(|key| std::env::var(key).ok())
    }

    fn resolve(self, env: impl Fn(&str) -> Option<String>) -> Result<AppConfig, ConfigError> {
        self.validate()?;

        let rpc_endpoint =
            self.rpc_endpoint.or_else(|| env("STEEM_RPC_URL")).ok_or(ConfigError::Missing("rpc_endpoint"))?;
        let database_url =
            self.database_url.or_else(|| env("DATABASE_URL")).ok_or(ConfigError::Missing("database_url"))?;

        let retry_delay = Duration::from_millis(self.retry_delay_ms);

        Ok(AppConfig {
            rpc_endpoint,
            reconnect: self.reconnect,
            rpc_timeout: Duration::from_secs(self.rpc_timeout),
            database_url,
            db_max_connections: 4,
            pipeline: PipelineConfig {
                start_height: self.start_height,
                end_height: self.end_height,
                workers: self.workers,
                queue_capacity: self.queue_capacity,
                fetch_retry: RetryPolicy::new(self.max_retries, retry_delay),
                write_retry: RetryPolicy::new(self.write_retries, retry_delay),
                history_limit: self.history_limit,
                continuous: self.continuous,
                poll_interval: Duration::from_secs(self.interval),
            },
        })
    }
}
