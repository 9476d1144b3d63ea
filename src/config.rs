use crate::services::{
    dispatcher::DispatcherConfig,
    workflow_engine::{EngineConfig, RetryPolicy},
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};
use uuid::Uuid;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,

    /// Identity used in workflow leases and logs.
    pub worker_id: String,

    /// Identity the storage system presents when publishing.
    pub publisher_source: String,
    pub topic_name: String,
    pub queue_name: String,

    pub queue: QueueSettings,
    pub dispatcher: DispatcherConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_deliveries: u32,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Event-driven object ingestion worker")]
pub struct Args {
    /// Host to bind to (overrides INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides INGEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Worker identity (overrides INGEST_WORKER_ID, defaults to a random id)
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Messages held concurrently by this worker (overrides INGEST_CONCURRENCY)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Attempts per workflow step (overrides INGEST_STEP_MAX_ATTEMPTS)
    #[arg(long)]
    pub step_max_attempts: Option<u32>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` from the environment, parsing it as `T`; `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

fn env_millis(name: &str, default_ms: u64) -> Result<Duration> {
    env_or(name, default_ms).map(Duration::from_millis)
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge: CLI wins, then environment, then built-in defaults.
    pub fn from_args(args: Args) -> Result<Self> {
        let env_host = env_string("INGEST_HOST", "0.0.0.0");
        let env_port = env_or("INGEST_PORT", 3000u16)?;
        let env_db = env_string("INGEST_DATABASE_URL", "sqlite://./data/ingest.db");
        let env_worker = env::var("INGEST_WORKER_ID")
            .unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4().simple()));

        let concurrency = match args.concurrency {
            Some(value) => value,
            None => env_or("INGEST_CONCURRENCY", 8usize)?,
        };
        let step_max_attempts = match args.step_max_attempts {
            Some(value) => value,
            None => env_or("INGEST_STEP_MAX_ATTEMPTS", 3u32)?,
        };

        let visibility_timeout = env_millis("INGEST_VISIBILITY_TIMEOUT_MS", 30_000)?;
        let step_timeout = env_millis("INGEST_STEP_TIMEOUT_MS", 60_000)?;
        let poll_interval = env_millis("INGEST_POLL_INTERVAL_MS", 1_000)?;

        let mut cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            worker_id: args.worker_id.unwrap_or(env_worker),
            publisher_source: env_string("INGEST_PUBLISHER_SOURCE", "storage:ingest-bucket"),
            topic_name: env_string("INGEST_TOPIC_NAME", "topic:object-events"),
            queue_name: env_string("INGEST_QUEUE_NAME", "queue:object-ingest"),
            queue: QueueSettings {
                max_deliveries: env_or("INGEST_MAX_DELIVERIES", 5u32)?,
            },
            dispatcher: DispatcherConfig {
                max_messages: env_or("INGEST_MAX_MESSAGES", 10usize)?,
                concurrency,
                visibility_timeout,
                heartbeat_interval: visibility_timeout / 3,
                handle_timeout: env_millis("INGEST_HANDLE_TIMEOUT_MS", 20_000)?,
                poll_interval,
            },
            engine: EngineConfig {
                worker_id: String::new(),
                retry: RetryPolicy {
                    max_attempts: step_max_attempts,
                    backoff_base: env_millis("INGEST_BACKOFF_BASE_MS", 500)?,
                    backoff_max: env_millis("INGEST_BACKOFF_MAX_MS", 30_000)?,
                },
                step_timeout,
                workflow_deadline: env_millis("INGEST_WORKFLOW_DEADLINE_MS", 3_600_000)?,
                lease_duration: env_millis("INGEST_LEASE_MS", step_timeout.as_millis() as u64 * 2)?,
                poll_interval,
                concurrency: env_or("INGEST_ENGINE_CONCURRENCY", 4usize)?,
            },
        };

        cfg.engine.worker_id = cfg.worker_id.clone();
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.dispatcher.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.engine.retry.max_attempts == 0 {
            bail!("step max attempts must be at least 1");
        }
        if self.queue.max_deliveries == 0 {
            bail!("max deliveries must be at least 1");
        }
        if self.dispatcher.visibility_timeout.is_zero() {
            bail!("visibility timeout must be positive");
        }
        if self.engine.lease_duration <= self.engine.step_timeout {
            bail!(
                "workflow lease ({:?}) must outlast the step timeout ({:?})",
                self.engine.lease_duration,
                self.engine.step_timeout
            );
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_override_defaults() {
        let args = Args::parse_from([
            "object-ingest",
            "--port",
            "8088",
            "--worker-id",
            "worker-a",
            "--concurrency",
            "2",
            "--step-max-attempts",
            "4",
        ]);
        let cfg = AppConfig::from_args(args).unwrap();

        assert_eq!(cfg.port, 8088);
        assert_eq!(cfg.worker_id, "worker-a");
        assert_eq!(cfg.engine.worker_id, "worker-a");
        assert_eq!(cfg.dispatcher.concurrency, 2);
        assert_eq!(cfg.engine.retry.max_attempts, 4);
        assert!(cfg.engine.lease_duration > cfg.engine.step_timeout);
        assert_eq!(cfg.addr(), format!("{}:8088", cfg.host));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let args = Args::parse_from(["object-ingest", "--concurrency", "0"]);
        assert!(AppConfig::from_args(args).is_err());
    }
}
