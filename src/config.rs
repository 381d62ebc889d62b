use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_port: u16,
  pub worker_id: String,
  pub media_root: PathBuf,
  pub scheduler: SchedulerConfig,
  pub node_refresh_interval: Duration,
  pub node_timeout: Duration,
  pub quota: QuotaConfig,
}

/// Knobs for the claim-and-dispatch loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  pub tick_interval: Duration,
  pub offline_window: Duration,
  pub max_concurrent_tasks: usize,
  pub claim_batch_size: usize,
  pub lock_ttl: Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      tick_interval: Duration::from_secs(5),
      offline_window: Duration::from_secs(5 * 60),
      max_concurrent_tasks: 8,
      claim_batch_size: 64,
      lock_ttl: Duration::from_secs(30),
    }
  }
}

#[derive(Debug, Clone)]
pub struct QuotaConfig {
  pub check_interval: Duration,
  pub grace_period: Duration,
  pub cache_ttl: Duration,
  pub webhook_url: Option<String>,
}

impl Default for QuotaConfig {
  fn default() -> Self {
    Self {
      check_interval: Duration::from_secs(60),
      grace_period: Duration::from_secs(8 * 60 * 60),
      cache_ttl: Duration::from_secs(60),
      webhook_url: None,
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let scheduler = SchedulerConfig {
      tick_interval: secs_or("TICK_INTERVAL_SECS", 5)?,
      offline_window: secs_or("NODE_OFFLINE_SECS", 5 * 60)?,
      max_concurrent_tasks: var_or("MAX_CONCURRENT_TASKS", 8)?,
      claim_batch_size: var_or("CLAIM_BATCH_SIZE", 64)?,
      lock_ttl: secs_or("LOCK_TTL_SECS", 30)?,
    };
    let quota = QuotaConfig {
      check_interval: secs_or("QUOTA_CHECK_SECS", 60)?,
      grace_period: secs_or("QUOTA_GRACE_SECS", 8 * 60 * 60)?,
      cache_ttl: secs_or("QUOTA_CACHE_SECS", 60)?,
      webhook_url: env::var("QUOTA_WEBHOOK_URL").ok().filter(|url| !url.is_empty()),
    };

    Ok(Self {
      database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
      rabbitmq_url: env::var("RABBITMQ_URL").context("RABBITMQ_URL must be set")?,
      server_port: var_or("SERVER_PORT", 8080)?,
      worker_id: env::var("WORKER_ID").unwrap_or_else(|_| "worker".into()),
      media_root: env::var("MEDIA_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("media")),
      scheduler,
      node_refresh_interval: secs_or("NODE_REFRESH_SECS", 30)?,
      node_timeout: secs_or("NODE_TIMEOUT_SECS", 30)?,
      quota,
    })
  }
}

fn var_or<T>(key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match env::var(key) {
    Ok(raw) => raw.parse().with_context(|| format!("Invalid value for {}: {}", key, raw)),
    Err(_) => Ok(default),
  }
}

fn secs_or(key: &str, default: u64) -> Result<Duration> {
  var_or(key, default).map(Duration::from_secs)
}
