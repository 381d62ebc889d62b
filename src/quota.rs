//! Storage quota enforcement.
//!
//! Users over quota get a grace period. Once it runs out, their oldest tasks are queued for
//! REMOVE (the same path a user-requested removal takes) until the remaining usage fits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::QuotaConfig;
use crate::models::{PendingAction, UserQuota};
use crate::store::{ProjectStore, TaskStore};

#[derive(Debug, Serialize)]
pub struct QuotaNotice {
  pub username: String,
  pub used: f64,
  pub quota: f64,
  pub deadline: DateTime<Utc>,
}

/// What a quota check decided for one user.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaVerdict {
  Unlimited,
  WithinQuota,
  GracePeriod { deadline: DateTime<Utc> },
  Evicted { tasks: Vec<Uuid> },
}

pub struct QuotaGuard {
  tasks: Arc<dyn TaskStore>,
  projects: Arc<dyn ProjectStore>,
  config: QuotaConfig,
  usage_cache: Mutex<HashMap<String, (f64, Instant)>>,
  http: reqwest::Client,
}

impl QuotaGuard {
  pub fn new(tasks: Arc<dyn TaskStore>, projects: Arc<dyn ProjectStore>, config: QuotaConfig) -> Self {
    Self {
      tasks,
      projects,
      config,
      usage_cache: Mutex::new(HashMap::new()),
      http: reqwest::Client::new(),
    }
  }

  /// Megabytes used by every task the user owns.
  pub async fn used_quota(&self, username: &str) -> Result<f64> {
    let tasks = self.tasks.tasks_for_owner(username).await?;
    let used: f64 = tasks.iter().map(|t| t.size).sum();
    self.usage_cache
      .lock()
      .await
      .insert(username.to_string(), (used, Instant::now()));
    Ok(used)
  }

  /// Same as [`used_quota`](Self::used_quota) but answers from a short-lived cache.
  pub async fn used_quota_cached(&self, username: &str) -> Result<f64> {
    if let Some((used, at)) = self.usage_cache.lock().await.get(username) {
      if at.elapsed() < self.config.cache_ttl {
        return Ok(*used);
      }
    }
    self.used_quota(username).await
  }

  pub async fn clear_used_quota_cache(&self, username: &str) {
    self.usage_cache.lock().await.remove(username);
  }

  pub async fn has_exceeded_quota_cached(&self, username: &str) -> Result<bool> {
    match self.projects.get_quota(username).await? {
      Some(quota) if quota.quota >= 0.0 => Ok(self.used_quota_cached(username).await? > quota.quota),
      _ => Ok(false),
    }
  }

  pub async fn check_user(&self, quota: &UserQuota) -> Result<QuotaVerdict> {
    self.check_user_at(quota, Utc::now()).await
  }

  /// Evaluates one user at `now`, starting or clearing the grace deadline as needed.
  pub async fn check_user_at(&self, quota: &UserQuota, now: DateTime<Utc>) -> Result<QuotaVerdict> {
    if quota.quota < 0.0 {
      return Ok(QuotaVerdict::Unlimited);
    }

    let used = self.used_quota(&quota.username).await?;
    if used <= quota.quota {
      if quota.deadline.is_some() {
        info!("{} is back under quota, clearing deadline", quota.username);
        self.projects.set_quota_deadline(&quota.username, None).await?;
      }
      return Ok(QuotaVerdict::WithinQuota);
    }

    let deadline = match quota.deadline {
      Some(deadline) => deadline,
      None => {
        let deadline = now + chrono::Duration::from_std(self.config.grace_period)?;
        warn!(
          "{} exceeded quota ({:.2} MB used of {:.2} MB), tasks will be removed after {}",
          quota.username, used, quota.quota, deadline
        );
        self.projects.set_quota_deadline(&quota.username, Some(deadline)).await?;
        self.notify(QuotaNotice {
          username: quota.username.clone(),
          used,
          quota: quota.quota,
          deadline,
        }).await;
        deadline
      }
    };

    if now < deadline {
      return Ok(QuotaVerdict::GracePeriod { deadline });
    }

    let evicted = self.evict_oldest(&quota.username, used, quota.quota).await?;
    Ok(QuotaVerdict::Evicted { tasks: evicted })
  }

  /// Queues REMOVE on the oldest tasks until the projected usage fits in `quota`.
  async fn evict_oldest(&self, username: &str, used: f64, quota: f64) -> Result<Vec<Uuid>> {
    let tasks = self.tasks.tasks_for_owner(username).await?;
    let already_removing: HashSet<Uuid> = tasks
      .iter()
      .filter(|t| t.pending_action == Some(PendingAction::Remove))
      .map(|t| t.id)
      .collect();

    let mut projected = used - tasks
      .iter()
      .filter(|t| already_removing.contains(&t.id))
      .map(|t| t.size)
      .sum::<f64>();

    let mut evicted = Vec::new();
    for task in tasks.iter().filter(|t| !already_removing.contains(&t.id)) {
      if projected <= quota {
        break;
      }
      if self.tasks.set_pending_action(task.id, Some(PendingAction::Remove)).await? {
        info!("Quota exceeded for {}, removing {} ({:.2} MB)", username, task, task.size);
        projected -= task.size;
        evicted.push(task.id);
      }
    }
    self.clear_used_quota_cache(username).await;
    Ok(evicted)
  }

  async fn notify(&self, notice: QuotaNotice) {
    let Some(url) = &self.config.webhook_url else {
      return;
    };
    match self.http.post(url).json(&notice).send().await {
      Ok(response) if response.status().is_success() => {}
      Ok(response) => warn!("Quota webhook returned status {}", response.status().as_u16()),
      Err(e) => warn!("Quota webhook failed: {}", e),
    }
  }

  pub async fn check_all(&self) -> Result<()> {
    for quota in self.projects.list_quotas().await? {
      if let Err(e) = self.check_user(&quota).await {
        error!("Quota check failed for {}: {:#}", quota.username, e);
      }
    }
    Ok(())
  }

  pub async fn run(self: Arc<Self>) {
    let mut interval = tokio::time::interval(self.config.check_interval.max(Duration::from_secs(1)));
    loop {
      interval.tick().await;
      if let Err(e) = self.check_all().await {
        error!("Quota check failed: {:#}", e);
      }
    }
  }
}
