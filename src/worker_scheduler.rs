//! Claim-and-dispatch loop.
//!
//! A tick claims eligible tasks in one store transaction (which is what actually keeps two
//! workers off the same task), then hands each claimed task to its own tokio task. A semaphore
//! caps how many steps run at once. Whatever happens inside a step, the lock is released
//! afterwards unless the step deleted the task. Every claim carries a fresh token, so a worker
//! whose lease expired cannot touch the lock of whoever re-claimed the task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::models::Task;
use crate::store::TaskStore;
use crate::worker_processing::{StepOutcome, TaskProcessor};

/// Serializes claim queries issued from one process. Shared between every scheduler and
/// consumer living in the same worker.
pub type ClaimLock = Arc<Mutex<()>>;

pub struct Scheduler {
  tasks: Arc<dyn TaskStore>,
  processor: Arc<TaskProcessor>,
  claim_lock: ClaimLock,
  workers: Arc<Semaphore>,
  config: SchedulerConfig,
}

impl Scheduler {
  pub fn new(
    tasks: Arc<dyn TaskStore>,
    processor: Arc<TaskProcessor>,
    claim_lock: ClaimLock,
    config: SchedulerConfig,
  ) -> Self {
    let workers = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
    Self { tasks, processor, claim_lock, workers, config }
  }

  fn lock_ttl(&self) -> Result<chrono::Duration> {
    Ok(chrono::Duration::from_std(self.config.lock_ttl)?)
  }

  /// Claims as many eligible tasks as there are idle workers, up to the batch size.
  pub async fn claim(&self) -> Result<Vec<Task>> {
    let limit = self.workers.available_permits().min(self.config.claim_batch_size);
    if limit == 0 {
      debug!("All workers busy, skipping claim");
      return Ok(Vec::new());
    }

    let ttl = self.lock_ttl()?;
    let _guard = self.claim_lock.lock().await;
    let claimed = self.tasks.claim_pending_tasks(limit, ttl, Uuid::new_v4()).await?;
    for task in &claimed {
      debug!("Acquired lock on {}", task);
    }
    Ok(claimed)
  }

  /// One tick. The returned handles finish when each dispatched step is done and its lock
  /// released; callers are free to drop them.
  pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
    let claimed = self.claim().await?;
    if !claimed.is_empty() {
      info!("Dispatching {} task(s)", claimed.len());
    }
    Ok(claimed.into_iter().map(|task| self.dispatch(task)).collect())
  }

  fn dispatch(&self, task: Task) -> JoinHandle<()> {
    let tasks = self.tasks.clone();
    let processor = self.processor.clone();
    let workers = self.workers.clone();
    let refresh_every = self.refresh_interval();
    tokio::spawn(async move {
      run_claimed(tasks, processor, workers, task, refresh_every).await;
    })
  }

  /// Processes one task right away if nobody else holds it. Returns whether it ran.
  pub async fn process_now(&self, id: Uuid) -> Result<bool> {
    let ttl = self.lock_ttl()?;
    let claimed = {
      let _guard = self.claim_lock.lock().await;
      self.tasks.claim_task(id, ttl, Uuid::new_v4()).await?
    };
    match claimed {
      Some(task) => {
        run_claimed(self.tasks.clone(), self.processor.clone(), self.workers.clone(), task, self.refresh_interval()).await;
        Ok(true)
      }
      None => {
        debug!("Task {} is locked or missing, leaving it to the scheduler", id);
        Ok(false)
      }
    }
  }

  fn refresh_interval(&self) -> Duration {
    (self.config.lock_ttl / 3).max(Duration::from_millis(100))
  }

  pub async fn run(self: Arc<Self>) {
    info!("Starting scheduler (tick every {:?})", self.config.tick_interval);
    let mut interval = time::interval(self.config.tick_interval);
    loop {
      interval.tick().await;
      if let Err(e) = self.tick().await {
        error!("Scheduler tick failed: {:#}", e);
      }
    }
  }
}

/// Runs one step for a claimed task and releases its lock, whatever the step did.
async fn run_claimed(
  tasks: Arc<dyn TaskStore>,
  processor: Arc<TaskProcessor>,
  workers: Arc<Semaphore>,
  task: Task,
  refresh_every: Duration,
) {
  let id = task.id;
  let label = task.to_string();
  let Some(token) = task.lock_token else {
    error!("{} was dispatched without holding its lock", label);
    return;
  };

  // Keeps the lease alive while queued for a worker and while running.
  let keepalive = {
    let tasks = tasks.clone();
    tokio::spawn(async move {
      let mut interval = time::interval(refresh_every);
      interval.tick().await;
      loop {
        interval.tick().await;
        match tasks.refresh_lock(id, token).await {
          Ok(true) => {}
          Ok(false) => {
            warn!("Lost the lock on task {}", id);
            break;
          }
          Err(e) => warn!("Could not refresh lock on task {}: {:#}", id, e),
        }
      }
    })
  };

  let permit = workers.acquire_owned().await.ok();

  let result = AssertUnwindSafe(processor.process(task)).catch_unwind().await;
  keepalive.abort();
  drop(permit);

  let removed = match result {
    Ok(Ok(StepOutcome::Removed)) => true,
    Ok(Ok(StepOutcome::Updated)) => false,
    Ok(Err(e)) => {
      error!("Uncaught error while processing {}: {:#}", label, e);
      false
    }
    Err(_) => {
      error!("Processing {} panicked", label);
      false
    }
  };

  if removed {
    return;
  }
  match tasks.release_lock(id, token).await {
    Ok(true) => debug!("Released lock on {}", label),
    Ok(false) => debug!("{} is gone or held by another claim, nothing to release", label),
    Err(e) => error!("Could not release lock on {}: {:#}", label, e),
  }
}
