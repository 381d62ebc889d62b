//! Persistence seams.
//!
//! The relational store is the one place where task exclusivity is decided: `claim_*` must
//! atomically flip `processing_lock` for rows that are not already owned.

use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{NewNode, NewTask, NodeSnapshot, PendingAction, ProcessingNode, Project, Task, UserQuota};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait TaskStore: Send + Sync {
  async fn create_task(&self, new_task: NewTask) -> Result<Task>;

  async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

  /// Writes back every field a state-machine step owns. `pending_action` and the lock
  /// are left alone; they have dedicated setters. Returns false if the row is gone.
  async fn save_task(&self, task: &Task) -> Result<bool>;

  async fn delete_task(&self, id: Uuid) -> Result<bool>;

  async fn set_pending_action(&self, id: Uuid, action: Option<PendingAction>) -> Result<bool>;

  /// Claims up to `limit` eligible tasks that nobody holds (or whose lease is older than `ttl`),
  /// stamping each with `token`.
  async fn claim_pending_tasks(&self, limit: usize, ttl: Duration, token: Uuid) -> Result<Vec<Task>>;

  /// Claims one specific task if it is not held by anyone.
  async fn claim_task(&self, id: Uuid, ttl: Duration, token: Uuid) -> Result<Option<Task>>;

  /// Extends the lease. False once the lock is no longer held under `token`.
  async fn refresh_lock(&self, id: Uuid, token: Uuid) -> Result<bool>;

  /// False if the row is gone or another claim took the lock over after our lease expired.
  async fn release_lock(&self, id: Uuid, token: Uuid) -> Result<bool>;

  async fn tasks_for_project(&self, project_id: Uuid) -> Result<Vec<Task>>;

  /// Tasks in projects owned by `owner`, oldest first.
  async fn tasks_for_owner(&self, owner: &str) -> Result<Vec<Task>>;
}

#[async_trait]
pub trait NodeStore: Send + Sync {
  async fn add_node(&self, node: NewNode) -> Result<ProcessingNode>;

  async fn get_node(&self, id: i64) -> Result<Option<ProcessingNode>>;

  /// All nodes in registration order.
  async fn list_nodes(&self) -> Result<Vec<ProcessingNode>>;

  async fn record_snapshot(&self, id: i64, snapshot: NodeSnapshot) -> Result<()>;

  async fn increment_queue_count(&self, id: i64) -> Result<()>;
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
  async fn create_project(&self, owner: &str, name: &str) -> Result<Project>;

  async fn get_project(&self, id: Uuid) -> Result<Option<Project>>;

  async fn mark_project_deleting(&self, id: Uuid) -> Result<bool>;

  /// Deletes projects flagged for deletion that have no tasks left.
  async fn delete_empty_deleting_projects(&self) -> Result<u64>;

  async fn get_quota(&self, username: &str) -> Result<Option<UserQuota>>;

  async fn set_quota(&self, username: &str, quota: f64) -> Result<()>;

  async fn set_quota_deadline(&self, username: &str, deadline: Option<DateTime<Utc>>) -> Result<()>;

  async fn list_quotas(&self) -> Result<Vec<UserQuota>>;
}
