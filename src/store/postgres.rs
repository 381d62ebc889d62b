use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::models::{
  NewNode, NewTask, NodeSnapshot, PendingAction, ProcessingNode, Project, Task, TaskStatus, UserQuota,
};
use super::{NodeStore, ProjectStore, TaskStore};

const TASK_COLUMNS: &str = r#"
  id, project_id, name, remote_id, node_id, auto_assign, status, pending_action,
  processing_lock, locked_at, lock_token, options, console_output, processing_time, last_error,
  upload_progress, running_progress, available_assets, images_count, size, compacted,
  import_url, partial, created_at
"#;

const NODE_COLUMNS: &str = r#"
  id, hostname, port, token, label, api_version, max_images, queue_count,
  last_heartbeat, available_options, created_at
"#;

/// Matches tasks the scheduler should look at on a tick.
const ELIGIBLE: &str = r#"
  partial = FALSE
  AND (
    (node_id IS NULL AND auto_assign = TRUE)
    OR (node_id IS NOT NULL AND (status IS NULL OR status IN (10, 20)))
    OR pending_action IS NOT NULL
  )
"#;

#[derive(Clone)]
pub struct PgStore {
  pool: PgPool,
}

impl PgStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }
}

#[derive(FromRow)]
struct TaskRow {
  id: Uuid,
  project_id: Uuid,
  name: String,
  remote_id: String,
  node_id: Option<i64>,
  auto_assign: bool,
  status: Option<i32>,
  pending_action: Option<i32>,
  processing_lock: bool,
  locked_at: Option<DateTime<Utc>>,
  lock_token: Option<Uuid>,
  options: serde_json::Value,
  console_output: String,
  processing_time: i64,
  last_error: Option<String>,
  upload_progress: f64,
  running_progress: f64,
  available_assets: Vec<String>,
  images_count: i32,
  size: f64,
  compacted: bool,
  import_url: String,
  partial: bool,
  created_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
  type Error = anyhow::Error;

  fn try_from(row: TaskRow) -> Result<Self> {
    let status = row
      .status
      .map(|code| TaskStatus::from_code(code).ok_or_else(|| anyhow!("Invalid status code {} on task {}", code, row.id)))
      .transpose()?;
    let pending_action = row
      .pending_action
      .map(|code| PendingAction::from_code(code).ok_or_else(|| anyhow!("Invalid pending action {} on task {}", code, row.id)))
      .transpose()?;

    Ok(Task {
      id: row.id,
      project_id: row.project_id,
      name: row.name,
      remote_id: row.remote_id,
      node_id: row.node_id,
      auto_assign: row.auto_assign,
      status,
      pending_action,
      processing_lock: row.processing_lock,
      locked_at: row.locked_at,
      lock_token: row.lock_token,
      options: row.options,
      console_output: row.console_output,
      processing_time: row.processing_time,
      last_error: row.last_error,
      upload_progress: row.upload_progress,
      running_progress: row.running_progress,
      available_assets: row.available_assets,
      images_count: row.images_count,
      size: row.size,
      compacted: row.compacted,
      import_url: row.import_url,
      partial: row.partial,
      created_at: row.created_at,
    })
  }
}

#[derive(FromRow)]
struct NodeRow {
  id: i64,
  hostname: String,
  port: i32,
  token: String,
  label: String,
  api_version: String,
  max_images: Option<i32>,
  queue_count: i32,
  last_heartbeat: Option<DateTime<Utc>>,
  available_options: serde_json::Value,
  created_at: DateTime<Utc>,
}

impl From<NodeRow> for ProcessingNode {
  fn from(row: NodeRow) -> Self {
    ProcessingNode {
      id: row.id,
      hostname: row.hostname,
      port: row.port,
      token: row.token,
      label: row.label,
      api_version: row.api_version,
      max_images: row.max_images,
      queue_count: row.queue_count,
      last_heartbeat: row.last_heartbeat,
      available_options: row.available_options,
      created_at: row.created_at,
    }
  }
}

#[derive(FromRow)]
struct ProjectRow {
  id: Uuid,
  owner: String,
  name: String,
  deleting: bool,
  created_at: DateTime<Utc>,
}

impl From<ProjectRow> for Project {
  fn from(row: ProjectRow) -> Self {
    Project { id: row.id, owner: row.owner, name: row.name, deleting: row.deleting, created_at: row.created_at }
  }
}

#[derive(FromRow)]
struct QuotaRow {
  username: String,
  quota: f64,
  deadline: Option<DateTime<Utc>>,
}

impl From<QuotaRow> for UserQuota {
  fn from(row: QuotaRow) -> Self {
    UserQuota { username: row.username, quota: row.quota, deadline: row.deadline }
  }
}

fn into_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>> {
  rows.into_iter().map(Task::try_from).collect()
}

#[async_trait]
impl TaskStore for PgStore {
  async fn create_task(&self, new_task: NewTask) -> Result<Task> {
    let mut task = Task::new(new_task.project_id, new_task.name);
    task.options = new_task.options;
    task.node_id = new_task.node_id;
    task.auto_assign = new_task.auto_assign;
    task.images_count = new_task.images_count;
    task.partial = new_task.partial;
    if let Some(url) = new_task.import_url {
      task.import_url = url;
      task.pending_action = Some(PendingAction::Import);
    }

    sqlx::query(
      r#"
      INSERT INTO tasks (id, project_id, name, node_id, auto_assign, options, images_count,
                         import_url, pending_action, partial, created_at)
      VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
      "#,
    )
    .bind(task.id)
    .bind(task.project_id)
    .bind(&task.name)
    .bind(task.node_id)
    .bind(task.auto_assign)
    .bind(&task.options)
    .bind(task.images_count)
    .bind(&task.import_url)
    .bind(task.pending_action.map(PendingAction::code))
    .bind(task.partial)
    .bind(task.created_at)
    .execute(&self.pool)
    .await?;

    Ok(task)
  }

  async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
    let row = sqlx::query_as::<_, TaskRow>(&format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS))
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    row.map(Task::try_from).transpose()
  }

  async fn save_task(&self, task: &Task) -> Result<bool> {
    let result = sqlx::query(
      r#"
      UPDATE tasks
      SET remote_id = $2, node_id = $3, auto_assign = $4, status = $5, options = $6,
          console_output = $7, processing_time = $8, last_error = $9, upload_progress = $10,
          running_progress = $11, available_assets = $12, images_count = $13, size = $14,
          compacted = $15, import_url = $16
      WHERE id = $1
      "#,
    )
    .bind(task.id)
    .bind(&task.remote_id)
    .bind(task.node_id)
    .bind(task.auto_assign)
    .bind(task.status.map(TaskStatus::code))
    .bind(&task.options)
    .bind(&task.console_output)
    .bind(task.processing_time)
    .bind(&task.last_error)
    .bind(task.upload_progress)
    .bind(task.running_progress)
    .bind(&task.available_assets)
    .bind(task.images_count)
    .bind(task.size)
    .bind(task.compacted)
    .bind(&task.import_url)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn delete_task(&self, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
      .bind(id)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn set_pending_action(&self, id: Uuid, action: Option<PendingAction>) -> Result<bool> {
    let result = sqlx::query("UPDATE tasks SET pending_action = $2 WHERE id = $1")
      .bind(id)
      .bind(action.map(PendingAction::code))
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn claim_pending_tasks(&self, limit: usize, ttl: Duration, token: Uuid) -> Result<Vec<Task>> {
    let stale_before = Utc::now() - ttl;
    let mut tx = self.pool.begin().await?;
    let rows = sqlx::query_as::<_, TaskRow>(&format!(
      r#"
      UPDATE tasks SET processing_lock = TRUE, locked_at = NOW(), lock_token = $3
      WHERE id IN (
        SELECT id FROM tasks
        WHERE {} AND (processing_lock = FALSE OR locked_at < $2)
        ORDER BY created_at
        LIMIT $1
        FOR UPDATE SKIP LOCKED
      )
      RETURNING {}
      "#,
      ELIGIBLE, TASK_COLUMNS
    ))
    .bind(limit as i64)
    .bind(stale_before)
    .bind(token)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    debug!("Claimed {} task(s)", rows.len());
    into_tasks(rows)
  }

  async fn claim_task(&self, id: Uuid, ttl: Duration, token: Uuid) -> Result<Option<Task>> {
    let stale_before = Utc::now() - ttl;
    let row = sqlx::query_as::<_, TaskRow>(&format!(
      r#"
      UPDATE tasks SET processing_lock = TRUE, locked_at = NOW(), lock_token = $3
      WHERE id = $1 AND (processing_lock = FALSE OR locked_at < $2)
      RETURNING {}
      "#,
      TASK_COLUMNS
    ))
    .bind(id)
    .bind(stale_before)
    .bind(token)
    .fetch_optional(&self.pool)
    .await?;
    row.map(Task::try_from).transpose()
  }

  async fn refresh_lock(&self, id: Uuid, token: Uuid) -> Result<bool> {
    let result = sqlx::query(
      "UPDATE tasks SET locked_at = NOW() WHERE id = $1 AND processing_lock = TRUE AND lock_token = $2",
    )
    .bind(id)
    .bind(token)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn release_lock(&self, id: Uuid, token: Uuid) -> Result<bool> {
    let result = sqlx::query(
      "UPDATE tasks SET processing_lock = FALSE, locked_at = NULL, lock_token = NULL WHERE id = $1 AND lock_token = $2",
    )
    .bind(id)
    .bind(token)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn tasks_for_project(&self, project_id: Uuid) -> Result<Vec<Task>> {
    let rows = sqlx::query_as::<_, TaskRow>(&format!(
      "SELECT {} FROM tasks WHERE project_id = $1 ORDER BY created_at",
      TASK_COLUMNS
    ))
    .bind(project_id)
    .fetch_all(&self.pool)
    .await?;
    into_tasks(rows)
  }

  async fn tasks_for_owner(&self, owner: &str) -> Result<Vec<Task>> {
    let columns = TASK_COLUMNS
      .split(',')
      .map(|c| format!("t.{}", c.trim()))
      .collect::<Vec<_>>()
      .join(", ");
    let rows = sqlx::query_as::<_, TaskRow>(&format!(
      r#"
      SELECT {}
      FROM tasks t JOIN projects p ON p.id = t.project_id
      WHERE p.owner = $1
      ORDER BY t.created_at ASC
      "#,
      columns
    ))
    .bind(owner)
    .fetch_all(&self.pool)
    .await?;
    into_tasks(rows)
  }
}

#[async_trait]
impl NodeStore for PgStore {
  async fn add_node(&self, node: NewNode) -> Result<ProcessingNode> {
    let row = sqlx::query_as::<_, NodeRow>(&format!(
      r#"
      INSERT INTO processing_nodes (hostname, port, token, label)
      VALUES ($1, $2, $3, $4)
      RETURNING {}
      "#,
      NODE_COLUMNS
    ))
    .bind(&node.hostname)
    .bind(node.port)
    .bind(&node.token)
    .bind(&node.label)
    .fetch_one(&self.pool)
    .await?;
    Ok(row.into())
  }

  async fn get_node(&self, id: i64) -> Result<Option<ProcessingNode>> {
    let row = sqlx::query_as::<_, NodeRow>(&format!("SELECT {} FROM processing_nodes WHERE id = $1", NODE_COLUMNS))
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.map(Into::into))
  }

  async fn list_nodes(&self) -> Result<Vec<ProcessingNode>> {
    let rows = sqlx::query_as::<_, NodeRow>(&format!("SELECT {} FROM processing_nodes ORDER BY id", NODE_COLUMNS))
      .fetch_all(&self.pool)
      .await?;
    Ok(rows.into_iter().map(Into::into).collect())
  }

  async fn record_snapshot(&self, id: i64, snapshot: NodeSnapshot) -> Result<()> {
    sqlx::query(
      r#"
      UPDATE processing_nodes
      SET api_version = $2, queue_count = $3, max_images = $4, available_options = $5, last_heartbeat = $6
      WHERE id = $1
      "#,
    )
    .bind(id)
    .bind(&snapshot.api_version)
    .bind(snapshot.queue_count)
    .bind(snapshot.max_images)
    .bind(&snapshot.available_options)
    .bind(snapshot.heartbeat)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn increment_queue_count(&self, id: i64) -> Result<()> {
    sqlx::query("UPDATE processing_nodes SET queue_count = queue_count + 1 WHERE id = $1")
      .bind(id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }
}

#[async_trait]
impl ProjectStore for PgStore {
  async fn create_project(&self, owner: &str, name: &str) -> Result<Project> {
    let row = sqlx::query_as::<_, ProjectRow>(
      r#"
      INSERT INTO projects (id, owner, name)
      VALUES ($1, $2, $3)
      RETURNING id, owner, name, deleting, created_at
      "#,
    )
    .bind(Uuid::new_v4())
    .bind(owner)
    .bind(name)
    .fetch_one(&self.pool)
    .await?;
    Ok(row.into())
  }

  async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
    let row = sqlx::query_as::<_, ProjectRow>("SELECT id, owner, name, deleting, created_at FROM projects WHERE id = $1")
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.map(Into::into))
  }

  async fn mark_project_deleting(&self, id: Uuid) -> Result<bool> {
    let result = sqlx::query("UPDATE projects SET deleting = TRUE WHERE id = $1")
      .bind(id)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn delete_empty_deleting_projects(&self) -> Result<u64> {
    let result = sqlx::query(
      r#"
      DELETE FROM projects p
      WHERE p.deleting = TRUE
        AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.project_id = p.id)
      "#,
    )
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected())
  }

  async fn get_quota(&self, username: &str) -> Result<Option<UserQuota>> {
    let row = sqlx::query_as::<_, QuotaRow>("SELECT username, quota, deadline FROM user_quotas WHERE username = $1")
      .bind(username)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.map(Into::into))
  }

  async fn set_quota(&self, username: &str, quota: f64) -> Result<()> {
    sqlx::query(
      r#"
      INSERT INTO user_quotas (username, quota) VALUES ($1, $2)
      ON CONFLICT (username) DO UPDATE SET quota = EXCLUDED.quota
      "#,
    )
    .bind(username)
    .bind(quota)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn set_quota_deadline(&self, username: &str, deadline: Option<DateTime<Utc>>) -> Result<()> {
    sqlx::query("UPDATE user_quotas SET deadline = $2 WHERE username = $1")
      .bind(username)
      .bind(deadline)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn list_quotas(&self) -> Result<Vec<UserQuota>> {
    let rows = sqlx::query_as::<_, QuotaRow>("SELECT username, quota, deadline FROM user_quotas ORDER BY username")
      .fetch_all(&self.pool)
      .await?;
    Ok(rows.into_iter().map(Into::into).collect())
  }
}
