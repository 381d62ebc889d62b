//! In-process store used by tests and single-process setups.
//!
//! A single mutex over all tables gives the same claim atomicity the database
//! gets from a transaction.

use std::collections::{BTreeMap, HashMap};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{NewNode, NewTask, NodeSnapshot, PendingAction, ProcessingNode, Project, Task, UserQuota};
use super::{NodeStore, ProjectStore, TaskStore};

#[derive(Default)]
struct Tables {
  tasks: HashMap<Uuid, Task>,
  nodes: BTreeMap<i64, ProcessingNode>,
  projects: HashMap<Uuid, Project>,
  quotas: HashMap<String, UserQuota>,
  next_node_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
  tables: Mutex<Tables>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Inserts a fully-formed task, bypassing `create_task` defaults.
  pub async fn insert_task(&self, task: Task) {
    self.tables.lock().await.tasks.insert(task.id, task);
  }

  pub async fn task_count(&self) -> usize {
    self.tables.lock().await.tasks.len()
  }

  /// Overwrites a node's heartbeat, for simulating nodes going quiet.
  pub async fn set_heartbeat(&self, id: i64, heartbeat: Option<DateTime<Utc>>) {
    if let Some(node) = self.tables.lock().await.nodes.get_mut(&id) {
      node.last_heartbeat = heartbeat;
    }
  }

  pub async fn set_queue_count(&self, id: i64, queue_count: i32) {
    if let Some(node) = self.tables.lock().await.nodes.get_mut(&id) {
      node.queue_count = queue_count;
    }
  }
}

fn owner_of(tables: &Tables, task: &Task) -> Option<String> {
  tables.projects.get(&task.project_id).map(|p| p.owner.clone())
}

#[async_trait]
impl TaskStore for MemoryStore {
  async fn create_task(&self, new_task: NewTask) -> Result<Task> {
    let mut tables = self.tables.lock().await;
    if !tables.projects.contains_key(&new_task.project_id) {
      return Err(anyhow!("Project {} does not exist", new_task.project_id));
    }
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
    tables.tasks.insert(task.id, task.clone());
    Ok(task)
  }

  async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
    Ok(self.tables.lock().await.tasks.get(&id).cloned())
  }

  async fn save_task(&self, task: &Task) -> Result<bool> {
    let mut tables = self.tables.lock().await;
    match tables.tasks.get_mut(&task.id) {
      Some(stored) => {
        let pending_action = stored.pending_action;
        let processing_lock = stored.processing_lock;
        let locked_at = stored.locked_at;
        let lock_token = stored.lock_token;
        *stored = task.clone();
        stored.pending_action = pending_action;
        stored.processing_lock = processing_lock;
        stored.locked_at = locked_at;
        stored.lock_token = lock_token;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn delete_task(&self, id: Uuid) -> Result<bool> {
    Ok(self.tables.lock().await.tasks.remove(&id).is_some())
  }

  async fn set_pending_action(&self, id: Uuid, action: Option<PendingAction>) -> Result<bool> {
    match self.tables.lock().await.tasks.get_mut(&id) {
      Some(task) => {
        task.pending_action = action;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn claim_pending_tasks(&self, limit: usize, ttl: Duration, token: Uuid) -> Result<Vec<Task>> {
    let now = Utc::now();
    let mut tables = self.tables.lock().await;
    let mut eligible: Vec<&mut Task> = tables
      .tasks
      .values_mut()
      .filter(|t| t.needs_processing() && !t.is_locked(now, ttl))
      .collect();
    eligible.sort_by_key(|t| t.created_at);

    Ok(eligible
      .into_iter()
      .take(limit)
      .map(|task| {
        task.processing_lock = true;
        task.locked_at = Some(now);
        task.lock_token = Some(token);
        task.clone()
      })
      .collect())
  }

  async fn claim_task(&self, id: Uuid, ttl: Duration, token: Uuid) -> Result<Option<Task>> {
    let now = Utc::now();
    let mut tables = self.tables.lock().await;
    match tables.tasks.get_mut(&id) {
      Some(task) if !task.is_locked(now, ttl) => {
        task.processing_lock = true;
        task.locked_at = Some(now);
        task.lock_token = Some(token);
        Ok(Some(task.clone()))
      }
      _ => Ok(None),
    }
  }

  async fn refresh_lock(&self, id: Uuid, token: Uuid) -> Result<bool> {
    match self.tables.lock().await.tasks.get_mut(&id) {
      Some(task) if task.processing_lock && task.lock_token == Some(token) => {
        task.locked_at = Some(Utc::now());
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn release_lock(&self, id: Uuid, token: Uuid) -> Result<bool> {
    match self.tables.lock().await.tasks.get_mut(&id) {
      Some(task) if task.lock_token == Some(token) => {
        task.processing_lock = false;
        task.locked_at = None;
        task.lock_token = None;
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn tasks_for_project(&self, project_id: Uuid) -> Result<Vec<Task>> {
    let tables = self.tables.lock().await;
    let mut tasks: Vec<Task> = tables
      .tasks
      .values()
      .filter(|t| t.project_id == project_id)
      .cloned()
      .collect();
    tasks.sort_by_key(|t| t.created_at);
    Ok(tasks)
  }

  async fn tasks_for_owner(&self, owner: &str) -> Result<Vec<Task>> {
    let tables = self.tables.lock().await;
    let mut tasks: Vec<Task> = tables
      .tasks
      .values()
      .filter(|t| owner_of(&tables, t).as_deref() == Some(owner))
      .cloned()
      .collect();
    tasks.sort_by_key(|t| t.created_at);
    Ok(tasks)
  }
}

#[async_trait]
impl NodeStore for MemoryStore {
  async fn add_node(&self, node: NewNode) -> Result<ProcessingNode> {
    let mut tables = self.tables.lock().await;
    tables.next_node_id += 1;
    let node = ProcessingNode {
      id: tables.next_node_id,
      hostname: node.hostname,
      port: node.port,
      token: node.token,
      label: node.label,
      api_version: String::new(),
      max_images: None,
      queue_count: 0,
      last_heartbeat: None,
      available_options: serde_json::Value::Array(Vec::new()),
      created_at: Utc::now(),
    };
    tables.nodes.insert(node.id, node.clone());
    Ok(node)
  }

  async fn get_node(&self, id: i64) -> Result<Option<ProcessingNode>> {
    Ok(self.tables.lock().await.nodes.get(&id).cloned())
  }

  async fn list_nodes(&self) -> Result<Vec<ProcessingNode>> {
    Ok(self.tables.lock().await.nodes.values().cloned().collect())
  }

  async fn record_snapshot(&self, id: i64, snapshot: NodeSnapshot) -> Result<()> {
    if let Some(node) = self.tables.lock().await.nodes.get_mut(&id) {
      node.api_version = snapshot.api_version;
      node.queue_count = snapshot.queue_count;
      node.max_images = snapshot.max_images;
      node.available_options = snapshot.available_options;
      node.last_heartbeat = Some(snapshot.heartbeat);
    }
    Ok(())
  }

  async fn increment_queue_count(&self, id: i64) -> Result<()> {
    if let Some(node) = self.tables.lock().await.nodes.get_mut(&id) {
      node.queue_count += 1;
    }
    Ok(())
  }
}

#[async_trait]
impl ProjectStore for MemoryStore {
  async fn create_project(&self, owner: &str, name: &str) -> Result<Project> {
    let project = Project {
      id: Uuid::new_v4(),
      owner: owner.to_string(),
      name: name.to_string(),
      deleting: false,
      created_at: Utc::now(),
    };
    self.tables.lock().await.projects.insert(project.id, project.clone());
    Ok(project)
  }

  async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
    Ok(self.tables.lock().await.projects.get(&id).cloned())
  }

  async fn mark_project_deleting(&self, id: Uuid) -> Result<bool> {
    match self.tables.lock().await.projects.get_mut(&id) {
      Some(project) => {
        project.deleting = true;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn delete_empty_deleting_projects(&self) -> Result<u64> {
    let mut tables = self.tables.lock().await;
    let doomed: Vec<Uuid> = tables
      .projects
      .values()
      .filter(|p| p.deleting && !tables.tasks.values().any(|t| t.project_id == p.id))
      .map(|p| p.id)
      .collect();
    for id in &doomed {
      tables.projects.remove(id);
    }
    Ok(doomed.len() as u64)
  }

  async fn get_quota(&self, username: &str) -> Result<Option<UserQuota>> {
    Ok(self.tables.lock().await.quotas.get(username).cloned())
  }

  async fn set_quota(&self, username: &str, quota: f64) -> Result<()> {
    let mut tables = self.tables.lock().await;
    tables
      .quotas
      .entry(username.to_string())
      .and_modify(|q| q.quota = quota)
      .or_insert_with(|| UserQuota { username: username.to_string(), quota, deadline: None });
    Ok(())
  }

  async fn set_quota_deadline(&self, username: &str, deadline: Option<DateTime<Utc>>) -> Result<()> {
    if let Some(quota) = self.tables.lock().await.quotas.get_mut(username) {
      quota.deadline = deadline;
    }
    Ok(())
  }

  async fn list_quotas(&self) -> Result<Vec<UserQuota>> {
    Ok(self.tables.lock().await.quotas.values().cloned().collect())
  }
}
