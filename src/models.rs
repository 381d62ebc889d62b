use std::fmt;
use serde::{Serialize, Deserialize};
use uuid::Uuid;
use chrono::{DateTime, Duration, Utc};

/// Lifecycle status as reported by a processing node. `None` on a task means "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
  Queued,
  Running,
  Failed,
  Completed,
  Canceled,
}

impl TaskStatus {
  pub fn code(self) -> i32 {
    match self {
      TaskStatus::Queued => 10,
      TaskStatus::Running => 20,
      TaskStatus::Failed => 30,
      TaskStatus::Completed => 40,
      TaskStatus::Canceled => 50,
    }
  }

  pub fn from_code(code: i32) -> Option<Self> {
    match code {
      10 => Some(TaskStatus::Queued),
      20 => Some(TaskStatus::Running),
      30 => Some(TaskStatus::Failed),
      40 => Some(TaskStatus::Completed),
      50 => Some(TaskStatus::Canceled),
      _ => None,
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, TaskStatus::Failed | TaskStatus::Completed | TaskStatus::Canceled)
  }
}

/// One-shot operation requested by a user, executed at the next tick that claims the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingAction {
  Cancel,
  Remove,
  Restart,
  Import,
  Compact,
}

impl PendingAction {
  pub fn code(self) -> i32 {
    match self {
      PendingAction::Cancel => 1,
      PendingAction::Remove => 2,
      PendingAction::Restart => 3,
      PendingAction::Import => 5,
      PendingAction::Compact => 6,
    }
  }

  pub fn from_code(code: i32) -> Option<Self> {
    match code {
      1 => Some(PendingAction::Cancel),
      2 => Some(PendingAction::Remove),
      3 => Some(PendingAction::Restart),
      5 => Some(PendingAction::Import),
      6 => Some(PendingAction::Compact),
      _ => None,
    }
  }

  pub fn from_name(name: &str) -> Option<Self> {
    match name {
      "cancel" => Some(PendingAction::Cancel),
      "remove" => Some(PendingAction::Remove),
      "restart" => Some(PendingAction::Restart),
      "import" => Some(PendingAction::Import),
      "compact" => Some(PendingAction::Compact),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
  pub id: Uuid,
  pub project_id: Uuid,
  pub name: String,
  pub remote_id: String,
  pub node_id: Option<i64>,
  pub auto_assign: bool,
  pub status: Option<TaskStatus>,
  pub pending_action: Option<PendingAction>,
  pub processing_lock: bool,
  pub locked_at: Option<DateTime<Utc>>,
  /// Identifies the claim that holds the lock. Only its holder may refresh or release it.
  pub lock_token: Option<Uuid>,
  pub options: serde_json::Value,
  pub console_output: String,
  pub processing_time: i64,
  pub last_error: Option<String>,
  pub upload_progress: f64,
  pub running_progress: f64,
  pub available_assets: Vec<String>,
  pub images_count: i32,
  pub size: f64,
  pub compacted: bool,
  pub import_url: String,
  pub partial: bool,
  pub created_at: DateTime<Utc>,
}

impl Task {
  pub fn new(project_id: Uuid, name: impl Into<String>) -> Self {
    Self {
      id: Uuid::new_v4(),
      project_id,
      name: name.into(),
      remote_id: String::new(),
      node_id: None,
      auto_assign: true,
      status: None,
      pending_action: None,
      processing_lock: false,
      locked_at: None,
      lock_token: None,
      options: serde_json::Value::Array(Vec::new()),
      console_output: String::new(),
      processing_time: -1,
      last_error: None,
      upload_progress: 0.0,
      running_progress: 0.0,
      available_assets: Vec::new(),
      images_count: 0,
      size: 0.0,
      compacted: false,
      import_url: String::new(),
      partial: false,
      created_at: Utc::now(),
    }
  }

  /// Whether the scheduler has any reason to pick this task up.
  pub fn needs_processing(&self) -> bool {
    if self.partial {
      return false;
    }
    let unassigned = self.node_id.is_none() && self.auto_assign;
    let pollable = self.node_id.is_some()
      && matches!(self.status, None | Some(TaskStatus::Queued) | Some(TaskStatus::Running));
    unassigned || pollable || self.pending_action.is_some()
  }

  /// A lock whose lease was not refreshed within `ttl` belongs to a worker that died.
  pub fn is_locked(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
    match (self.processing_lock, self.locked_at) {
      (false, _) => false,
      (true, Some(locked_at)) => now - locked_at <= ttl,
      (true, None) => true,
    }
  }

  /// Number of console lines already received, used as the offset for the next poll.
  pub fn console_line_count(&self) -> usize {
    self.console_output.lines().count()
  }

  /// Console output starting at `line` (0-based).
  pub fn console_from_line(&self, line: usize) -> String {
    self.console_output
      .split_inclusive('\n')
      .skip(line)
      .collect()
  }

  /// Task options without the named entry.
  pub fn options_without(&self, name: &str) -> serde_json::Value {
    match &self.options {
      serde_json::Value::Array(items) => serde_json::Value::Array(
        items
          .iter()
          .filter(|opt| opt.get("name").and_then(|v| v.as_str()) != Some(name))
          .cloned()
          .collect(),
      ),
      other => other.clone(),
    }
  }
}

impl fmt::Display for Task {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.name.is_empty() {
      write!(f, "Task [{}]", self.id)
    } else {
      write!(f, "{} ({})", self.name, self.id)
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
  pub project_id: Uuid,
  #[serde(default)]
  pub name: String,
  #[serde(default = "empty_options")]
  pub options: serde_json::Value,
  #[serde(default)]
  pub node_id: Option<i64>,
  #[serde(default = "default_true")]
  pub auto_assign: bool,
  #[serde(default)]
  pub images_count: i32,
  #[serde(default)]
  pub import_url: Option<String>,
  #[serde(default)]
  pub partial: bool,
}

fn empty_options() -> serde_json::Value {
  serde_json::Value::Array(Vec::new())
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
  pub id: Uuid,
  pub owner: String,
  pub name: String,
  pub deleting: bool,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingNode {
  pub id: i64,
  pub hostname: String,
  pub port: i32,
  #[serde(skip_serializing, default)]
  pub token: String,
  pub label: String,
  pub api_version: String,
  pub max_images: Option<i32>,
  pub queue_count: i32,
  pub last_heartbeat: Option<DateTime<Utc>>,
  pub available_options: serde_json::Value,
  pub created_at: DateTime<Utc>,
}

impl ProcessingNode {
  pub fn is_online(&self, now: DateTime<Utc>, offline_window: Duration) -> bool {
    self.last_heartbeat.is_some_and(|beat| now - beat <= offline_window)
  }

  pub fn base_url(&self) -> String {
    if self.hostname.starts_with("http://") || self.hostname.starts_with("https://") {
      format!("{}:{}", self.hostname.trim_end_matches('/'), self.port)
    } else if self.port == 443 {
      format!("https://{}", self.hostname)
    } else {
      format!("http://{}:{}", self.hostname, self.port)
    }
  }
}

impl fmt::Display for ProcessingNode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.label.is_empty() {
      write!(f, "{}:{}", self.hostname, self.port)
    } else {
      write!(f, "{}", self.label)
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNode {
  pub hostname: String,
  pub port: i32,
  #[serde(default)]
  pub token: String,
  #[serde(default)]
  pub label: String,
}

/// Heartbeat snapshot written back to the registry after a successful probe.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
  pub api_version: String,
  pub queue_count: i32,
  pub max_images: Option<i32>,
  pub available_options: serde_json::Value,
  pub heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuota {
  pub username: String,
  /// Megabytes; negative means unlimited.
  pub quota: f64,
  pub deadline: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn node(heartbeat: Option<DateTime<Utc>>) -> ProcessingNode {
    ProcessingNode {
      id: 1,
      hostname: "localhost".into(),
      port: 3000,
      token: String::new(),
      label: String::new(),
      api_version: String::new(),
      max_images: None,
      queue_count: 0,
      last_heartbeat: heartbeat,
      available_options: serde_json::json!([]),
      created_at: Utc::now(),
    }
  }

  #[test]
  fn status_codes_round_trip_and_reject_unknown() {
    for status in [TaskStatus::Queued, TaskStatus::Running, TaskStatus::Failed, TaskStatus::Completed, TaskStatus::Canceled] {
      assert_eq!(TaskStatus::from_code(status.code()), Some(status));
    }
    assert_eq!(TaskStatus::from_code(0), None);
    assert_eq!(PendingAction::from_code(4), None);
  }

  #[test]
  fn node_online_window() {
    let now = Utc::now();
    let window = Duration::minutes(5);
    assert!(node(Some(now - Duration::minutes(4))).is_online(now, window));
    assert!(!node(Some(now - Duration::minutes(6))).is_online(now, window));
    assert!(!node(None).is_online(now, window));
  }

  #[test]
  fn base_url_handles_scheme_and_tls_port() {
    let mut n = node(None);
    assert_eq!(n.base_url(), "http://localhost:3000");
    n.port = 443;
    n.hostname = "nodes.example.com".into();
    assert_eq!(n.base_url(), "https://nodes.example.com");
  }

  #[test]
  fn partial_tasks_are_never_eligible() {
    let mut task = Task::new(Uuid::new_v4(), "t");
    assert!(task.needs_processing());
    task.partial = true;
    assert!(!task.needs_processing());
  }

  #[test]
  fn completed_task_with_node_is_not_eligible() {
    let mut task = Task::new(Uuid::new_v4(), "t");
    task.node_id = Some(1);
    task.status = Some(TaskStatus::Completed);
    assert!(!task.needs_processing());
    task.pending_action = Some(PendingAction::Remove);
    assert!(task.needs_processing());
  }

  #[test]
  fn expired_lock_lease_is_released() {
    let now = Utc::now();
    let mut task = Task::new(Uuid::new_v4(), "t");
    task.processing_lock = true;
    task.locked_at = Some(now - Duration::seconds(10));
    assert!(task.is_locked(now, Duration::seconds(30)));
    task.locked_at = Some(now - Duration::seconds(60));
    assert!(!task.is_locked(now, Duration::seconds(30)));
  }

  #[test]
  fn options_without_drops_named_entry() {
    let mut task = Task::new(Uuid::new_v4(), "t");
    task.options = serde_json::json!([{"name": "rerun-from", "value": "mvs"}, {"name": "dsm", "value": true}]);
    assert_eq!(task.options_without("rerun-from"), serde_json::json!([{"name": "dsm", "value": true}]));
  }

  #[test]
  fn console_from_line_skips_seen_lines() {
    let mut task = Task::new(Uuid::new_v4(), "t");
    task.console_output = "a\nb\nc\n".into();
    assert_eq!(task.console_line_count(), 3);
    assert_eq!(task.console_from_line(1), "b\nc\n");
    assert_eq!(task.console_from_line(5), "");
  }
}
