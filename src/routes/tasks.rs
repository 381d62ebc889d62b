use std::sync::OnceLock;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;
use warp::Filter;

use crate::messaging::request_processing;
use crate::models::{NewTask, PendingAction, Task, TaskStatus};
use super::{with_state, ApiError, AppState};

#[derive(Deserialize)]
pub struct NewProject {
  pub owner: String,
  pub name: String,
}

#[derive(Deserialize)]
pub struct OutputQuery {
  #[serde(default)]
  pub line: usize,
}

/// Public view of a task. Console output is served separately.
#[derive(Serialize)]
pub struct TaskResponse {
  pub id: Uuid,
  pub project_id: Uuid,
  pub name: String,
  pub node_id: Option<i64>,
  pub status: Option<TaskStatus>,
  pub pending_action: Option<PendingAction>,
  pub processing_time: i64,
  pub last_error: Option<String>,
  pub upload_progress: f64,
  pub running_progress: f64,
  pub available_assets: Vec<String>,
  pub images_count: i32,
  pub size: f64,
  pub partial: bool,
  pub created_at: DateTime<Utc>,
  pub sse_url: String,
}

impl From<Task> for TaskResponse {
  fn from(task: Task) -> Self {
    Self {
      sse_url: format!("/sse?task_id={}", task.id),
      id: task.id,
      project_id: task.project_id,
      name: task.name,
      node_id: task.node_id,
      status: task.status,
      pending_action: task.pending_action,
      processing_time: task.processing_time,
      last_error: task.last_error,
      upload_progress: task.upload_progress,
      running_progress: task.running_progress,
      available_assets: task.available_assets,
      images_count: task.images_count,
      size: task.size,
      partial: task.partial,
      created_at: task.created_at,
    }
  }
}

fn safe_name_pattern() -> &'static Regex {
  static PATTERN: OnceLock<Regex> = OnceLock::new();
  PATTERN.get_or_init(|| Regex::new(r"^[\w\s.,@!?()\-]*$").unwrap())
}

fn sanitize_input(input: &str) -> bool {
  safe_name_pattern().is_match(input)
}

pub fn task_routes(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let create_project = warp::path!("projects")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_state(state.clone()))
    .and_then(handle_create_project);

  let delete_project = warp::path!("projects" / Uuid)
    .and(warp::delete())
    .and(with_state(state.clone()))
    .and_then(handle_delete_project);

  let create_task = warp::path!("tasks")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_state(state.clone()))
    .and_then(handle_create_task);

  let get_task = warp::path!("tasks" / Uuid)
    .and(warp::get())
    .and(with_state(state.clone()))
    .and_then(handle_get_task);

  let output = warp::path!("tasks" / Uuid / "output")
    .and(warp::get())
    .and(warp::query::<OutputQuery>())
    .and(with_state(state.clone()))
    .and_then(handle_output);

  let action = warp::path!("tasks" / Uuid / String)
    .and(warp::post())
    .and(with_state(state))
    .and_then(handle_action);

  create_project.or(delete_project).or(create_task).or(get_task).or(output).or(action)
}

async fn handle_create_project(new_project: NewProject, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  if new_project.owner.is_empty() || !sanitize_input(&new_project.owner) || !sanitize_input(&new_project.name) {
    return Err(warp::reject::custom(ApiError::bad_request("Invalid or unsafe project owner or name")));
  }
  let project = state.projects
    .create_project(&new_project.owner, &new_project.name)
    .await
    .map_err(|e| warp::reject::custom(ApiError::internal(e)))?;
  info!("Project {} created for {}", project.id, project.owner);
  Ok(warp::reply::json(&project))
}

/// Flags the project and queues REMOVE on every task; the project row goes once they are gone.
async fn handle_delete_project(id: Uuid, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  let marked = state.projects
    .mark_project_deleting(id)
    .await
    .map_err(|e| warp::reject::custom(ApiError::internal(e)))?;
  if !marked {
    return Err(warp::reject::custom(ApiError::not_found("Project not found")));
  }

  let tasks = state.tasks
    .tasks_for_project(id)
    .await
    .map_err(|e| warp::reject::custom(ApiError::internal(e)))?;
  for task in &tasks {
    state.tasks
      .set_pending_action(task.id, Some(PendingAction::Remove))
      .await
      .map_err(|e| warp::reject::custom(ApiError::internal(e)))?;
    notify_workers(&state, task.id).await;
  }
  info!("Project {} marked for deletion ({} task(s) to remove)", id, tasks.len());
  Ok(warp::reply::json(&serde_json::json!({ "success": true })))
}

async fn handle_create_task(new_task: NewTask, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  if !sanitize_input(&new_task.name) {
    error!("Rejected task name {:?}", new_task.name);
    return Err(warp::reject::custom(ApiError::bad_request("Invalid or unsafe task name")));
  }
  if !new_task.options.is_array() {
    return Err(warp::reject::custom(ApiError::bad_request("'options' must be a list")));
  }

  let project = state.projects
    .get_project(new_task.project_id)
    .await
    .map_err(|e| warp::reject::custom(ApiError::internal(e)))?;
  let project = match project {
    Some(p) if !p.deleting => p,
    _ => return Err(warp::reject::custom(ApiError::not_found("Project not found"))),
  };
  if let Some(quota) = &state.quota {
    let exceeded = quota
      .has_exceeded_quota_cached(&project.owner)
      .await
      .map_err(|e| warp::reject::custom(ApiError::internal(e)))?;
    if exceeded {
      return Err(warp::reject::custom(ApiError::bad_request("Storage quota exceeded")));
    }
  }

  let task = state.tasks
    .create_task(new_task)
    .await
    .map_err(|e| warp::reject::custom(ApiError::internal(e)))?;
  info!("Task {} created", task);

  if !task.partial {
    notify_workers(&state, task.id).await;
  }
  Ok(warp::reply::json(&TaskResponse::from(task)))
}

async fn load_task(state: &AppState, id: Uuid) -> Result<Task, warp::Rejection> {
  state.tasks
    .get_task(id)
    .await
    .map_err(|e| warp::reject::custom(ApiError::internal(e)))?
    .ok_or_else(|| warp::reject::custom(ApiError::not_found("Task not found")))
}

async fn handle_get_task(id: Uuid, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  let task = load_task(&state, id).await?;
  Ok(warp::reply::json(&TaskResponse::from(task)))
}

async fn handle_output(id: Uuid, query: OutputQuery, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  let task = load_task(&state, id).await?;
  Ok(task.console_from_line(query.line))
}

async fn handle_action(id: Uuid, name: String, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  let action = PendingAction::from_name(&name)
    .ok_or_else(|| warp::reject::custom(ApiError::bad_request(format!("Unknown action '{}'", name))))?;
  let task = load_task(&state, id).await?;

  if action == PendingAction::Import && task.import_url.is_empty() {
    return Err(warp::reject::custom(ApiError::bad_request("Task has no import URL")));
  }
  if action == PendingAction::Compact && task.status != Some(TaskStatus::Completed) {
    return Err(warp::reject::custom(ApiError::bad_request("Only completed tasks can be compacted")));
  }

  let updated = state.tasks
    .set_pending_action(id, Some(action))
    .await
    .map_err(|e| warp::reject::custom(ApiError::internal(e)))?;
  if !updated {
    return Err(warp::reject::custom(ApiError::not_found("Task not found")));
  }
  info!("Requested {:?} on {}", action, task);

  notify_workers(&state, id).await;
  Ok(warp::reply::json(&serde_json::json!({ "success": true })))
}

/// Best effort: the scheduler tick picks the task up anyway if the message is lost.
async fn notify_workers(state: &AppState, id: Uuid) {
  if let Some(channel) = &state.channel {
    if let Err(e) = request_processing(channel, id).await {
      error!("Failed to publish process request for {}: {:?}", id, e);
    }
  }
}
