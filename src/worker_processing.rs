//! The per-task state machine. One call to [`TaskProcessor::process`] is one step:
//! assignment, health check, submission, then either a pending action or a status poll.
//! Every sub-step persists what it changed before the next one runs.

use std::io;
use std::path::Path;
use std::sync::Arc;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::assets::{self, ALL_ASSETS_ARCHIVE, ArchiveError, TaskPaths};
use crate::models::{PendingAction, ProcessingNode, Task, TaskStatus};
use crate::node_client::{NodeApi, NodeError};
use crate::node_registry::NodeRegistry;
use crate::store::TaskStore;

/// Share of the progress bar reserved for remote processing; the rest covers the download.
const RUNNING_PROGRESS_CEILING: f64 = 0.85;

/// Download attempts before a corrupt archive fails the task.
const MAX_ARCHIVE_ATTEMPTS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
  Updated,
  /// The task record no longer exists; there is no lock left to release.
  Removed,
}

#[derive(Debug, Error)]
enum StepError {
  #[error(transparent)]
  Node(#[from] NodeError),

  #[error("{0}")]
  Precondition(String),

  #[error(transparent)]
  Archive(ArchiveError),

  #[error(transparent)]
  Io(#[from] io::Error),

  #[error(transparent)]
  Internal(#[from] anyhow::Error),
}

type StepResult<T> = Result<T, StepError>;

/// Where an asset archive comes from.
enum ArchiveSource {
  Node { api: Arc<dyn NodeApi>, remote_id: String },
  Url(String),
}

pub struct TaskProcessor {
  tasks: Arc<dyn TaskStore>,
  nodes: Arc<NodeRegistry>,
  paths: TaskPaths,
  http: reqwest::Client,
}

impl TaskProcessor {
  /// `http` fetches import archives; build it with [`crate::node_client::http_client`] so a
  /// stalled source cannot hold the task forever.
  pub fn new(tasks: Arc<dyn TaskStore>, nodes: Arc<NodeRegistry>, paths: TaskPaths, http: reqwest::Client) -> Self {
    Self { tasks, nodes, paths, http }
  }

  /// Runs one step. Node refusals and local precondition violations end up on the task as a
  /// failure; connection problems leave it untouched for the next tick. Only store and local
  /// I/O errors are returned.
  pub async fn process(&self, mut task: Task) -> anyhow::Result<StepOutcome> {
    match self.step(&mut task).await {
      Ok(outcome) => Ok(outcome),
      Err(StepError::Node(e)) if e.is_transient() => {
        warn!("{} connection/timeout error: {}. We'll try reprocessing at the next tick.", task, e);
        Ok(StepOutcome::Updated)
      }
      Err(StepError::Internal(e)) => Err(e),
      Err(StepError::Io(e)) => Err(e.into()),
      Err(e) => {
        self.set_failure(&mut task, e.to_string()).await?;
        Ok(StepOutcome::Updated)
      }
    }
  }

  async fn step(&self, task: &mut Task) -> StepResult<StepOutcome> {
    let not_stopped = !matches!(task.status, Some(TaskStatus::Failed) | Some(TaskStatus::Canceled));
    if task.auto_assign && task.node_id.is_none() && not_stopped {
      if let Some(node) = self.nodes.find_best_available_node().await? {
        self.nodes.note_assignment(&node).await?;
        task.node_id = Some(node.id);
        info!("Automatically assigned processing node {} to {}", node, task);
        self.save(task).await?;
      }
    }

    let node = self.online_node(task).await?;

    if let Some(node) = &node {
      if task.remote_id.is_empty() && task.pending_action.is_none() && task.status.is_none() {
        self.submit(task, node).await?;
      }
    }

    if let Some(action) = task.pending_action {
      return match action {
        PendingAction::Cancel => self.cancel(task, node.as_ref()).await,
        PendingAction::Restart => self.restart(task, node.as_ref()).await,
        PendingAction::Remove => self.remove(task, node.as_ref()).await,
        PendingAction::Import => self.import(task).await,
        PendingAction::Compact => self.compact(task).await,
      };
    }

    if let Some(node) = &node {
      let pollable = matches!(task.status, None | Some(TaskStatus::Queued) | Some(TaskStatus::Running));
      if !task.remote_id.is_empty() && pollable {
        self.poll(task, node).await?;
      }
    }

    Ok(StepOutcome::Updated)
  }

  /// Resolves the assigned node, detaching the task if that node is gone or offline so the
  /// next tick can hand it to someone else.
  async fn online_node(&self, task: &mut Task) -> StepResult<Option<ProcessingNode>> {
    let Some(node_id) = task.node_id else {
      return Ok(None);
    };

    let node = self.nodes.get(node_id).await?;
    if let Some(node) = node.filter(|n| self.nodes.is_online(n)) {
      return Ok(Some(node));
    }

    info!("Processing node {} went offline, detaching {}", node_id, task);
    task.node_id = None;
    task.remote_id.clear();
    if matches!(task.status, Some(TaskStatus::Queued) | Some(TaskStatus::Running)) {
      // Whatever ran on the dead node is lost; start over elsewhere.
      task.status = None;
      task.console_output.clear();
      task.processing_time = -1;
      task.running_progress = 0.0;
      task.upload_progress = 0.0;
    }
    self.save(task).await?;
    Ok(None)
  }

  async fn submit(&self, task: &mut Task, node: &ProcessingNode) -> StepResult<()> {
    info!("Processing... {}", task);
    let task_dir = self.paths.task_dir(task.project_id, task.id);
    let images = tokio::task::spawn_blocking(move || assets::scan_images(&task_dir))
      .await
      .map_err(anyhow::Error::from)?;
    let api = self.nodes.connector().connect(node);

    let remote_id = api.submit_task(&images, &task.name, &task.options).await?;
    info!("{} submitted to {} as {}", task, node, remote_id);

    task.remote_id = remote_id;
    task.upload_progress = 1.0;
    task.images_count = images.len() as i32;
    self.save(task).await
  }

  async fn cancel(&self, task: &mut Task, node: Option<&ProcessingNode>) -> StepResult<StepOutcome> {
    info!("Canceling {}", task);
    let node = match node {
      Some(node) if !task.remote_id.is_empty() => node,
      _ => {
        return Err(StepError::Precondition(
          "Cannot cancel a task that has not been submitted to a processing node".into(),
        ));
      }
    };

    let api = self.nodes.connector().connect(node);
    match api.cancel_task(&task.remote_id).await {
      Ok(()) => debug!("{} canceled on {}, waiting for confirmation", task, node),
      Err(e) => {
        warn!("Could not cancel {} on processing node ({}). We'll proceed anyway...", task, e);
        task.status = Some(TaskStatus::Canceled);
        self.save(task).await?;
      }
    }

    self.clear_pending_action(task).await?;
    Ok(StepOutcome::Updated)
  }

  async fn restart(&self, task: &mut Task, node: Option<&ProcessingNode>) -> StepResult<StepOutcome> {
    info!("Restarting {}", task);
    let mut reprocess = task.remote_id.is_empty();

    match node {
      Some(node) if !reprocess => {
        let api = self.nodes.connector().connect(node);

        // Nodes purge old results, so the remote task may be long gone.
        match api.get_task_info(&task.remote_id, task.console_line_count()).await {
          Ok(info) => reprocess = info.uuid != task.remote_id,
          Err(e) if e.is_transient() => return Err(e.into()),
          Err(_) => reprocess = true,
        }

        if !reprocess {
          match api.restart_task(&task.remote_id, &task.options).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
              warn!("Could not restart {} ({}), will start a new one", task, e);
              reprocess = true;
            }
          }
        }
      }
      Some(_) => {}
      None if task.auto_assign => reprocess = true,
      None => {
        return Err(StepError::Precondition("Cannot restart a task that has no processing node".into()));
      }
    }

    if reprocess {
      info!("{} needs to be reprocessed", task);
      task.remote_id.clear();
      task.options = task.options_without("rerun-from");
      task.upload_progress = 0.0;
    }

    task.console_output.clear();
    task.processing_time = -1;
    task.status = None;
    task.last_error = None;
    task.running_progress = 0.0;
    self.save(task).await?;
    self.clear_pending_action(task).await?;
    Ok(StepOutcome::Updated)
  }

  async fn remove(&self, task: &mut Task, node: Option<&ProcessingNode>) -> StepResult<StepOutcome> {
    info!("Removing {}", task);
    if let Some(node) = node {
      if !task.remote_id.is_empty() {
        // Nodes expire old results on their own, so a failure here is harmless.
        if let Err(e) = self.nodes.connector().connect(node).remove_task(&task.remote_id).await {
          debug!("Could not remove {} from {}: {}", task, node, e);
        }
      }
    }

    self.tasks.delete_task(task.id).await?;

    let task_dir = self.paths.task_dir(task.project_id, task.id);
    match tokio::fs::remove_dir_all(&task_dir).await {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => warn!("Cannot remove {}: {}", task_dir.display(), e),
    }
    Ok(StepOutcome::Removed)
  }

  async fn import(&self, task: &mut Task) -> StepResult<StepOutcome> {
    info!("Importing {} from {}", task, task.import_url);
    if task.import_url.is_empty() {
      return Err(StepError::Precondition("Nothing to import: the import URL is empty".into()));
    }

    let source = ArchiveSource::Url(task.import_url.clone());
    self.download_and_complete(task, source).await?;
    self.clear_pending_action(task).await?;
    Ok(StepOutcome::Updated)
  }

  async fn compact(&self, task: &mut Task) -> StepResult<StepOutcome> {
    info!("Compacting {}", task);
    let task_dir = self.paths.task_dir(task.project_id, task.id);
    let (removed, size) = tokio::task::spawn_blocking(move || {
      let removed = assets::remove_images(&task_dir);
      (removed, assets::directory_size_mb(&task_dir))
    })
    .await
    .map_err(anyhow::Error::from)?;
    debug!("Removed {} image(s) from {}", removed, task);

    task.compacted = true;
    task.size = size;
    self.save(task).await?;
    self.clear_pending_action(task).await?;
    Ok(StepOutcome::Updated)
  }

  async fn poll(&self, task: &mut Task, node: &ProcessingNode) -> StepResult<()> {
    let api = self.nodes.connector().connect(node);
    let info = api.get_task_info(&task.remote_id, task.console_line_count()).await?;

    task.processing_time = info.processing_time;
    task.running_progress = (info.progress / 100.0).clamp(0.0, 1.0) * RUNNING_PROGRESS_CEILING;
    for line in &info.output {
      task.console_output.push_str(line);
      task.console_output.push('\n');
    }
    if let Some(message) = info.error_message {
      task.last_error = Some(message);
    }

    match info.status {
      TaskStatus::Completed => {
        info!("Processing status: COMPLETED for {}", task);
        let source = ArchiveSource::Node { api, remote_id: task.remote_id.clone() };
        self.download_and_complete(task, source).await
      }
      status => {
        if status.is_terminal() {
          info!("Processing status: {:?} for {}", status, task);
        }
        task.status = Some(status);
        self.save(task).await
      }
    }
  }

  /// Replaces the assets directory with the contents of a freshly downloaded archive and marks
  /// the task COMPLETED. Corrupt downloads are fetched again a few times.
  async fn download_and_complete(&self, task: &mut Task, source: ArchiveSource) -> StepResult<()> {
    let assets_dir = self.paths.assets_dir(task.project_id, task.id);
    let archive = assets_dir.join(ALL_ASSETS_ARCHIVE);

    let mut attempt = 1;
    loop {
      match tokio::fs::remove_dir_all(&assets_dir).await {
        Ok(()) => info!("Removed old assets directory for {}", task),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
      }
      tokio::fs::create_dir_all(&assets_dir).await?;

      info!("Downloading {} for {}", ALL_ASSETS_ARCHIVE, task);
      let stream = self.open_archive(&source).await?;
      write_stream(stream, &archive).await?;

      info!("Extracting {} for {}", ALL_ASSETS_ARCHIVE, task);
      let (zip_path, dest) = (archive.clone(), assets_dir.clone());
      let extracted = tokio::task::spawn_blocking(move || assets::extract_archive(&zip_path, &dest))
        .await
        .map_err(anyhow::Error::from)?;

      match extracted {
        Ok(()) => break,
        Err(e) if e.is_corrupt() && attempt < MAX_ARCHIVE_ATTEMPTS => {
          warn!("{} seems corrupted ({}). Retrying...", archive.display(), e);
          attempt += 1;
        }
        Err(e) => return Err(StepError::Archive(e)),
      }
    }

    let task_dir = self.paths.task_dir(task.project_id, task.id);
    let (available, size) = tokio::task::spawn_blocking(move || {
      (assets::available_assets(&assets_dir), assets::directory_size_mb(&task_dir))
    })
    .await
    .map_err(anyhow::Error::from)?;

    task.available_assets = available;
    task.size = size;
    task.running_progress = 1.0;
    task.status = Some(TaskStatus::Completed);
    task.console_output.push_str("Done!\n");
    self.save(task).await?;
    info!("{} completed with {} asset(s)", task, task.available_assets.len());
    Ok(())
  }

  async fn open_archive(&self, source: &ArchiveSource) -> StepResult<BoxStream<'static, Result<Bytes, NodeError>>> {
    match source {
      ArchiveSource::Node { api, remote_id } => Ok(api.download_asset(remote_id, ALL_ASSETS_ARCHIVE).await?),
      ArchiveSource::Url(url) => {
        let response = self.http.get(url).send().await.map_err(NodeError::from)?;
        if !response.status().is_success() {
          return Err(StepError::Node(NodeError::Server(format!(
            "Cannot download {} (status {})",
            url,
            response.status().as_u16()
          ))));
        }
        Ok(response.bytes_stream().map_err(NodeError::from).boxed())
      }
    }
  }

  async fn set_failure(&self, task: &mut Task, message: String) -> anyhow::Result<()> {
    error!("FAILURE FOR {}: {}", task, message);
    task.last_error = Some(message);
    task.status = Some(TaskStatus::Failed);
    self.tasks.save_task(task).await?;
    self.tasks.set_pending_action(task.id, None).await?;
    task.pending_action = None;
    Ok(())
  }

  async fn save(&self, task: &Task) -> StepResult<()> {
    if !self.tasks.save_task(task).await? {
      warn!("{} disappeared while it was being processed", task);
    }
    Ok(())
  }

  async fn clear_pending_action(&self, task: &mut Task) -> StepResult<()> {
    self.tasks.set_pending_action(task.id, None).await?;
    task.pending_action = None;
    Ok(())
  }
}

async fn write_stream(mut stream: BoxStream<'static, Result<Bytes, NodeError>>, path: &Path) -> StepResult<u64> {
  let mut file = tokio::fs::File::create(path).await?;
  let mut written = 0u64;
  while let Some(chunk) = stream.next().await {
    let chunk = chunk?;
    file.write_all(&chunk).await?;
    written += chunk.len() as u64;
  }
  file.flush().await?;
  Ok(written)
}
