#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use photoq::assets::TaskPaths;
use photoq::models::{NewNode, ProcessingNode, Project, Task, TaskStatus};
use photoq::node_client::{http_client, NodeApi, NodeConnector, NodeError, NodeInfo, RemoteTaskInfo, Result};
use photoq::node_registry::NodeRegistry;
use photoq::store::{MemoryStore, NodeStore, ProjectStore};
use photoq::worker_processing::TaskProcessor;

/// Scripted stand-in for a processing node. Every call is recorded by name.
#[derive(Default)]
pub struct FakeNode {
  tasks: Mutex<HashMap<String, RemoteTaskInfo>>,
  console: Mutex<Vec<String>>,
  calls: Mutex<Vec<String>>,
  archive: Mutex<Vec<u8>>,
  next_id: Mutex<u32>,
  pub unreachable: AtomicBool,
  pub cancel_times_out: AtomicBool,
  pub panic_on: Mutex<Option<String>>,
  /// When set, archive downloads drop the connection after this many chunks.
  pub download_fails_after: Mutex<Option<usize>>,
}

impl FakeNode {
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn count(&self, call: &str) -> usize {
    self.calls().iter().filter(|c| c.as_str() == call).count()
  }

  pub fn set_remote(&self, remote_id: &str, status: TaskStatus, progress: f64) {
    self.tasks.lock().unwrap().insert(remote_id.to_string(), RemoteTaskInfo {
      uuid: remote_id.to_string(),
      status,
      processing_time: 1234,
      progress,
      error_message: None,
      output: Vec::new(),
    });
  }

  pub fn remote(&self, remote_id: &str) -> Option<RemoteTaskInfo> {
    self.tasks.lock().unwrap().get(remote_id).cloned()
  }

  pub fn push_console(&self, line: &str) {
    self.console.lock().unwrap().push(line.to_string());
  }

  pub fn set_archive(&self, bytes: Vec<u8>) {
    *self.archive.lock().unwrap() = bytes;
  }

  fn record(&self, call: &str) -> Result<()> {
    self.calls.lock().unwrap().push(call.to_string());
    if self.unreachable.load(Ordering::SeqCst) {
      return Err(NodeError::Connection("connection refused".into()));
    }
    Ok(())
  }

  fn maybe_panic(&self, remote_id: &str) {
    if self.panic_on.lock().unwrap().as_deref() == Some(remote_id) {
      panic!("node exploded while handling {}", remote_id);
    }
  }
}

#[async_trait]
impl NodeApi for FakeNode {
  async fn get_info(&self) -> Result<NodeInfo> {
    self.record("info")?;
    Ok(NodeInfo { version: "2.0.0".into(), queue_count: self.tasks.lock().unwrap().len() as i32, max_images: None })
  }

  async fn get_options(&self) -> Result<serde_json::Value> {
    self.record("options")?;
    Ok(serde_json::json!([{ "name": "dsm", "type": "bool", "value": "false" }]))
  }

  async fn submit_task(&self, images: &[PathBuf], _name: &str, _options: &serde_json::Value) -> Result<String> {
    self.record("submit")?;
    if images.len() < 2 {
      return Err(NodeError::Server("Need at least 2 images".into()));
    }
    let id = {
      let mut next = self.next_id.lock().unwrap();
      *next += 1;
      format!("remote-{}", next)
    };
    self.set_remote(&id, TaskStatus::Queued, 0.0);
    Ok(id)
  }

  async fn get_task_info(&self, remote_id: &str, from_line: usize) -> Result<RemoteTaskInfo> {
    self.record("task_info")?;
    self.maybe_panic(remote_id);
    let mut info = self.remote(remote_id).ok_or_else(|| NodeError::Server(format!("Task {} not found", remote_id)))?;
    info.output = self.console.lock().unwrap().iter().skip(from_line).cloned().collect();
    Ok(info)
  }

  async fn get_console_output(&self, _remote_id: &str, from_line: usize) -> Result<String> {
    self.record("output")?;
    let lines = self.console.lock().unwrap();
    Ok(lines.iter().skip(from_line).cloned().collect::<Vec<_>>().join("\n"))
  }

  async fn cancel_task(&self, remote_id: &str) -> Result<()> {
    self.record("cancel")?;
    if self.cancel_times_out.load(Ordering::SeqCst) {
      return Err(NodeError::Connection("operation timed out".into()));
    }
    if let Some(info) = self.tasks.lock().unwrap().get_mut(remote_id) {
      info.status = TaskStatus::Canceled;
    }
    Ok(())
  }

  async fn restart_task(&self, remote_id: &str, _options: &serde_json::Value) -> Result<()> {
    self.record("restart")?;
    match self.tasks.lock().unwrap().get_mut(remote_id) {
      Some(info) => {
        info.status = TaskStatus::Queued;
        Ok(())
      }
      None => Err(NodeError::Server("Task not found".into())),
    }
  }

  async fn remove_task(&self, remote_id: &str) -> Result<()> {
    self.record("remove")?;
    self.tasks.lock().unwrap().remove(remote_id);
    Ok(())
  }

  async fn download_asset(&self, _remote_id: &str, _asset: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
    self.record("download")?;
    let bytes = self.archive.lock().unwrap().clone();
    let mut chunks: Vec<Result<Bytes>> = bytes
      .chunks(512)
      .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
      .collect();
    if let Some(after) = *self.download_fails_after.lock().unwrap() {
      chunks.truncate(after);
      chunks.push(Err(NodeError::Connection("connection reset by peer".into())));
    }
    Ok(stream::iter(chunks).boxed())
  }
}

/// Every registry entry resolves to the same fake.
pub struct FakeConnector(pub Arc<FakeNode>);

impl NodeConnector for FakeConnector {
  fn connect(&self, _node: &ProcessingNode) -> Arc<dyn NodeApi> {
    self.0.clone()
  }
}

pub struct Harness {
  pub store: Arc<MemoryStore>,
  pub node: Arc<FakeNode>,
  pub registry: Arc<NodeRegistry>,
  pub processor: Arc<TaskProcessor>,
  pub paths: TaskPaths,
  pub project: Project,
  _media: TempDir,
}

impl Harness {
  pub async fn new() -> Self {
    let store = Arc::new(MemoryStore::new());
    let node = Arc::new(FakeNode::default());
    let registry = Arc::new(NodeRegistry::new(
      store.clone(),
      Arc::new(FakeConnector(node.clone())),
      chrono::Duration::minutes(5),
    ));
    let media = tempfile::tempdir().unwrap();
    let paths = TaskPaths::new(media.path());
    let http = http_client(Duration::from_secs(1)).unwrap();
    let processor = Arc::new(TaskProcessor::new(store.clone(), registry.clone(), paths.clone(), http));
    let project = store.create_project("alice", "survey").await.unwrap();
    Self { store, node, registry, processor, paths, project, _media: media }
  }

  /// Registers a node that just sent a heartbeat.
  pub async fn online_node(&self, queue_count: i32) -> ProcessingNode {
    let node = self.store.add_node(NewNode {
      hostname: "localhost".into(),
      port: 3000,
      token: String::new(),
      label: String::new(),
    }).await.unwrap();
    self.store.set_heartbeat(node.id, Some(Utc::now())).await;
    self.store.set_queue_count(node.id, queue_count).await;
    self.store.get_node(node.id).await.unwrap().unwrap()
  }

  pub fn task(&self, name: &str) -> Task {
    Task::new(self.project.id, name)
  }

  pub fn write_images(&self, task: &Task, count: usize) {
    let dir = self.paths.task_dir(task.project_id, task.id);
    std::fs::create_dir_all(&dir).unwrap();
    for i in 0..count {
      std::fs::write(dir.join(format!("IMG_{:04}.JPG", i)), b"jpeg").unwrap();
    }
  }
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
  let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
  for (name, data) in entries {
    writer.start_file(*name, SimpleFileOptions::default()).unwrap();
    writer.write_all(data).unwrap();
  }
  writer.finish().unwrap().into_inner()
}
