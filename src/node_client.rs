//! Protocol adapter for a single processing node.
//!
//! [`NodeApi`] is the operation set the state machine relies on. [`NodeClient`] implements it
//! over the NodeODM REST API. Errors are classified by [`NodeError`] so callers can tell a
//! flaky network (retry on the next tick) from a node that refused the request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::{Client, Response, StatusCode};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::models::{ProcessingNode, TaskStatus};

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
  /// Connection refused, timeout, interrupted body. Safe to retry later.
  #[error("Connection error: {0}")]
  Connection(String),

  /// The node understood the request and refused it.
  #[error("{0}")]
  Server(String),

  /// The node answered with something we could not make sense of.
  #[error("Invalid response: {0}")]
  Response(String),
}

impl NodeError {
  pub fn is_transient(&self) -> bool {
    matches!(self, NodeError::Connection(_))
  }
}

impl From<reqwest::Error> for NodeError {
  fn from(e: reqwest::Error) -> Self {
    // Payloads are parsed with serde_json, so reqwest only ever reports trouble on the wire.
    // A body cut short mid-stream surfaces as a decode error.
    if e.is_builder() || e.is_redirect() {
      NodeError::Response(e.to_string())
    } else {
      NodeError::Connection(e.to_string())
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
  pub version: String,
  pub queue_count: i32,
  pub max_images: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTaskInfo {
  pub uuid: String,
  pub status: TaskStatus,
  pub processing_time: i64,
  pub progress: f64,
  pub error_message: Option<String>,
  /// Console lines starting at the offset passed to [`NodeApi::get_task_info`].
  pub output: Vec<String>,
}

#[async_trait]
pub trait NodeApi: Send + Sync {
  async fn get_info(&self) -> Result<NodeInfo>;

  async fn get_options(&self) -> Result<serde_json::Value>;

  /// Uploads images and starts processing, returning the node-side task id.
  async fn submit_task(&self, images: &[PathBuf], name: &str, options: &serde_json::Value) -> Result<String>;

  /// Status snapshot, including console lines from `from_line` onwards.
  async fn get_task_info(&self, remote_id: &str, from_line: usize) -> Result<RemoteTaskInfo>;

  /// Console lines starting at `from_line`, joined with newlines.
  async fn get_console_output(&self, remote_id: &str, from_line: usize) -> Result<String>;

  async fn cancel_task(&self, remote_id: &str) -> Result<()>;

  async fn restart_task(&self, remote_id: &str, options: &serde_json::Value) -> Result<()>;

  async fn remove_task(&self, remote_id: &str) -> Result<()>;

  async fn download_asset(&self, remote_id: &str, asset: &str) -> Result<BoxStream<'static, Result<Bytes>>>;
}

/// Hands out a [`NodeApi`] for a registry entry.
pub trait NodeConnector: Send + Sync {
  fn connect(&self, node: &ProcessingNode) -> Arc<dyn NodeApi>;
}

/// Slowest upload we are willing to wait for, in bytes per second.
const MIN_UPLOAD_RATE: u64 = 64 * 1024;

/// Client for talking to nodes and import sources. `timeout` bounds connecting and each
/// individual read, never a whole transfer, so large archives stream for as long as they keep
/// moving.
pub fn http_client(timeout: Duration) -> reqwest::Result<Client> {
  Client::builder()
    .connect_timeout(timeout)
    .read_timeout(timeout)
    .build()
}

/// Builds [`NodeClient`]s that share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpConnector {
  client: Client,
  upload: Client,
  timeout: Duration,
}

impl HttpConnector {
  pub fn new(timeout: Duration) -> anyhow::Result<Self> {
    Ok(Self {
      client: http_client(timeout)?,
      // A read timeout would also count the time spent sending, so uploads get a deadline
      // sized to the payload instead.
      upload: Client::builder().connect_timeout(timeout).build()?,
      timeout,
    })
  }

  pub fn node_client(&self, base_url: impl Into<String>, token: impl Into<String>) -> NodeClient {
    NodeClient {
      base_url: trim_base_url(base_url.into()),
      token: token.into(),
      client: self.client.clone(),
      upload: self.upload.clone(),
      timeout: self.timeout,
    }
  }
}

impl NodeConnector for HttpConnector {
  fn connect(&self, node: &ProcessingNode) -> Arc<dyn NodeApi> {
    Arc::new(self.node_client(node.base_url(), node.token.clone()))
  }
}

#[derive(Debug, Clone)]
pub struct NodeClient {
  base_url: String,
  token: String,
  client: Client,
  upload: Client,
  timeout: Duration,
}

fn trim_base_url(base_url: String) -> String {
  base_url.trim_end_matches('/').to_string()
}

/// Time allowed for sending `bytes` and getting the node's answer.
fn upload_deadline(timeout: Duration, bytes: u64) -> Duration {
  timeout + Duration::from_secs(bytes / MIN_UPLOAD_RATE)
}

#[derive(Deserialize)]
struct InfoResponse {
  version: String,
  #[serde(rename = "taskQueueCount", default)]
  task_queue_count: i32,
  #[serde(rename = "maxImages")]
  max_images: Option<i32>,
}

#[derive(Deserialize)]
struct NewTaskResponse {
  uuid: String,
}

#[derive(Deserialize)]
struct StatusResponse {
  code: i32,
  #[serde(rename = "errorMessage")]
  error_message: Option<String>,
}

#[derive(Deserialize)]
struct TaskInfoResponse {
  uuid: String,
  #[serde(rename = "processingTime", default)]
  processing_time: i64,
  status: StatusResponse,
  #[serde(default)]
  progress: f64,
  #[serde(default)]
  output: Vec<String>,
}

#[derive(Deserialize)]
struct AckResponse {
  #[serde(default)]
  success: bool,
}

impl NodeClient {
  /// A client without any timeouts. Nodes in the registry go through [`HttpConnector`].
  pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
    Self {
      base_url: trim_base_url(base_url.into()),
      token: token.into(),
      client: Client::new(),
      upload: Client::new(),
      timeout: Duration::from_secs(30),
    }
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  fn url(&self, path: &str) -> String {
    let mut url = format!("{}{}", self.base_url, path);
    if !self.token.is_empty() {
      url.push(if path.contains('?') { '&' } else { '?' });
      url.push_str("token=");
      url.push_str(&self.token);
    }
    url
  }

  /// Rejects gateway errors as transient, then decodes either the expected payload or the
  /// node's `{"error": ...}` envelope.
  async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
    let status = response.status();
    if matches!(status, StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT) {
      return Err(NodeError::Connection(format!("node unavailable (status {})", status.as_u16())));
    }

    let body = response.bytes().await?;
    let value: serde_json::Value = serde_json::from_slice(&body)
      .map_err(|e| NodeError::Response(format!("status {}: {}", status.as_u16(), e)))?;
    if let Some(message) = value.get("error") {
      let message = message.as_str().map(str::to_string).unwrap_or_else(|| message.to_string());
      return Err(NodeError::Server(message));
    }
    if !status.is_success() {
      return Err(NodeError::Response(format!("unexpected status {}", status.as_u16())));
    }
    serde_json::from_value(value).map_err(|e| NodeError::Response(e.to_string()))
  }

  async fn handle_ack(&self, response: Response) -> Result<()> {
    let ack: AckResponse = self.handle_response(response).await?;
    if ack.success {
      Ok(())
    } else {
      Err(NodeError::Response("node did not acknowledge the request".into()))
    }
  }

  async fn post_uuid(&self, path: &str, remote_id: &str, options: Option<&serde_json::Value>) -> Result<()> {
    let mut form = vec![("uuid", remote_id.to_string())];
    if let Some(options) = options {
      form.push(("options", options.to_string()));
    }
    let response = self.client.post(self.url(path)).form(&form).send().await?;
    self.handle_ack(response).await
  }
}

#[async_trait]
impl NodeApi for NodeClient {
  async fn get_info(&self) -> Result<NodeInfo> {
    let response = self.client.get(self.url("/info")).send().await?;
    let info: InfoResponse = self.handle_response(response).await?;
    Ok(NodeInfo {
      version: info.version,
      queue_count: info.task_queue_count,
      max_images: info.max_images,
    })
  }

  async fn get_options(&self) -> Result<serde_json::Value> {
    let response = self.client.get(self.url("/options")).send().await?;
    self.handle_response(response).await
  }

  async fn submit_task(&self, images: &[PathBuf], name: &str, options: &serde_json::Value) -> Result<String> {
    if images.len() < 2 {
      return Err(NodeError::Server("Need at least 2 images".into()));
    }

    let mut form = Form::new()
      .text("name", name.to_string())
      .text("options", options.to_string());
    let mut total = 0u64;
    for path in images {
      let data = tokio::fs::read(path)
        .await
        .map_err(|e| NodeError::Server(format!("Cannot read {}: {}", path.display(), e)))?;
      let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".into());
      total += data.len() as u64;
      form = form.part("images", Part::bytes(data).file_name(file_name));
    }

    let response = self
      .upload
      .post(self.url("/task/new"))
      .multipart(form)
      .timeout(upload_deadline(self.timeout, total))
      .send()
      .await?;
    let created: NewTaskResponse = self.handle_response(response).await?;
    Ok(created.uuid)
  }

  async fn get_task_info(&self, remote_id: &str, from_line: usize) -> Result<RemoteTaskInfo> {
    let path = format!("/task/{}/info?with_output={}", remote_id, from_line);
    let response = self.client.get(self.url(&path)).send().await?;
    let info: TaskInfoResponse = self.handle_response(response).await?;
    let status = TaskStatus::from_code(info.status.code)
      .ok_or_else(|| NodeError::Response(format!("unknown status code {}", info.status.code)))?;
    Ok(RemoteTaskInfo {
      uuid: info.uuid,
      status,
      processing_time: info.processing_time,
      progress: info.progress,
      error_message: info.status.error_message.filter(|m| !m.is_empty()),
      output: info.output,
    })
  }

  async fn get_console_output(&self, remote_id: &str, from_line: usize) -> Result<String> {
    let path = format!("/task/{}/output?line={}", remote_id, from_line);
    let response = self.client.get(self.url(&path)).send().await?;
    let lines: Vec<String> = self.handle_response(response).await?;
    Ok(lines.join("\n"))
  }

  async fn cancel_task(&self, remote_id: &str) -> Result<()> {
    self.post_uuid("/task/cancel", remote_id, None).await
  }

  async fn restart_task(&self, remote_id: &str, options: &serde_json::Value) -> Result<()> {
    self.post_uuid("/task/restart", remote_id, Some(options)).await
  }

  async fn remove_task(&self, remote_id: &str) -> Result<()> {
    self.post_uuid("/task/remove", remote_id, None).await
  }

  async fn download_asset(&self, remote_id: &str, asset: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
    let path = format!("/task/{}/download/{}", remote_id, asset);
    let response = self.client.get(self.url(&path)).send().await?;

    let is_json = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .is_some_and(|v| v.starts_with("application/json"));
    if is_json || !response.status().is_success() {
      // Error envelopes come back as JSON; a successful download never does.
      return Err(self.handle_response::<serde_json::Value>(response).await.err().unwrap_or_else(|| {
        NodeError::Response(format!("{} is not a downloadable asset", asset))
      }));
    }

    Ok(response.bytes_stream().map_err(NodeError::from).boxed())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn url_appends_token() {
    let client = NodeClient::new("http://localhost:3000/", "secret");
    assert_eq!(client.base_url(), "http://localhost:3000");
    assert_eq!(client.url("/info"), "http://localhost:3000/info?token=secret");
    assert_eq!(
      client.url("/task/abc/output?line=3"),
      "http://localhost:3000/task/abc/output?line=3&token=secret"
    );
  }

  #[test]
  fn url_without_token_is_untouched() {
    let client = NodeClient::new("http://localhost:3000", "");
    assert_eq!(client.url("/options"), "http://localhost:3000/options");
  }

  #[test]
  fn only_connection_errors_are_transient() {
    assert!(NodeError::Connection("timeout".into()).is_transient());
    assert!(!NodeError::Server("Task not found".into()).is_transient());
    assert!(!NodeError::Response("garbage".into()).is_transient());
  }

  #[tokio::test]
  async fn submit_requires_two_images() {
    let client = NodeClient::new("http://127.0.0.1:9", "");
    let err = client
      .submit_task(&[PathBuf::from("a.jpg")], "t", &serde_json::json!([]))
      .await
      .unwrap_err();
    assert!(matches!(err, NodeError::Server(_)));
  }

  #[tokio::test]
  async fn unreachable_node_is_transient() {
    let client = HttpConnector::new(Duration::from_millis(500)).unwrap().node_client("http://127.0.0.1:9", "");
    let err = client.get_info().await.unwrap_err();
    assert!(err.is_transient());
  }

  /// Minimal NodeODM lookalike on an ephemeral port.
  fn spawn_node() -> String {
    use warp::Filter;

    let info = warp::path!("info").map(|| {
      warp::reply::json(&serde_json::json!({ "version": "2.2.0", "taskQueueCount": 3, "maxImages": null }))
    });
    let task_info = warp::path!("task" / String / "info")
      .and(warp::query::<std::collections::HashMap<String, String>>())
      .map(|uuid: String, query: std::collections::HashMap<String, String>| {
        if uuid != "abc" {
          return warp::reply::json(&serde_json::json!({ "error": "Task not found" }));
        }
        let from: usize = query.get("with_output").and_then(|v| v.parse().ok()).unwrap_or(0);
        let output: Vec<&str> = ["one", "two", "three"].into_iter().skip(from).collect();
        warp::reply::json(&serde_json::json!({
          "uuid": "abc",
          "processingTime": 5000,
          "status": { "code": 20 },
          "progress": 42.5,
          "output": output,
        }))
      });
    let cancel = warp::path!("task" / "cancel")
      .and(warp::post())
      .map(|| warp::reply::json(&serde_json::json!({ "success": true })));
    let gateway = warp::path!("task" / "remove")
      .map(|| warp::reply::with_status("bad gateway", warp::http::StatusCode::BAD_GATEWAY));
    // 20 chunks of 1 KiB, 100 ms apart. The "stalled" task goes quiet after the fourth chunk.
    let download = warp::path!("task" / String / "download" / String).map(|uuid: String, _asset: String| {
      let stall_after = if uuid == "stalled" { Some(4) } else { None };
      let chunks = futures::stream::iter(0..20usize).then(move |i| async move {
        let pause = if Some(i) == stall_after { 10_000 } else { 100 };
        tokio::time::sleep(Duration::from_millis(pause)).await;
        Ok::<_, std::convert::Infallible>(Bytes::from(vec![b'x'; 1024]))
      });
      warp::http::Response::new(warp::hyper::Body::wrap_stream(chunks))
    });

    let routes = info.or(task_info).or(cancel).or(gateway).or(download);
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    format!("http://{}", addr)
  }

  #[tokio::test]
  async fn speaks_node_protocol() {
    let client = NodeClient::new(spawn_node(), "");

    let info = client.get_info().await.unwrap();
    assert_eq!(info, NodeInfo { version: "2.2.0".into(), queue_count: 3, max_images: None });

    let task = client.get_task_info("abc", 1).await.unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.processing_time, 5000);
    assert_eq!(task.output, vec!["two".to_string(), "three".to_string()]);

    client.cancel_task("abc").await.unwrap();
  }

  #[tokio::test]
  async fn classifies_node_errors() {
    let client = NodeClient::new(spawn_node(), "");

    let err = client.get_task_info("missing", 0).await.unwrap_err();
    assert!(matches!(err, NodeError::Server(ref m) if m == "Task not found"));

    let err = client.remove_task("abc").await.unwrap_err();
    assert!(err.is_transient());
  }

  async fn drain(mut stream: BoxStream<'static, Result<Bytes>>) -> (usize, Option<NodeError>) {
    let mut received = 0;
    while let Some(chunk) = stream.next().await {
      match chunk {
        Ok(chunk) => received += chunk.len(),
        Err(e) => return (received, Some(e)),
      }
    }
    (received, None)
  }

  #[tokio::test]
  async fn slow_download_outlives_timeout() {
    let client = HttpConnector::new(Duration::from_secs(1)).unwrap().node_client(spawn_node(), "");
    let stream = client.download_asset("abc", "all.zip").await.unwrap();
    let (received, err) = drain(stream).await;
    assert!(err.is_none(), "{:?}", err);
    assert_eq!(received, 20 * 1024);
  }

  #[tokio::test]
  async fn stalled_download_is_transient() {
    let client = HttpConnector::new(Duration::from_millis(500)).unwrap().node_client(spawn_node(), "");
    let stream = client.download_asset("stalled", "all.zip").await.unwrap();
    let (received, err) = drain(stream).await;
    assert!(received < 20 * 1024);
    assert!(err.is_some_and(|e| e.is_transient()));
  }

  #[test]
  fn upload_deadline_grows_with_payload() {
    let timeout = Duration::from_secs(30);
    assert_eq!(upload_deadline(timeout, 1024), timeout);
    assert_eq!(upload_deadline(timeout, 100 * MIN_UPLOAD_RATE), Duration::from_secs(130));
  }
}
