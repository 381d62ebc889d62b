use std::convert::Infallible;
use std::sync::Arc;
use lapin::Channel;
use serde_json::json;
use tracing::error;
use warp::Filter;
use warp::http::StatusCode;

use crate::quota::QuotaGuard;
use crate::store::{NodeStore, ProjectStore, TaskStore};

pub mod nodes;
pub mod sse;
pub mod tasks;

/// Collaborators every handler may need.
#[derive(Clone)]
pub struct AppState {
  pub tasks: Arc<dyn TaskStore>,
  pub nodes: Arc<dyn NodeStore>,
  pub projects: Arc<dyn ProjectStore>,
  /// When present, state changes are followed by a "process now" message to the workers.
  pub channel: Option<Channel>,
  /// When present, users over their storage quota cannot create tasks.
  pub quota: Option<Arc<QuotaGuard>>,
}

#[derive(Debug)]
pub struct ApiError {
  pub status: StatusCode,
  pub message: String,
}

impl ApiError {
  pub fn bad_request(message: impl Into<String>) -> Self {
    Self { status: StatusCode::BAD_REQUEST, message: message.into() }
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self { status: StatusCode::NOT_FOUND, message: message.into() }
  }

  pub fn internal(e: anyhow::Error) -> Self {
    error!("Request failed: {:#}", e);
    Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: "Internal error".into() }
  }
}

impl warp::reject::Reject for ApiError {}

pub fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  tasks::task_routes(state.clone())
    .or(nodes::node_routes(state.clone()))
    .or(sse::sse_route(state))
    .recover(handle_rejection)
}

async fn handle_rejection(rejection: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
  let (status, message) = if let Some(e) = rejection.find::<ApiError>() {
    (e.status, e.message.clone())
  } else if rejection.is_not_found() {
    (StatusCode::NOT_FOUND, "Not found".to_string())
  } else if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
  } else {
    (StatusCode::BAD_REQUEST, format!("{:?}", rejection))
  };
  Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status))
}
