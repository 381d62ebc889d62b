use std::time::Duration;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::error;
use uuid::Uuid;
use warp::Filter;

use super::{with_state, AppState};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
pub struct SseQuery {
  pub task_id: Uuid,
}

pub fn sse_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("sse")
    .and(warp::get())
    .and(warp::query::<SseQuery>())
    .and(with_state(state))
    .and_then(handle_sse)
}

/// Streams the task's status and progress until it disappears or reaches a terminal status.
async fn handle_sse(query: SseQuery, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  let task_id = query.task_id;
  let interval = IntervalStream::new(tokio::time::interval(POLL_INTERVAL));
  let stream = interval
    .then(move |_| {
      let tasks = state.tasks.clone();
      async move {
        match tasks.get_task(task_id).await {
          Ok(task) => task,
          Err(e) => {
            error!("Error fetching task status: {:#}", e);
            None
          }
        }
      }
    })
    .take_while(|task| task.is_some())
    .filter_map(|task| task)
    .map(move |task| {
      let done = task.status.is_some_and(|s| s.is_terminal()) && task.pending_action.is_none();
      let event = warp::sse::Event::default()
        .event(if done { "done" } else { "status" })
        .data(json!({
          "task_id": task.id,
          "status": task.status.map(|s| s.code()),
          "pending_action": task.pending_action.map(|a| a.code()),
          "upload_progress": task.upload_progress,
          "running_progress": task.running_progress,
          "processing_time": task.processing_time,
          "last_error": task.last_error,
        }).to_string());
      (done, event)
    })
    .map_while({
      let mut finished = false;
      move |(done, event)| {
        if finished {
          return None;
        }
        finished = done;
        Some(Ok::<_, std::convert::Infallible>(event))
      }
    });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
