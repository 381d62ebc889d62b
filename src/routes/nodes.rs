use tracing::info;
use warp::Filter;

use crate::models::NewNode;
use super::{with_state, ApiError, AppState};

pub fn node_routes(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let list = warp::path!("nodes")
    .and(warp::get())
    .and(with_state(state.clone()))
    .and_then(handle_list_nodes);

  let add = warp::path!("nodes")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_add_node);

  list.or(add)
}

async fn handle_list_nodes(state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  let nodes = state.nodes
    .list_nodes()
    .await
    .map_err(|e| warp::reject::custom(ApiError::internal(e)))?;
  Ok(warp::reply::json(&nodes))
}

async fn handle_add_node(new_node: NewNode, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  if new_node.hostname.trim().is_empty() {
    return Err(warp::reject::custom(ApiError::bad_request("Missing hostname")));
  }
  if !(1..=65535).contains(&new_node.port) {
    return Err(warp::reject::custom(ApiError::bad_request("Invalid port")));
  }
  let node = state.nodes
    .add_node(new_node)
    .await
    .map_err(|e| warp::reject::custom(ApiError::internal(e)))?;
  info!("Registered processing node {}", node);
  Ok(warp::reply::json(&node))
}
