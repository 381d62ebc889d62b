use std::sync::Arc;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::models::{NodeSnapshot, ProcessingNode};
use crate::node_client::NodeConnector;
use crate::store::NodeStore;

/// Lowest `queue_count` among online nodes; ties go to the earliest registered node.
pub fn find_best_available_node(
  nodes: &[ProcessingNode],
  now: DateTime<Utc>,
  offline_window: Duration,
) -> Option<&ProcessingNode> {
  nodes
    .iter()
    .filter(|node| node.is_online(now, offline_window))
    .min_by_key(|node| node.queue_count)
}

pub struct NodeRegistry {
  store: Arc<dyn NodeStore>,
  connector: Arc<dyn NodeConnector>,
  offline_window: Duration,
}

impl NodeRegistry {
  pub fn new(store: Arc<dyn NodeStore>, connector: Arc<dyn NodeConnector>, offline_window: Duration) -> Self {
    Self { store, connector, offline_window }
  }

  pub fn connector(&self) -> &Arc<dyn NodeConnector> {
    &self.connector
  }

  pub async fn get(&self, id: i64) -> Result<Option<ProcessingNode>> {
    self.store.get_node(id).await
  }

  pub fn is_online(&self, node: &ProcessingNode) -> bool {
    node.is_online(Utc::now(), self.offline_window)
  }

  pub async fn find_best_available_node(&self) -> Result<Option<ProcessingNode>> {
    let nodes = self.store.list_nodes().await?;
    Ok(find_best_available_node(&nodes, Utc::now(), self.offline_window).cloned())
  }

  /// Optimistic bump so concurrent assignments spread out before the next heartbeat
  /// overwrites the count with the node's own figure.
  pub async fn note_assignment(&self, node: &ProcessingNode) -> Result<()> {
    self.store.increment_queue_count(node.id).await
  }

  /// Probes one node. A node that fails to answer keeps its old heartbeat and
  /// eventually falls out of the online window.
  pub async fn update_node_info(&self, node: &ProcessingNode) -> Result<bool> {
    let api = self.connector.connect(node);
    let info = match api.get_info().await {
      Ok(info) => info,
      Err(e) => {
        warn!("Node {} did not respond to info query: {}", node, e);
        return Ok(false);
      }
    };
    let available_options = match api.get_options().await {
      Ok(options) => options,
      Err(e) => {
        warn!("Node {} did not respond to options query: {}", node, e);
        return Ok(false);
      }
    };

    self.store.record_snapshot(node.id, NodeSnapshot {
      api_version: info.version,
      queue_count: info.queue_count,
      max_images: info.max_images,
      available_options,
      heartbeat: Utc::now(),
    }).await?;
    Ok(true)
  }

  pub async fn refresh_all(&self) -> Result<usize> {
    let nodes = self.store.list_nodes().await?;
    let mut online = 0;
    for node in &nodes {
      if self.update_node_info(node).await? {
        online += 1;
      }
    }
    info!("Refreshed {} node(s), {} online", nodes.len(), online);
    Ok(online)
  }
}
