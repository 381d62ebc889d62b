use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use futures::StreamExt;
use lapin::{options::{BasicAckOptions, BasicConsumeOptions}, types::FieldTable};
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use photoq::assets::TaskPaths;
use photoq::cleanup::{cleanup_projects, cleanup_tmp_directory, TMP_MAX_AGE};
use photoq::config::Config;
use photoq::database::setup_database;
use photoq::messaging::{create_rabbit_channel, ProcessRequest, TASK_QUEUE};
use photoq::node_client::{http_client, HttpConnector};
use photoq::node_registry::NodeRegistry;
use photoq::quota::QuotaGuard;
use photoq::store::{PgStore, ProjectStore};
use photoq::worker_processing::TaskProcessor;
use photoq::worker_scheduler::{ClaimLock, Scheduler};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  info!("Starting worker {}", config.worker_id);

  let db_pool = setup_database(&config.database_url).await?;
  let store = Arc::new(PgStore::new(db_pool));

  let connector = Arc::new(HttpConnector::new(config.node_timeout)?);
  let registry = Arc::new(NodeRegistry::new(
    store.clone(),
    connector,
    chrono::Duration::from_std(config.scheduler.offline_window)?,
  ));
  let paths = TaskPaths::new(config.media_root.clone());
  let processor = Arc::new(TaskProcessor::new(
    store.clone(),
    registry.clone(),
    paths.clone(),
    http_client(config.node_timeout)?,
  ));

  let claim_lock: ClaimLock = Arc::new(Mutex::new(()));
  let scheduler = Arc::new(Scheduler::new(store.clone(), processor, claim_lock, config.scheduler.clone()));
  tokio::spawn(scheduler.clone().run());

  let refresh_every = config.node_refresh_interval;
  let refresh_registry = registry.clone();
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(refresh_every);
    loop {
      interval.tick().await;
      match refresh_registry.refresh_all().await {
        Ok(online) => debug!("{} processing node(s) online", online),
        Err(e) => error!("Node refresh failed: {:#}", e),
      }
    }
  });

  let quota = Arc::new(QuotaGuard::new(store.clone(), store.clone(), config.quota.clone()));
  tokio::spawn(quota.run());

  let projects: Arc<dyn ProjectStore> = store.clone();
  let tmp_dir = paths.tmp_dir();
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
      interval.tick().await;
      if let Err(e) = cleanup_projects(&projects).await {
        error!("Project cleanup failed: {:#}", e);
      }
      let dir = tmp_dir.clone();
      match tokio::task::spawn_blocking(move || cleanup_tmp_directory(&dir, TMP_MAX_AGE)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("Tmp cleanup failed: {:#}", e),
        Err(e) => error!("Tmp cleanup panicked: {:?}", e),
      }
    }
  });

  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url).await?;
  rabbit_channel
    .queue_declare(TASK_QUEUE, Default::default(), FieldTable::default())
    .await?;
  let mut consumer = rabbit_channel
    .basic_consume(TASK_QUEUE, &config.worker_id, BasicConsumeOptions::default(), FieldTable::default())
    .await?;

  while let Some(delivery) = consumer.next().await {
    let delivery = match delivery {
      Ok(delivery) => delivery,
      Err(e) => {
        error!("Consumer error: {:?}", e);
        continue;
      }
    };

    let request = match serde_json::from_slice::<ProcessRequest>(&delivery.data) {
      Ok(request) => request,
      Err(e) => {
        error!("Failed to parse process request: {:?}", e);
        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
          error!("Failed to ack process request: {:?}", e);
        }
        continue;
      }
    };

    let scheduler = scheduler.clone();
    tokio::spawn(async move {
      if let Err(e) = scheduler.process_now(request.task_id).await {
        error!("Processing {} on request failed: {:#}", request.task_id, e);
      }
      if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!("Failed to ack process request: {:?}", e);
      }
    });
  }

  Ok(())
}
