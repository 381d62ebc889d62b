use std::sync::Arc;
use anyhow::Result;
use lapin::types::FieldTable;
use tracing::info;
use photoq::config::Config;
use photoq::database::setup_database;
use photoq::messaging::{create_rabbit_channel, TASK_QUEUE};
use photoq::quota::QuotaGuard;
use photoq::routes::{routes, AppState};
use photoq::store::PgStore;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url).await?;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url).await?;
  rabbit_channel
    .queue_declare(TASK_QUEUE, Default::default(), FieldTable::default())
    .await?;

  let store = Arc::new(PgStore::new(db_pool));
  let quota = Arc::new(QuotaGuard::new(store.clone(), store.clone(), config.quota.clone()));
  let state = AppState {
    tasks: store.clone(),
    nodes: store.clone(),
    projects: store,
    channel: Some(rabbit_channel),
    quota: Some(quota),
  };

  info!("API listening on port {}", config.server_port);
  warp::serve(routes(state))
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
