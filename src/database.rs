use std::time::Duration;
use anyhow::{Context, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::info;

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str) -> Result<Pool<Postgres>> {
  let pool = PgPoolOptions::new()
    .max_connections(20)
    .acquire_timeout(Duration::from_secs(5))
    .connect(database_url)
    .await
    .context("Failed to connect to database.")?;

  MIGRATOR.run(&pool)
    .await
    .context("Failed to run database migrations.")?;
  info!("Database migrations complete");
  Ok(pool)
}
