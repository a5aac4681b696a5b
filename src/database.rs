use anyhow::{Context, Result};
use sqlx::migrate::Migrator;
use sqlx::{Pool, Postgres};
use tracing::info;

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str) -> Result<Pool<Postgres>> {
  let pool = Pool::<Postgres>::connect(database_url)
    .await
    .context("failed to connect to database")?;

  MIGRATOR.run(&pool).await.context("failed to run database migrations")?;
  info!("Database migrations complete");
  Ok(pool)
}
