use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use stagework_core::config::{mask_credentials, DatabaseConfig};

use crate::error::StoreError;

/// Connect to Postgres and apply pending migrations. Caller retries with
/// backoff at startup (spec §5: "DB connect at startup: exponential backoff
/// capped at 2 min").
pub async fn init_pg_pool(config: &DatabaseConfig) -> Result<PgPool, StoreError> {
    info!("connecting to postgres: {}", mask_credentials(&config.database_url));

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("database migrations applied");

    Ok(pool)
}
