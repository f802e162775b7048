//! Postgres connection pool and schema bootstrap.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

const SCHEMA: &str = include_str!("../migrations/0001_generation_core.sql");

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    info!(max_connections, "connected to postgres");
    Ok(pool)
}

/// Apply the schema. Every statement in it is idempotent.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("schema applied");
    Ok(())
}
