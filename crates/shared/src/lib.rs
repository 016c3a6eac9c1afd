//! Xainik shared infrastructure
//!
//! Database pool construction and embedded migrations used by both the API
//! server and the background worker.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Errors raised while preparing the database
#[derive(Debug, thiserror::Error)]
pub enum SharedError {
    #[error("Database connection failed: {0}")]
    Connect(#[from] sqlx::Error),
    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type SharedResult<T> = Result<T, SharedError>;

/// Create the request-serving connection pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> SharedResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!(max_connections, "Database pool created");
    Ok(pool)
}

/// Apply the embedded migrations in `migrations/`
pub async fn run_migrations(pool: &PgPool) -> SharedResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

/// Cheap connectivity probe used by health checks
pub async fn ping(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
