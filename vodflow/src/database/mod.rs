//! Database access: pool bootstrap, models, repositories.

pub mod models;
pub mod repositories;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use crate::Result;

/// Connect to the database and make sure the schema exists.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL,
            season_name TEXT NOT NULL,
            video_urls TEXT NOT NULL,
            video_quality TEXT NOT NULL,
            compression_level INTEGER NOT NULL,
            use_gpu INTEGER NOT NULL,
            use_hardware_accel INTEGER NOT NULL,
            current_stage TEXT,
            progress_percentage INTEGER NOT NULL DEFAULT 0,
            errors TEXT NOT NULL DEFAULT '[]',
            retry_count INTEGER NOT NULL DEFAULT 0,
            task_id TEXT,
            notification_webhook TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status_priority ON jobs (status, priority)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created_status ON jobs (created_at, status)")
        .execute(&pool)
        .await?;

    info!(database_url, "Database ready");
    Ok(pool)
}
