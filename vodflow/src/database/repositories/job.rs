//! Job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::{Job, JobPriority, JobStatus, VideoQuality};
use crate::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Job repository trait.
///
/// The orchestration core only ever talks to this interface; the SQLite
/// adapter below is one host-provided implementation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<Job>;
    async fn list_pending_jobs(&self, limit: i64) -> Result<Vec<Job>>;
    async fn create_job(&self, job: &Job) -> Result<()>;
    /// Update the status, stamping `started_at` on the first transition out
    /// of `Pending` and `completed_at` on terminal transitions.
    async fn update_job_status(&self, id: &str, status: JobStatus) -> Result<()>;
    async fn set_task_id(&self, id: &str, task_id: &str) -> Result<()>;
    async fn update_progress(&self, id: &str, stage: &str, percentage: i32) -> Result<()>;
    async fn append_error(&self, id: &str, error: &str) -> Result<()>;
    async fn increment_retry_count(&self, id: &str) -> Result<()>;
    async fn delete_job(&self, id: &str) -> Result<()>;
}

/// Row shape as stored in SQLite; JSON blobs for the list fields.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    status: String,
    priority: i64,
    season_name: String,
    video_urls: String,
    video_quality: String,
    compression_level: i64,
    use_gpu: bool,
    use_hardware_accel: bool,
    current_stage: Option<String>,
    progress_percentage: i64,
    errors: String,
    retry_count: i64,
    task_id: Option<String>,
    notification_webhook: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid {field} timestamp `{raw}`: {e}")))
}

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| Error::Other(format!("unknown job status `{}`", row.status)))?;
        let priority = JobPriority::from_weight(row.priority as i32)
            .ok_or_else(|| Error::Other(format!("unknown job priority `{}`", row.priority)))?;
        let video_quality = VideoQuality::parse(&row.video_quality)
            .ok_or_else(|| Error::Other(format!("unknown video quality `{}`", row.video_quality)))?;

        Ok(Job {
            id: row.id,
            status,
            priority,
            season_name: row.season_name,
            video_urls: serde_json::from_str(&row.video_urls)?,
            video_quality,
            compression_level: row.compression_level as i32,
            use_gpu: row.use_gpu,
            use_hardware_accel: row.use_hardware_accel,
            current_stage: row.current_stage,
            progress_percentage: row.progress_percentage as i32,
            errors: serde_json::from_str(&row.errors)?,
            retry_count: row.retry_count as i32,
            task_id: row.task_id,
            notification_webhook: row.notification_webhook,
            created_at: parse_timestamp(&row.created_at, "created_at")?,
            started_at: row
                .started_at
                .as_deref()
                .map(|s| parse_timestamp(s, "started_at"))
                .transpose()?,
            completed_at: row
                .completed_at
                .as_deref()
                .map(|s| parse_timestamp(s, "completed_at"))
                .transpose()?,
        })
    }
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: &str) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?;
        row.try_into()
    }

    async fn list_pending_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status = 'pending' ORDER BY created_at LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, status, priority, season_name, video_urls, video_quality,
                compression_level, use_gpu, use_hardware_accel, current_stage,
                progress_percentage, errors, retry_count, task_id,
                notification_webhook, created_at, started_at, completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(job.status.as_str())
        .bind(job.priority.weight())
        .bind(&job.season_name)
        .bind(serde_json::to_string(&job.video_urls)?)
        .bind(job.video_quality.as_str())
        .bind(job.compression_level)
        .bind(job.use_gpu)
        .bind(job.use_hardware_accel)
        .bind(&job.current_stage)
        .bind(job.progress_percentage)
        .bind(serde_json::to_string(&job.errors)?)
        .bind(job.retry_count)
        .bind(&job.task_id)
        .bind(&job.notification_webhook)
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job_status(&self, id: &str, status: JobStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let query = if status.is_terminal() {
            sqlx::query(
                "UPDATE jobs SET status = ?, completed_at = COALESCE(completed_at, ?) WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(&now)
            .bind(id)
        } else if status == JobStatus::Pending {
            // Retry path: back to the queue without touching timestamps.
            sqlx::query("UPDATE jobs SET status = ?, completed_at = NULL WHERE id = ?")
                .bind(status.as_str())
                .bind(id)
        } else {
            sqlx::query(
                "UPDATE jobs SET status = ?, started_at = COALESCE(started_at, ?) WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(&now)
            .bind(id)
        };
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn set_task_id(&self, id: &str, task_id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET task_id = ? WHERE id = ?")
            .bind(task_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_progress(&self, id: &str, stage: &str, percentage: i32) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET current_stage = ?, progress_percentage = ? WHERE id = ?",
        )
        .bind(stage)
        .bind(percentage.clamp(0, 100))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_error(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET errors = json_insert(errors, '$[#]', ?) WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_retry_count(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET retry_count = retry_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
