//! Stage-task contract.
//!
//! Each stage task owns its repository updates: it writes status, progress,
//! and errors for the job it runs on behalf of, on completion or failure.
//! The Job Manager never executes stage logic directly.

pub mod download;
pub mod notify;

pub use download::DownloadStageHandler;
pub use notify::NotifyStageHandler;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fetch::VideoMetadata;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::database::models::JobStatus;
use crate::database::repositories::JobRepository;
use crate::jobs::plan::JobStage;
use crate::substrate::StageTask;

/// Context threaded through a chain: each stage's output becomes input for
/// the next (downloaded files feed PROCESS, processed files feed MERGE).
#[derive(Clone)]
pub struct StageContext {
    /// Chain-wide cancellation; handlers propagate it into their I/O.
    pub token: CancellationToken,
    pub downloaded: Vec<VideoMetadata>,
    pub processed_paths: Vec<PathBuf>,
    pub merged_path: Option<PathBuf>,
}

impl StageContext {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            downloaded: Vec::new(),
            processed_paths: Vec::new(),
            merged_path: None,
        }
    }
}

/// A worker-side implementation of one pipeline stage.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// The stage this handler serves.
    fn stage(&self) -> JobStage;

    /// Execute the stage, updating the job repository as the stage-task
    /// contract requires, and return the context for the next stage.
    async fn run(&self, task: &StageTask, ctx: StageContext) -> Result<StageContext>;
}

/// Record successful completion of a stage: progress percentage, and the
/// terminal COMPLETED status when this was the chain's final stage.
pub(crate) async fn record_stage_completed(
    repo: &Arc<dyn JobRepository>,
    task: &StageTask,
) -> Result<()> {
    repo.update_progress(&task.job_id, task.stage.as_str(), task.completion_percentage())
        .await?;
    if task.is_final() {
        repo.update_job_status(&task.job_id, JobStatus::Completed)
            .await?;
    }
    Ok(())
}

/// Record a stage failure: the error lands on the job's error list and the
/// job goes to FAILED.
pub(crate) async fn record_stage_failed(
    repo: &Arc<dyn JobRepository>,
    task: &StageTask,
    error: &str,
) {
    if let Err(repo_err) = repo.append_error(&task.job_id, error).await {
        tracing::error!(job_id = %task.job_id, error = %repo_err, "Failed to record stage error");
    }
    if let Err(repo_err) = repo
        .update_job_status(&task.job_id, JobStatus::Failed)
        .await
    {
        tracing::error!(job_id = %task.job_id, error = %repo_err, "Failed to mark job failed");
    }
}
