//! Shared fakes for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use fetch::{
    DownloadError, DownloadProgress, DownloadRequest, DownloadStatus, DownloadStrategy,
    VideoMetadata,
};
use vodflow::database::models::{Job, JobStatus};
use vodflow::database::repositories::JobRepository;
use vodflow::scheduler::resource::{ResourceProbe, SystemResources};
use vodflow::substrate::{QueueStat, TaskChain, TaskState, TaskSubstrate};
use vodflow::{Error, Result};

/// In-memory job repository mirroring the SQLite adapter's semantics.
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: Mutex<HashMap<String, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, job: Job) {
        self.jobs.lock().insert(job.id.clone(), job);
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn get_job(&self, id: &str) -> Result<Job> {
        self.jobs
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn list_pending_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let mut pending: Vec<Job> = self
            .jobs
            .lock()
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|job| job.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        self.jobs.lock().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job_status(&self, id: &str, status: JobStatus) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(id).ok_or_else(|| Error::not_found("Job", id))?;
        job.status = status;
        if status.is_terminal() {
            job.completed_at.get_or_insert_with(Utc::now);
        } else if status == JobStatus::Pending {
            job.completed_at = None;
        } else {
            job.started_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn set_task_id(&self, id: &str, task_id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(id).ok_or_else(|| Error::not_found("Job", id))?;
        job.task_id = Some(task_id.to_string());
        Ok(())
    }

    async fn update_progress(&self, id: &str, stage: &str, percentage: i32) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(id).ok_or_else(|| Error::not_found("Job", id))?;
        job.current_stage = Some(stage.to_string());
        job.progress_percentage = percentage.clamp(0, 100);
        Ok(())
    }

    async fn append_error(&self, id: &str, error: &str) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(id).ok_or_else(|| Error::not_found("Job", id))?;
        job.errors.push(error.to_string());
        Ok(())
    }

    async fn increment_retry_count(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(id).ok_or_else(|| Error::not_found("Job", id))?;
        job.retry_count += 1;
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        self.jobs.lock().remove(id);
        Ok(())
    }
}

/// Probe returning a fixed snapshot.
pub struct FixedProbe {
    resources: SystemResources,
}

impl FixedProbe {
    pub fn new(resources: SystemResources) -> Self {
        Self { resources }
    }

    pub fn ample() -> Self {
        Self::new(SystemResources {
            cpu_percent: 10.0,
            memory_percent: 20.0,
            available_memory_mb: 65_536,
            disk_percent: 25.0,
            available_disk_mb: 1_000_000,
            gpu_available: false,
            gpu_memory_available_mb: 0,
        })
    }
}

impl ResourceProbe for FixedProbe {
    fn snapshot(&self) -> SystemResources {
        self.resources.clone()
    }
}

/// Strategy that "downloads" by writing a small file to the output path.
/// URLs containing "bad" fail.
pub struct FileWritingStrategy;

#[async_trait]
impl DownloadStrategy for FileWritingStrategy {
    fn name(&self) -> &'static str {
        "file-writing"
    }

    fn supports_url(&self, _url: &str) -> bool {
        true
    }

    async fn extract_metadata(&self, url: &str) -> std::result::Result<VideoMetadata, DownloadError> {
        if url.contains("probe-bad") {
            return Err(DownloadError::metadata(url, "fake probe failure"));
        }
        Ok(VideoMetadata::new(url, 0)
            .with_title("Test Episode")
            .with_format("mp4"))
    }

    async fn download(
        &self,
        request: DownloadRequest<'_>,
    ) -> std::result::Result<VideoMetadata, DownloadError> {
        if request.url.contains("bad") {
            return Err(DownloadError::validation("fake download failure"));
        }

        if let Some(parent) = request.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(request.output_path, b"fake video payload").await?;

        let mut progress = DownloadProgress::queued(request.url);
        progress.status = DownloadStatus::Downloading;
        progress.started_at = Some(Utc::now());
        request.emit(&progress);

        progress.status = DownloadStatus::Completed;
        progress.downloaded_bytes = 18;
        progress.total_bytes = Some(18);
        progress.completed_at = Some(Utc::now());
        request.emit(&progress);

        let mut metadata = VideoMetadata::new(request.url, request.episode_number)
            .with_title("Test Episode")
            .with_format("mp4");
        metadata.filesize = Some(18);
        metadata.downloaded_path = Some(request.output_path.to_path_buf());
        Ok(metadata)
    }
}

/// Substrate that accepts submissions but cannot report task state.
pub struct UnreachableStateSubstrate;

#[async_trait]
impl TaskSubstrate for UnreachableStateSubstrate {
    async fn submit_chain(&self, _chain: TaskChain) -> Result<String> {
        Ok(uuid_like())
    }

    async fn terminate(&self, _task_id: &str) -> Result<()> {
        Ok(())
    }

    async fn task_state(&self, _task_id: &str) -> Result<TaskState> {
        Err(Error::substrate("state backend unreachable"))
    }

    async fn queue_snapshot(&self) -> Result<Vec<QueueStat>> {
        Ok(Vec::new())
    }
}

fn uuid_like() -> String {
    format!("task-{}", Utc::now().timestamp_nanos_opt().unwrap_or(0))
}

/// Poll a job until it reaches a terminal status.
pub async fn wait_for_terminal(repo: &Arc<InMemoryJobRepository>, job_id: &str) -> Job {
    for _ in 0..400 {
        let job = repo.get_job(job_id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("job {job_id} did not reach a terminal status");
}
