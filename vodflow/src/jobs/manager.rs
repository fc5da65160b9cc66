//! Job lifecycle coordination.
//!
//! Compiles execution plans into stage chains on the task substrate and
//! exposes a uniform submit/cancel/status/retry/cleanup surface. A thin
//! coordinator: stage execution and its error reporting belong to the stage
//! tasks themselves.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::database::models::{JobPriority, JobStatus};
use crate::database::repositories::JobRepository;
use crate::jobs::plan::{ExecutionPlan, JobStage};
use crate::substrate::{QueueName, StageTask, TaskChain, TaskState, TaskSubstrate};
use crate::{Error, Result};

/// Result of a successful submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReceipt {
    pub job_id: String,
    pub task_id: String,
    pub stages: Vec<JobStage>,
    pub submitted_at: DateTime<Utc>,
}

/// Result of a cancellation. Success-shaped even when nothing was tracked:
/// cancellation is idempotent by construction.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub success: bool,
    pub job_id: String,
    pub cancelled_at: DateTime<Utc>,
}

/// Live substrate state merged into a status view.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub state: TaskState,
    pub ready: bool,
    pub successful: Option<bool>,
    pub failed: Option<bool>,
    pub error: Option<String>,
}

/// Persisted job fields merged with live task state when available.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress_percentage: i32,
    pub current_stage: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    /// Most recent errors only.
    pub errors: Vec<String>,
    pub task_status: Option<TaskStatusView>,
}

/// Optional overrides applied when retrying a job.
#[derive(Debug, Clone, Default)]
pub struct RetryOverrides {
    pub priority: Option<JobPriority>,
}

struct TrackedJob {
    task_id: String,
    plan: ExecutionPlan,
    #[allow(dead_code)]
    submitted_at: DateTime<Utc>,
}

/// Manages job lifecycle and stage-chain coordination.
pub struct JobManager {
    repo: Arc<dyn JobRepository>,
    substrate: Arc<dyn TaskSubstrate>,
    /// In-memory tracking for low-latency status queries; not a durable
    /// record, evicted on cancel/cleanup and lost across restarts.
    tracked: DashMap<String, TrackedJob>,
}

impl JobManager {
    pub fn new(repo: Arc<dyn JobRepository>, substrate: Arc<dyn TaskSubstrate>) -> Self {
        Self {
            repo,
            substrate,
            tracked: DashMap::new(),
        }
    }

    /// Submit a job's execution plan as a stage chain.
    ///
    /// Chain construction errors surface synchronously and leave the job
    /// untouched. A substrate dispatch failure marks the job FAILED.
    pub async fn submit_job(
        &self,
        job_id: &str,
        plan: ExecutionPlan,
    ) -> Result<SubmissionReceipt> {
        if plan.job_id != job_id {
            return Err(Error::validation(format!(
                "plan belongs to job {}, not {job_id}",
                plan.job_id
            )));
        }

        // Validate the job exists before doing anything else.
        self.repo.get_job(job_id).await?;

        plan.validate()?;
        let chain = build_chain(&plan)?;

        info!(
            job_id,
            stages = ?plan.stages,
            priority = %plan.priority,
            "Submitting job"
        );

        let task_id = match self.substrate.submit_chain(chain).await {
            Ok(task_id) => task_id,
            Err(err) => {
                // Dispatch failed after construction succeeded; record it.
                if let Err(repo_err) = self
                    .repo
                    .append_error(job_id, &format!("submission failed: {err}"))
                    .await
                {
                    warn!(job_id, error = %repo_err, "Failed to record submission error");
                }
                if let Err(repo_err) =
                    self.repo.update_job_status(job_id, JobStatus::Failed).await
                {
                    warn!(job_id, error = %repo_err, "Failed to mark job failed");
                }
                return Err(Error::submission(job_id, err.to_string()));
            }
        };

        self.repo.set_task_id(job_id, &task_id).await?;
        let first_stage_status = plan.stages[0]
            .in_progress_status()
            .unwrap_or(JobStatus::Downloading);
        self.repo.update_job_status(job_id, first_stage_status).await?;

        let submitted_at = Utc::now();
        let stages = plan.stages.clone();
        self.tracked.insert(
            job_id.to_string(),
            TrackedJob {
                task_id: task_id.clone(),
                plan,
                submitted_at,
            },
        );

        info!(job_id, task_id, "Job submitted");

        Ok(SubmissionReceipt {
            job_id: job_id.to_string(),
            task_id,
            stages,
            submitted_at,
        })
    }

    /// Cancel a job.
    ///
    /// Terminates the tracked chain when one exists, then unconditionally
    /// persists CANCELLED and evicts the job from tracking. Idempotent:
    /// unknown or already-cancelled ids still produce a success-shaped
    /// outcome.
    pub async fn cancel_job(&self, job_id: &str) -> CancelOutcome {
        if let Some(entry) = self.tracked.get(job_id) {
            let task_id = entry.task_id.clone();
            drop(entry);
            if let Err(err) = self.substrate.terminate(&task_id).await {
                warn!(job_id, task_id, error = %err, "Failed to terminate task chain");
            }
        }

        if let Err(err) = self.repo.update_job_status(job_id, JobStatus::Cancelled).await {
            warn!(job_id, error = %err, "Failed to persist cancelled status");
        }

        self.tracked.remove(job_id);
        info!(job_id, "Job cancelled");

        CancelOutcome {
            success: true,
            job_id: job_id.to_string(),
            cancelled_at: Utc::now(),
        }
    }

    /// Merge persisted job fields with live substrate state.
    ///
    /// A substrate error degrades the view to repository-only data rather
    /// than failing the query.
    pub async fn get_job_status(&self, job_id: &str) -> Result<JobStatusView> {
        let job = self.repo.get_job(job_id).await?;

        let task_status = match self.tracked.get(job_id).map(|e| e.task_id.clone()) {
            Some(task_id) => match self.substrate.task_state(&task_id).await {
                Ok(state) => {
                    let ready = state.is_terminal();
                    let error = match &state {
                        TaskState::Failed { error } => Some(error.clone()),
                        _ => None,
                    };
                    Some(TaskStatusView {
                        task_id,
                        ready,
                        successful: ready.then(|| state == TaskState::Succeeded),
                        failed: ready.then(|| !matches!(state, TaskState::Succeeded)),
                        error,
                        state,
                    })
                }
                Err(err) => {
                    warn!(job_id, error = %err, "Substrate unreachable, degrading to repository state");
                    None
                }
            },
            None => None,
        };

        let errors = job
            .errors
            .iter()
            .rev()
            .take(3)
            .rev()
            .cloned()
            .collect();

        Ok(JobStatusView {
            job_id: job.id,
            status: job.status,
            progress_percentage: job.progress_percentage,
            current_stage: job.current_stage,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            retry_count: job.retry_count,
            errors,
            task_status,
        })
    }

    /// Resubmit the tracked execution plan of a failed or cancelled job.
    ///
    /// Bumps the job's retry_count; per-video retry counters are untouched.
    pub async fn retry_job(
        &self,
        job_id: &str,
        overrides: RetryOverrides,
    ) -> Result<SubmissionReceipt> {
        let job = self.repo.get_job(job_id).await?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(Error::validation(format!(
                "job {job_id} is not in a retryable state ({})",
                job.status
            )));
        }

        let mut plan = self
            .tracked
            .get(job_id)
            .map(|entry| entry.plan.clone())
            .ok_or_else(|| {
                Error::validation(format!("no execution plan tracked for job {job_id}"))
            })?;

        if let Some(priority) = overrides.priority {
            plan.priority = priority;
        }

        self.repo.increment_retry_count(job_id).await?;
        self.repo.update_job_status(job_id, JobStatus::Pending).await?;
        self.repo.update_progress(job_id, "retrying", 0).await?;

        info!(job_id, retry_priority = ?overrides.priority, "Retrying job");
        self.submit_job(job_id, plan).await
    }

    /// Evict tracked handles whose chains reached a terminal state.
    ///
    /// Local garbage collection only; the persisted-job retention sweep is
    /// a separate maintenance concern.
    pub async fn cleanup_completed_jobs(&self) -> usize {
        let candidates: Vec<(String, String)> = self
            .tracked
            .iter()
            .map(|entry| (entry.key().clone(), entry.task_id.clone()))
            .collect();

        let mut evicted = 0;
        for (job_id, task_id) in candidates {
            match self.substrate.task_state(&task_id).await {
                Ok(state) if state.is_terminal() => {
                    self.tracked.remove(&job_id);
                    evicted += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(job_id, task_id, error = %err, "Skipping cleanup for unreadable task");
                }
            }
        }

        if evicted > 0 {
            info!(evicted, "Cleaned up completed job tracking entries");
        }
        evicted
    }

    /// Status views for every tracked job.
    pub async fn get_active_jobs(&self) -> Vec<JobStatusView> {
        let ids: Vec<String> = self.tracked.iter().map(|e| e.key().clone()).collect();
        let mut views = Vec::with_capacity(ids.len());
        for job_id in ids {
            match self.get_job_status(&job_id).await {
                Ok(view) => views.push(view),
                Err(err) => warn!(job_id, error = %err, "Failed to read tracked job status"),
            }
        }
        views
    }

    /// Whether a job currently has a tracked chain.
    pub fn is_tracked(&self, job_id: &str) -> bool {
        self.tracked.contains_key(job_id)
    }
}

/// Compile a plan into the dispatched stage chain, in declared order.
/// Omitted stages are skipped entirely, never run as no-ops.
fn build_chain(plan: &ExecutionPlan) -> Result<TaskChain> {
    let total_stages = plan.stages.len();
    let mut tasks = Vec::with_capacity(total_stages);

    for (position, stage) in plan.stages.iter().enumerate() {
        let config = plan
            .stage_configs
            .get(stage)
            .cloned()
            .ok_or_else(|| {
                Error::validation(format!("missing configuration for stage {stage}"))
            })?;

        // Notifications always run at normal priority.
        let priority = match stage {
            JobStage::Notify => JobPriority::Normal,
            _ => plan.priority,
        };

        tasks.push(StageTask {
            job_id: plan.job_id.clone(),
            stage: *stage,
            queue: QueueName::for_stage(*stage),
            priority,
            position,
            total_stages,
            config,
        });
    }

    TaskChain::new(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{Job, JobPriority, VideoQuality};
    use crate::database::repositories::MockJobRepository;
    use crate::jobs::plan::PlanContext;
    use crate::scheduler::resource::ResourceRequirements;
    use crate::substrate::MockTaskSubstrate;
    use std::path::PathBuf;

    fn plan_for(job: &Job) -> ExecutionPlan {
        let ctx = PlanContext {
            output_dir: PathBuf::from("/srv/output"),
        };
        ExecutionPlan::for_job(job, &ctx, ResourceRequirements::estimate_for(job, false))
    }

    fn test_job() -> Job {
        Job::new("Show", vec!["http://v.example/1".to_string()])
    }

    #[tokio::test]
    async fn submit_job_dispatches_and_marks_downloading() {
        let job = test_job();
        let job_id = job.id.clone();
        let plan = plan_for(&job);

        let mut repo = MockJobRepository::new();
        let fetched = job.clone();
        let expected = job_id.clone();
        repo.expect_get_job()
            .withf(move |id| id == expected)
            .returning(move |_| Ok(fetched.clone()));
        repo.expect_set_task_id()
            .withf(|_, task_id| !task_id.is_empty())
            .returning(|_, _| Ok(()));
        let expected = job_id.clone();
        repo.expect_update_job_status()
            .withf(move |id, status| id == expected && *status == JobStatus::Downloading)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut substrate = MockTaskSubstrate::new();
        substrate
            .expect_submit_chain()
            .withf(|chain| chain.tasks.len() == 1 && chain.tasks[0].stage == JobStage::Download)
            .returning(|_| Ok("task-1".to_string()));

        let manager = JobManager::new(Arc::new(repo), Arc::new(substrate));
        let receipt = manager.submit_job(&job_id, plan).await.unwrap();
        assert_eq!(receipt.task_id, "task-1");
        assert_eq!(receipt.stages, vec![JobStage::Download]);
        assert!(manager.is_tracked(&job_id));
    }

    #[tokio::test]
    async fn submit_failure_marks_job_failed() {
        let job = test_job();
        let job_id = job.id.clone();
        let plan = plan_for(&job);

        let mut repo = MockJobRepository::new();
        let fetched = job.clone();
        repo.expect_get_job().returning(move |_| Ok(fetched.clone()));
        repo.expect_append_error().returning(|_, _| Ok(()));
        let expected = job_id.clone();
        repo.expect_update_job_status()
            .withf(move |id, status| id == expected && *status == JobStatus::Failed)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut substrate = MockTaskSubstrate::new();
        substrate
            .expect_submit_chain()
            .returning(|_| Err(Error::substrate("broker unavailable")));

        let manager = JobManager::new(Arc::new(repo), Arc::new(substrate));
        let err = manager.submit_job(&job_id, plan).await.unwrap_err();
        assert!(matches!(err, Error::Submission { .. }));
        assert!(!manager.is_tracked(&job_id));
    }

    #[tokio::test]
    async fn cancel_job_is_idempotent_for_unknown_ids() {
        let mut repo = MockJobRepository::new();
        repo.expect_update_job_status()
            .withf(|id, status| id == "unknown-id" && *status == JobStatus::Cancelled)
            .times(2)
            .returning(|_, _| Err(Error::not_found("Job", "unknown-id")));

        let substrate = MockTaskSubstrate::new();
        let manager = JobManager::new(Arc::new(repo), Arc::new(substrate));

        let first = manager.cancel_job("unknown-id").await;
        let second = manager.cancel_job("unknown-id").await;
        assert!(first.success);
        assert!(second.success);
        assert_eq!(first.job_id, "unknown-id");
    }

    #[tokio::test]
    async fn cancel_tracked_job_terminates_chain() {
        let job = test_job();
        let job_id = job.id.clone();
        let plan = plan_for(&job);

        let mut repo = MockJobRepository::new();
        let fetched = job.clone();
        repo.expect_get_job().returning(move |_| Ok(fetched.clone()));
        repo.expect_set_task_id().returning(|_, _| Ok(()));
        repo.expect_update_job_status().returning(|_, _| Ok(()));

        let mut substrate = MockTaskSubstrate::new();
        substrate
            .expect_submit_chain()
            .returning(|_| Ok("task-9".to_string()));
        substrate
            .expect_terminate()
            .withf(|task_id| task_id == "task-9")
            .times(1)
            .returning(|_| Ok(()));

        let manager = JobManager::new(Arc::new(repo), Arc::new(substrate));
        manager.submit_job(&job_id, plan).await.unwrap();

        let outcome = manager.cancel_job(&job_id).await;
        assert!(outcome.success);
        assert!(!manager.is_tracked(&job_id));
    }

    #[tokio::test]
    async fn status_degrades_when_substrate_unreachable() {
        let job = test_job();
        let job_id = job.id.clone();
        let plan = plan_for(&job);

        let mut repo = MockJobRepository::new();
        let fetched = job.clone();
        repo.expect_get_job().returning(move |_| Ok(fetched.clone()));
        repo.expect_set_task_id().returning(|_, _| Ok(()));
        repo.expect_update_job_status().returning(|_, _| Ok(()));

        let mut substrate = MockTaskSubstrate::new();
        substrate
            .expect_submit_chain()
            .returning(|_| Ok("task-2".to_string()));
        substrate
            .expect_task_state()
            .returning(|_| Err(Error::substrate("connection refused")));

        let manager = JobManager::new(Arc::new(repo), Arc::new(substrate));
        manager.submit_job(&job_id, plan).await.unwrap();

        let view = manager.get_job_status(&job_id).await.unwrap();
        assert!(view.task_status.is_none());
        assert_eq!(view.job_id, job_id);
    }

    #[tokio::test]
    async fn retry_requires_retryable_status_and_tracked_plan() {
        let mut job = test_job();
        let job_id = job.id.clone();

        // Still pending: not retryable.
        let mut repo = MockJobRepository::new();
        let fetched = job.clone();
        repo.expect_get_job().returning(move |_| Ok(fetched.clone()));
        let manager = JobManager::new(Arc::new(repo), Arc::new(MockTaskSubstrate::new()));
        assert!(
            manager
                .retry_job(&job_id, RetryOverrides::default())
                .await
                .is_err()
        );

        // Failed but nothing tracked: no plan to resubmit.
        job.status = JobStatus::Failed;
        let mut repo = MockJobRepository::new();
        let fetched = job.clone();
        repo.expect_get_job().returning(move |_| Ok(fetched.clone()));
        let manager = JobManager::new(Arc::new(repo), Arc::new(MockTaskSubstrate::new()));
        let err = manager
            .retry_job(&job_id, RetryOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn cleanup_evicts_terminal_chains_only() {
        let job_a = test_job();
        let job_b = test_job();
        let plan_a = plan_for(&job_a);
        let plan_b = plan_for(&job_b);

        let mut repo = MockJobRepository::new();
        let a = job_a.clone();
        let b = job_b.clone();
        repo.expect_get_job().returning(move |id| {
            if id == a.id { Ok(a.clone()) } else { Ok(b.clone()) }
        });
        repo.expect_set_task_id().returning(|_, _| Ok(()));
        repo.expect_update_job_status().returning(|_, _| Ok(()));

        let mut substrate = MockTaskSubstrate::new();
        let mut task_counter = 0;
        substrate.expect_submit_chain().returning(move |_| {
            task_counter += 1;
            Ok(format!("task-{task_counter}"))
        });
        substrate.expect_task_state().returning(|task_id| {
            if task_id == "task-1" {
                Ok(TaskState::Succeeded)
            } else {
                Ok(TaskState::Running)
            }
        });

        let manager = JobManager::new(Arc::new(repo), Arc::new(substrate));
        manager.submit_job(&job_a.id, plan_a).await.unwrap();
        manager.submit_job(&job_b.id, plan_b).await.unwrap();

        let evicted = manager.cleanup_completed_jobs().await;
        assert_eq!(evicted, 1);
        assert!(!manager.is_tracked(&job_a.id));
        assert!(manager.is_tracked(&job_b.id));
    }

    #[tokio::test]
    async fn retry_applies_priority_override() {
        let mut job = test_job();
        let job_id = job.id.clone();
        let plan = plan_for(&job);

        let mut repo = MockJobRepository::new();
        job.status = JobStatus::Failed;
        let fetched = job.clone();
        repo.expect_get_job().returning(move |_| Ok(fetched.clone()));
        repo.expect_set_task_id().returning(|_, _| Ok(()));
        repo.expect_update_job_status().returning(|_, _| Ok(()));
        let expected = job_id.clone();
        repo.expect_increment_retry_count()
            .withf(move |id| id == expected)
            .times(1)
            .returning(|_| Ok(()));
        repo.expect_update_progress().returning(|_, _, _| Ok(()));

        let mut substrate = MockTaskSubstrate::new();
        substrate
            .expect_submit_chain()
            .withf(|chain| chain.tasks[0].priority == JobPriority::Urgent)
            .returning(|_| Ok("task-3".to_string()));

        let manager = JobManager::new(Arc::new(repo), Arc::new(substrate));
        // Seed the tracking table the way a previous submission would have.
        manager.tracked.insert(
            job_id.clone(),
            TrackedJob {
                task_id: "task-0".to_string(),
                plan,
                submitted_at: Utc::now(),
            },
        );

        let receipt = manager
            .retry_job(
                &job_id,
                RetryOverrides {
                    priority: Some(JobPriority::Urgent),
                },
            )
            .await
            .unwrap();
        assert_eq!(receipt.task_id, "task-3");
    }
}
