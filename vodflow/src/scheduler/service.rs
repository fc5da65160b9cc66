//! Priority-based admission scheduling.
//!
//! One pass per cycle: snapshot resources, rank pending jobs, estimate each
//! job's needs, and admit what fits. Greedy, single-pass, non-preemptive; an
//! admitted job is never revoked within or after the cycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::database::models::{Job, JobPriority};
use crate::database::repositories::JobRepository;
use crate::jobs::manager::JobManager;
use crate::jobs::plan::{ExecutionPlan, JobStage, PlanContext};
use crate::substrate::{QueueStat, TaskSubstrate};
use crate::{Error, Result};

use super::resource::{ResourceProbe, ResourceRequirements, SystemResources};

/// Admission detail for one scheduled job.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub priority: JobPriority,
    pub task_id: String,
    pub stages: Vec<JobStage>,
    pub estimated_resources: ResourceRequirements,
}

/// Detail for one job left PENDING this cycle.
///
/// A resource skip is expected scheduling data, not an error; the job shows
/// no failure and is reconsidered next cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedJob {
    pub job_id: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_resources: Option<ResourceRequirements>,
}

/// Outcome of one scheduling cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulingReport {
    pub total_pending_jobs: usize,
    pub scheduled_jobs: Vec<ScheduledJob>,
    pub skipped_jobs: Vec<SkippedJob>,
    /// The locally debited snapshot as it stood at cycle end.
    pub system_resources: SystemResources,
}

/// Queue statistics for operator visibility.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatsReport {
    pub timestamp: DateTime<Utc>,
    pub queues: Vec<QueueStat>,
    pub total_active_tasks: usize,
    pub total_reserved_tasks: usize,
}

/// Priority scheduler with resource awareness.
pub struct PriorityScheduler {
    repo: Arc<dyn JobRepository>,
    job_manager: Arc<JobManager>,
    substrate: Arc<dyn TaskSubstrate>,
    probe: Arc<dyn ResourceProbe>,
    config: SchedulerConfig,
    plan_ctx: PlanContext,
}

impl PriorityScheduler {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        job_manager: Arc<JobManager>,
        substrate: Arc<dyn TaskSubstrate>,
        probe: Arc<dyn ResourceProbe>,
        config: SchedulerConfig,
        plan_ctx: PlanContext,
    ) -> Self {
        Self {
            repo,
            job_manager,
            substrate,
            probe,
            config,
            plan_ctx,
        }
    }

    /// Run one admission-control pass over the pending queue.
    pub async fn schedule_pending_jobs(&self) -> Result<SchedulingReport> {
        self.cycle()
            .await
            .map_err(|err| Error::scheduler(err.to_string()))
    }

    async fn cycle(&self) -> Result<SchedulingReport> {
        debug!("Starting job scheduling cycle");

        // One local snapshot per cycle; debited in place, never shared.
        let mut resources = self.probe.snapshot();

        let pending = self
            .repo
            .list_pending_jobs(self.config.pending_jobs_limit as i64)
            .await?;
        let total_pending_jobs = pending.len();

        if pending.is_empty() {
            debug!("No pending jobs to schedule");
            return Ok(SchedulingReport {
                total_pending_jobs,
                scheduled_jobs: Vec::new(),
                skipped_jobs: Vec::new(),
                system_resources: resources,
            });
        }

        let ranked = rank_jobs(pending);

        let mut scheduled_jobs = Vec::new();
        let mut skipped_jobs = Vec::new();

        for job in ranked {
            let requirements = ResourceRequirements::estimate_for(&job, self.config.enable_gpu);

            if let Some(reason) = admission_block(&resources, &requirements, &self.config) {
                debug!(job_id = %job.id, reason, "Skipping job");
                skipped_jobs.push(SkippedJob {
                    job_id: job.id.clone(),
                    reason: reason.to_string(),
                    required_resources: Some(requirements),
                });
                continue;
            }

            let plan = ExecutionPlan::for_job(&job, &self.plan_ctx, requirements.clone());
            match self.job_manager.submit_job(&job.id, plan).await {
                Ok(receipt) => {
                    debit(&mut resources, &requirements);
                    scheduled_jobs.push(ScheduledJob {
                        job_id: job.id.clone(),
                        priority: job.priority,
                        task_id: receipt.task_id,
                        stages: receipt.stages,
                        estimated_resources: requirements,
                    });
                }
                Err(err) => {
                    // A failed submission costs nothing from the snapshot;
                    // record it and keep going with the rest of the queue.
                    warn!(job_id = %job.id, error = %err, "Failed to schedule job");
                    skipped_jobs.push(SkippedJob {
                        job_id: job.id.clone(),
                        reason: format!("Scheduling error: {err}"),
                        required_resources: None,
                    });
                }
            }
        }

        info!(
            total_pending = total_pending_jobs,
            scheduled = scheduled_jobs.len(),
            skipped = skipped_jobs.len(),
            "Scheduling cycle completed"
        );

        Ok(SchedulingReport {
            total_pending_jobs,
            scheduled_jobs,
            skipped_jobs,
            system_resources: resources,
        })
    }

    /// Drive recurring, non-overlapping cycles until cancelled.
    ///
    /// A new cycle never starts before the prior one finishes: the next
    /// tick is awaited only after the cycle future completes. A failed
    /// cycle is logged and the next tick proceeds normally.
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.cycle_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.cycle_interval.as_secs(),
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Scheduler loop stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            if let Err(err) = self.schedule_pending_jobs().await {
                error!(error = %err, "Scheduling cycle failed");
            }
        }
    }

    /// Queue counts from the substrate, annotated with static weights.
    /// Operator visibility only; weights never influence admission.
    pub async fn get_queue_stats(&self) -> Result<QueueStatsReport> {
        let queues = self.substrate.queue_snapshot().await?;
        let total_active_tasks = queues.iter().map(|q| q.active_tasks).sum();
        let total_reserved_tasks = queues.iter().map(|q| q.reserved_tasks).sum();
        Ok(QueueStatsReport {
            timestamp: Utc::now(),
            queues,
            total_active_tasks,
            total_reserved_tasks,
        })
    }
}

/// Strict priority, FIFO within a tier. The sort is stable, so
/// equal-priority jobs keep their creation-time order.
fn rank_jobs(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    jobs
}

/// Check a job against the current (already-debited) snapshot.
/// Returns the skip reason when the job cannot be admitted.
fn admission_block(
    resources: &SystemResources,
    requirements: &ResourceRequirements,
    config: &SchedulerConfig,
) -> Option<&'static str> {
    if resources.cpu_percent > config.cpu_threshold {
        return Some("Insufficient resources");
    }
    if resources.memory_percent > config.memory_threshold
        || resources.available_memory_mb < requirements.memory_mb
    {
        return Some("Insufficient resources");
    }
    if resources.disk_percent > config.disk_threshold
        || resources.available_disk_mb < requirements.disk_space_mb
    {
        return Some("Insufficient resources");
    }
    if requirements.gpu_required
        && (!resources.gpu_available
            || resources.gpu_memory_available_mb < requirements.gpu_memory_mb)
    {
        return Some("Insufficient resources");
    }
    None
}

/// Debit an admitted job's estimate from the local snapshot so later jobs
/// in the same pass see the reduced headroom.
fn debit(resources: &mut SystemResources, requirements: &ResourceRequirements) {
    let cpu_impact = requirements.cpu_cores as f32 * 25.0;
    resources.cpu_percent = (resources.cpu_percent + cpu_impact).min(100.0);

    resources.available_memory_mb = resources
        .available_memory_mb
        .saturating_sub(requirements.memory_mb);
    resources.memory_percent =
        (resources.memory_percent + requirements.memory_mb as f32 / 1024.0).min(100.0);

    // Disk percent does not move within a cycle; only headroom shrinks.
    resources.available_disk_mb = resources
        .available_disk_mb
        .saturating_sub(requirements.disk_space_mb);

    resources.gpu_memory_available_mb = resources
        .gpu_memory_available_mb
        .saturating_sub(requirements.gpu_memory_mb);
}
