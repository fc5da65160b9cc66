//! Transient per-job execution plans.
//!
//! A plan is built at submission time, embedded into the dispatched stage
//! tasks, and never persisted as its own row.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::database::models::{DEFAULT_COMPRESSION_LEVEL, Job, JobPriority, JobStatus, VideoQuality};
use crate::scheduler::resource::ResourceRequirements;
use crate::{Error, Result};

/// One phase of a job's pipeline. Stages execute strictly in this order,
/// one at a time; a plan may omit `Process` and `Merge`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Download,
    Process,
    Merge,
    Notify,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Process => "process",
            Self::Merge => "merge",
            Self::Notify => "notify",
        }
    }

    /// The job status a stage advances toward while it runs.
    pub fn in_progress_status(&self) -> Option<JobStatus> {
        match self {
            Self::Download => Some(JobStatus::Downloading),
            Self::Process => Some(JobStatus::Processing),
            Self::Merge => Some(JobStatus::Merging),
            Self::Notify => None,
        }
    }
}

/// Per-stage configuration embedded into the dispatched stage task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StageConfig {
    Download {
        video_urls: Vec<String>,
        start_episode: u32,
        video_quality: VideoQuality,
    },
    Process {
        video_quality: VideoQuality,
        compression_level: i32,
        use_gpu: bool,
        use_hardware_accel: bool,
    },
    Merge {
        output_path: PathBuf,
        use_gpu: bool,
        use_hardware_accel: bool,
    },
    Notify {
        webhook_url: String,
    },
}

/// Directories the plan builder writes stage outputs under.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub output_dir: PathBuf,
}

/// Declarative description of the stages one job will run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub job_id: String,
    pub stages: Vec<JobStage>,
    pub stage_configs: HashMap<JobStage, StageConfig>,
    pub priority: JobPriority,
    pub resource_requirements: ResourceRequirements,
    pub notification_webhook: Option<String>,
}

impl ExecutionPlan {
    /// Compile a plan from a job record.
    ///
    /// DOWNLOAD always runs. PROCESS runs when the job asks for a transform
    /// (non-original quality or a non-default compression level). MERGE runs
    /// for multi-video jobs. NOTIFY runs when a webhook is configured.
    pub fn for_job(job: &Job, ctx: &PlanContext, requirements: ResourceRequirements) -> Self {
        let mut stages = Vec::new();
        let mut stage_configs = HashMap::new();

        stages.push(JobStage::Download);
        stage_configs.insert(
            JobStage::Download,
            StageConfig::Download {
                video_urls: job.video_urls.clone(),
                start_episode: 1,
                video_quality: job.video_quality,
            },
        );

        if job.video_quality != VideoQuality::Original
            || job.compression_level != DEFAULT_COMPRESSION_LEVEL
        {
            stages.push(JobStage::Process);
            stage_configs.insert(
                JobStage::Process,
                StageConfig::Process {
                    video_quality: job.video_quality,
                    compression_level: job.compression_level,
                    use_gpu: job.use_gpu,
                    use_hardware_accel: job.use_hardware_accel,
                },
            );
        }

        if job.video_urls.len() > 1 {
            stages.push(JobStage::Merge);
            let filename = format!("{}.mp4", fetch::sanitize_filename(&job.season_name));
            stage_configs.insert(
                JobStage::Merge,
                StageConfig::Merge {
                    output_path: ctx.output_dir.join(filename),
                    use_gpu: job.use_gpu,
                    use_hardware_accel: job.use_hardware_accel,
                },
            );
        }

        if let Some(webhook) = &job.notification_webhook {
            stages.push(JobStage::Notify);
            stage_configs.insert(
                JobStage::Notify,
                StageConfig::Notify {
                    webhook_url: webhook.clone(),
                },
            );
        }

        Self {
            job_id: job.id.clone(),
            stages,
            stage_configs,
            priority: job.priority,
            resource_requirements: requirements,
            notification_webhook: job.notification_webhook.clone(),
        }
    }

    /// Check structural invariants: stages present, DOWNLOAD first, strict
    /// pipeline order, a config for every declared stage.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::validation("execution plan declares no stages"));
        }
        if self.stages[0] != JobStage::Download {
            return Err(Error::validation("execution plan must start with download"));
        }
        if !self.stages.is_sorted_by(|a, b| a < b) {
            return Err(Error::validation(
                "execution plan stages must be unique and in pipeline order",
            ));
        }
        for stage in &self.stages {
            if !self.stage_configs.contains_key(stage) {
                return Err(Error::validation(format!(
                    "missing configuration for stage {stage}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::JobPriority;

    fn ctx() -> PlanContext {
        PlanContext {
            output_dir: PathBuf::from("/srv/output"),
        }
    }

    fn requirements(job: &Job) -> ResourceRequirements {
        ResourceRequirements::estimate_for(job, false)
    }

    #[test]
    fn single_original_video_is_download_only() {
        let job = Job::new("Show", vec!["http://v.example/1".to_string()]);
        let plan = ExecutionPlan::for_job(&job, &ctx(), requirements(&job));
        assert_eq!(plan.stages, vec![JobStage::Download]);
        plan.validate().unwrap();
    }

    #[test]
    fn transform_request_adds_process_stage() {
        let job = Job::new("Show", vec!["http://v.example/1".to_string()])
            .with_quality(VideoQuality::P1080);
        let plan = ExecutionPlan::for_job(&job, &ctx(), requirements(&job));
        assert_eq!(plan.stages, vec![JobStage::Download, JobStage::Process]);
    }

    #[test]
    fn multi_video_job_merges_and_notifies() {
        let job = Job::new(
            "Show: Part 2",
            vec![
                "http://v.example/1".to_string(),
                "http://v.example/2".to_string(),
            ],
        )
        .with_webhook("http://hooks.example/done");
        let plan = ExecutionPlan::for_job(&job, &ctx(), requirements(&job));
        assert_eq!(
            plan.stages,
            vec![JobStage::Download, JobStage::Merge, JobStage::Notify]
        );

        let Some(StageConfig::Merge { output_path, .. }) = plan.stage_configs.get(&JobStage::Merge)
        else {
            panic!("merge config missing");
        };
        // The season name is sanitized before it becomes a filename.
        assert_eq!(output_path, &PathBuf::from("/srv/output/Show_ Part 2.mp4"));
    }

    #[test]
    fn validate_rejects_out_of_order_stages() {
        let job = Job::new("Show", vec!["http://v.example/1".to_string()]);
        let mut plan = ExecutionPlan::for_job(&job, &ctx(), requirements(&job));
        plan.stages = vec![JobStage::Notify, JobStage::Download];
        assert!(plan.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_stage_config() {
        let job = Job::new("Show", vec!["http://v.example/1".to_string()]);
        let mut plan = ExecutionPlan::for_job(&job, &ctx(), requirements(&job));
        plan.stages.push(JobStage::Notify);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn plan_carries_job_priority() {
        let job = Job::new("Show", vec!["http://v.example/1".to_string()])
            .with_priority(JobPriority::Urgent);
        let plan = ExecutionPlan::for_job(&job, &ctx(), requirements(&job));
        assert_eq!(plan.priority, JobPriority::Urgent);
    }
}
