//! Task-execution substrate interface.
//!
//! The orchestration core dispatches stage chains to this interface and
//! queries task state back through it. [`local::LocalSubstrate`] is the
//! in-process adapter; a broker-backed deployment implements the same trait.

pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::database::models::JobPriority;
use crate::jobs::plan::{JobStage, StageConfig};

#[cfg(test)]
use mockall::automock;

pub use local::LocalSubstrate;

/// Work queues stage tasks are routed to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Download,
    Processing,
    Merge,
    Notifications,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Download,
        QueueName::Processing,
        QueueName::Merge,
        QueueName::Notifications,
    ];

    pub fn for_stage(stage: JobStage) -> Self {
        match stage {
            JobStage::Download => Self::Download,
            JobStage::Process => Self::Processing,
            JobStage::Merge => Self::Merge,
            JobStage::Notify => Self::Notifications,
        }
    }

    /// Static weight shown in queue statistics. Operator visibility only;
    /// weights do not influence admission.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Download => 1.0,
            Self::Processing => 2.0,
            Self::Merge => 1.5,
            Self::Notifications => 0.5,
        }
    }
}

/// Lifecycle state of a dispatched chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TaskState {
    /// Accepted, not yet running.
    Pending,
    /// A stage of the chain is executing.
    Running,
    /// Every stage finished successfully.
    Succeeded,
    /// A stage failed; the rest of the chain did not run.
    Failed { error: String },
    /// The chain was forcefully terminated.
    Revoked,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. } | Self::Revoked)
    }
}

/// One dispatched stage task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTask {
    pub job_id: String,
    pub stage: JobStage,
    pub queue: QueueName,
    pub priority: JobPriority,
    /// 0-based position within the chain.
    pub position: usize,
    pub total_stages: usize,
    pub config: StageConfig,
}

impl StageTask {
    pub fn is_final(&self) -> bool {
        self.position + 1 == self.total_stages
    }

    /// Whole-job progress after this stage completes.
    pub fn completion_percentage(&self) -> i32 {
        (((self.position + 1) * 100) / self.total_stages.max(1)) as i32
    }
}

/// An ordered, non-empty chain of stage tasks for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskChain {
    pub tasks: Vec<StageTask>,
}

impl TaskChain {
    pub fn new(tasks: Vec<StageTask>) -> Result<Self> {
        if tasks.is_empty() {
            return Err(crate::Error::validation("task chain requires at least one stage"));
        }
        Ok(Self { tasks })
    }
}

/// Per-queue counters for operator visibility.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStat {
    pub queue: QueueName,
    pub active_tasks: usize,
    pub reserved_tasks: usize,
    pub weight: f64,
}

/// The external broker/worker system that runs dispatched stage tasks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaskSubstrate: Send + Sync {
    /// Submit a chain; stages run strictly in order, one at a time.
    /// Returns the root task id.
    async fn submit_chain(&self, chain: TaskChain) -> Result<String>;

    /// Forcefully terminate a dispatched chain.
    async fn terminate(&self, task_id: &str) -> Result<()>;

    /// Query live chain state.
    async fn task_state(&self, task_id: &str) -> Result<TaskState>;

    /// Active/reserved task counts per queue.
    async fn queue_snapshot(&self) -> Result<Vec<QueueStat>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_routing_covers_all_stages() {
        assert_eq!(QueueName::for_stage(JobStage::Download), QueueName::Download);
        assert_eq!(QueueName::for_stage(JobStage::Process), QueueName::Processing);
        assert_eq!(QueueName::for_stage(JobStage::Merge), QueueName::Merge);
        assert_eq!(QueueName::for_stage(JobStage::Notify), QueueName::Notifications);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(
            TaskState::Failed {
                error: "boom".to_string()
            }
            .is_terminal()
        );
        assert!(TaskState::Revoked.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn completion_percentage_steps_through_chain() {
        let task = |position, total| StageTask {
            job_id: "j".to_string(),
            stage: JobStage::Download,
            queue: QueueName::Download,
            priority: JobPriority::Normal,
            position,
            total_stages: total,
            config: StageConfig::Download {
                video_urls: vec![],
                start_episode: 1,
                video_quality: crate::database::models::VideoQuality::Original,
            },
        };
        assert_eq!(task(0, 4).completion_percentage(), 25);
        assert_eq!(task(3, 4).completion_percentage(), 100);
        assert!(task(3, 4).is_final());
        assert!(!task(0, 4).is_final());
    }

    #[test]
    fn empty_chain_is_rejected() {
        assert!(TaskChain::new(Vec::new()).is_err());
    }
}
