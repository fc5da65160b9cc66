//! Job execution planning and lifecycle management.

pub mod manager;
pub mod plan;

pub use manager::{
    CancelOutcome, JobManager, JobStatusView, RetryOverrides, SubmissionReceipt, TaskStatusView,
};
pub use plan::{ExecutionPlan, JobStage, PlanContext, StageConfig};
