//! Resource-aware priority scheduling.

pub mod resource;
pub mod service;

pub use resource::{
    GpuSettings, ResourceProbe, ResourceRequirements, SysinfoProbe, SystemResources,
};
pub use service::{
    PriorityScheduler, QueueStatsReport, ScheduledJob, SchedulingReport, SkippedJob,
};
