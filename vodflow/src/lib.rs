//! vodflow: video ingest job orchestration.
//!
//! A [`scheduler::PriorityScheduler`] admits pending jobs against a
//! resource snapshot, a [`jobs::JobManager`] compiles each admitted job's
//! execution plan into a chain of stage tasks on a
//! [`substrate::TaskSubstrate`], and the DOWNLOAD stage drives the
//! `fetch-engine` download manager under a global concurrency cap.

pub mod config;
pub mod database;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod scheduler;
pub mod services;
pub mod stages;
pub mod substrate;

pub use config::{AppConfig, SchedulerConfig};
pub use error::{Error, Result};
