//! Service container for dependency injection.
//!
//! The composition root: owns every service instance and its lifecycle.
//! Nothing in the system is a module-level singleton; tests build their own
//! containers (or the individual services) with whatever fakes they need.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fetch::{DownloadManager, PlatformSpec};

use crate::config::AppConfig;
use crate::database;
use crate::database::repositories::{JobRepository, SqlxJobRepository};
use crate::jobs::manager::JobManager;
use crate::jobs::plan::PlanContext;
use crate::scheduler::resource::{GpuSettings, SysinfoProbe};
use crate::scheduler::service::PriorityScheduler;
use crate::stages::{DownloadStageHandler, NotifyStageHandler};
use crate::substrate::{LocalSubstrate, TaskSubstrate};
use crate::{Error, Result};

/// Service container holding all application services.
pub struct ServiceContainer {
    pub pool: SqlitePool,
    pub repo: Arc<dyn JobRepository>,
    pub substrate: Arc<LocalSubstrate>,
    pub download_manager: Arc<DownloadManager>,
    pub job_manager: Arc<JobManager>,
    pub scheduler: Arc<PriorityScheduler>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Wire the full service graph from configuration.
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("Initializing service container");

        let pool = database::init_pool(&config.database_url).await?;
        let repo: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(pool.clone()));

        let mut download_config = config.download.clone();
        download_config.platforms = config
            .platform_hosts
            .iter()
            .map(|host| PlatformSpec::peertube(host))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::config(e.to_string()))?;
        let download_manager = Arc::new(DownloadManager::new(download_config)?);

        let substrate = Arc::new(LocalSubstrate::new());
        substrate.register_handler(Arc::new(DownloadStageHandler::new(
            download_manager.clone(),
            repo.clone(),
        )));
        substrate.register_handler(Arc::new(NotifyStageHandler::new(repo.clone())?));

        let substrate_dyn: Arc<dyn TaskSubstrate> = substrate.clone();
        let job_manager = Arc::new(JobManager::new(repo.clone(), substrate_dyn.clone()));

        let probe = Arc::new(SysinfoProbe::new(
            config.temp_dir.clone(),
            GpuSettings {
                enabled: config.scheduler.enable_gpu,
                memory_mb: config.scheduler.gpu_memory_mb,
            },
        ));

        let scheduler = Arc::new(PriorityScheduler::new(
            repo.clone(),
            job_manager.clone(),
            substrate_dyn,
            probe,
            config.scheduler.clone(),
            PlanContext {
                output_dir: config.output_dir.clone(),
            },
        ));

        info!("Service container initialized");

        Ok(Self {
            pool,
            repo,
            substrate,
            download_manager,
            job_manager,
            scheduler,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Shared token services observe for graceful shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Cancel all work and release resources.
    pub async fn shutdown(&self) {
        info!("Shutting down service container");
        self.cancellation_token.cancel();

        let cancelled = self.download_manager.cancel_all_downloads();
        if cancelled > 0 {
            warn!(cancelled, "Cancelled in-flight downloads during shutdown");
        }

        self.pool.close().await;
        info!("Service container shut down");
    }
}
