use tracing::{error, info};

use vodflow::logging::Logging;
use vodflow::services::ServiceContainer;
use vodflow::{AppConfig, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env overrides before anything reads the environment.
    let _ = dotenvy::dotenv();

    let _logging = Logging::init()?;
    let config = AppConfig::from_env();
    info!(
        database_url = %config.database_url,
        temp_dir = %config.temp_dir.display(),
        max_concurrent_downloads = config.download.max_concurrent_downloads,
        "Starting vodflow"
    );

    let container = ServiceContainer::new(config).await?;

    let scheduler = container.scheduler.clone();
    let token = container.cancellation_token();
    let scheduler_task = tokio::spawn(async move {
        scheduler.run(token).await;
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    container.shutdown().await;
    let _ = scheduler_task.await;

    info!("Bye");
    Ok(())
}
