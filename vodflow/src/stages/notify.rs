//! NOTIFY stage: terminal webhook POST with a completion payload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::info;

use crate::database::repositories::JobRepository;
use crate::jobs::plan::{JobStage, StageConfig};
use crate::substrate::StageTask;
use crate::{Error, Result};

use super::{StageContext, StageHandler, record_stage_completed, record_stage_failed};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct NotifyStageHandler {
    client: Client,
    repo: Arc<dyn JobRepository>,
}

impl NotifyStageHandler {
    pub fn new(repo: Arc<dyn JobRepository>) -> Result<Self> {
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| Error::Other(format!("Failed to build webhook client: {e}")))?;
        Ok(Self { client, repo })
    }
}

#[async_trait]
impl StageHandler for NotifyStageHandler {
    fn stage(&self) -> JobStage {
        JobStage::Notify
    }

    async fn run(&self, task: &StageTask, ctx: StageContext) -> Result<StageContext> {
        let StageConfig::Notify { webhook_url } = &task.config else {
            return Err(Error::validation("notify stage received foreign config"));
        };

        let payload = json!({
            "job_id": task.job_id,
            "status": "completed",
            "episodes": ctx.downloaded.len(),
            "merged_path": ctx.merged_path,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let outcome = self
            .client
            .post(webhook_url)
            .json(&payload)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match outcome {
            Ok(_) => {
                info!(job_id = %task.job_id, webhook_url, "Completion notification delivered");
                record_stage_completed(&self.repo, task).await?;
                Ok(ctx)
            }
            Err(err) => {
                let message = format!("notification delivery failed: {err}");
                record_stage_failed(&self.repo, task, &message).await;
                Err(Error::Other(message))
            }
        }
    }
}
