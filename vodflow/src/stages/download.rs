//! DOWNLOAD stage: drives the download engine and reports results back to
//! the job repository.

use std::sync::Arc;

use async_trait::async_trait;
use fetch::{DownloadManager, DownloadOptions, download_id};
use tracing::{info, warn};

use crate::database::models::VideoQuality;
use crate::database::repositories::JobRepository;
use crate::jobs::plan::{JobStage, StageConfig};
use crate::substrate::StageTask;
use crate::{Error, Result};

use super::{StageContext, StageHandler, record_stage_completed, record_stage_failed};

pub struct DownloadStageHandler {
    manager: Arc<DownloadManager>,
    repo: Arc<dyn JobRepository>,
}

impl DownloadStageHandler {
    pub fn new(manager: Arc<DownloadManager>, repo: Arc<dyn JobRepository>) -> Self {
        Self { manager, repo }
    }
}

#[async_trait]
impl StageHandler for DownloadStageHandler {
    fn stage(&self) -> JobStage {
        JobStage::Download
    }

    async fn run(&self, task: &StageTask, mut ctx: StageContext) -> Result<StageContext> {
        let StageConfig::Download {
            video_urls,
            start_episode,
            video_quality,
        } = &task.config
        else {
            return Err(Error::validation("download stage received foreign config"));
        };

        self.repo
            .update_progress(&task.job_id, task.stage.as_str(), 0)
            .await?;

        let options = DownloadOptions {
            resume: true,
            video_quality: match video_quality {
                VideoQuality::Original => None,
                quality => Some(quality.as_str().to_string()),
            },
        };

        // Cooperative cancellation: if the chain is revoked mid-batch,
        // cancel this job's transfers and surface the cancellation.
        let batch = self
            .manager
            .download_batch(video_urls, *start_episode, true, &options);
        let result = tokio::select! {
            result = batch => result,
            _ = ctx.token.cancelled() => {
                for (index, url) in video_urls.iter().enumerate() {
                    let id = download_id(url, *start_episode + index as u32);
                    self.manager.cancel_download(&id);
                }
                Err(fetch::DownloadError::Cancelled)
            }
        };

        match result {
            Ok(downloaded) => {
                // Per-URL failures were isolated by the batch; record the
                // missing episodes on the job before handing over.
                if downloaded.len() < video_urls.len() {
                    let got: Vec<u32> = downloaded.iter().map(|m| m.episode_number).collect();
                    for (index, url) in video_urls.iter().enumerate() {
                        let episode = *start_episode + index as u32;
                        if !got.contains(&episode) {
                            warn!(job_id = %task.job_id, episode, url, "Episode failed to download");
                            self.repo
                                .append_error(
                                    &task.job_id,
                                    &format!("episode {episode} download failed: {url}"),
                                )
                                .await?;
                        }
                    }
                }

                info!(
                    job_id = %task.job_id,
                    downloaded = downloaded.len(),
                    requested = video_urls.len(),
                    "Download stage finished"
                );
                record_stage_completed(&self.repo, task).await?;
                ctx.downloaded = downloaded;
                Ok(ctx)
            }
            Err(fetch::DownloadError::Cancelled) => Err(Error::Download(
                fetch::DownloadError::Cancelled,
            )),
            Err(err) => {
                record_stage_failed(&self.repo, task, &err.to_string()).await;
                Err(Error::Download(err))
            }
        }
    }
}
