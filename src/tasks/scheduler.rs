use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use tokio::{task::JoinHandle, time::sleep};

use crate::{
    collaborators::{Downloader, Uploader},
    db::queue::QueueRepository,
    domain::{DownloadStatus, Job, JobState, UploadStatus},
    error::QueueError,
    infrastructure::shutdown::ShutdownListener,
};

/// The polling scheduler. One instance drives due jobs through the
/// download and upload collaborators, persisting every transition, at a
/// fixed tick that bounds the collaborator call rate.
pub struct QueueWorker {
    queue: QueueRepository,
    downloader: Arc<dyn Downloader>,
    uploader: Arc<dyn Uploader>,
    tick: Duration,
}

impl QueueWorker {
    pub fn new(
        queue: QueueRepository,
        downloader: Arc<dyn Downloader>,
        uploader: Arc<dyn Uploader>,
        tick: Duration,
    ) -> Self {
        Self {
            queue,
            downloader,
            uploader,
            tick,
        }
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: ShutdownListener) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = self.run_loop(&mut shutdown).await {
                tracing::error!(target: "worker", error = %err, "queue worker crashed");
            }
        })
    }

    async fn run_loop(&self, shutdown: &mut ShutdownListener) -> Result<()> {
        tracing::info!(target: "worker", tick_secs = self.tick.as_secs(), "queue worker started");
        loop {
            if shutdown.is_triggered() {
                break;
            }

            match self.queue.dequeue_due(Utc::now()).await {
                Ok(Some(job)) => {
                    if let Err(err) = self.process(&job).await {
                        // store unreachable mid-cycle; the job is left as it
                        // was and picked up again on a later tick
                        tracing::error!(
                            target: "worker",
                            error = %err,
                            post_id = %job.post_id,
                            user_id = job.user_id,
                            "cycle aborted"
                        );
                    }
                }
                Ok(None) => {
                    tracing::debug!(target: "worker", "no due jobs in the queue");
                }
                Err(err) => {
                    tracing::error!(target: "worker", error = %err, "failed to poll the queue");
                }
            }

            tokio::select! {
                _ = sleep(self.tick) => {}
                _ = shutdown.notified() => break,
            }
        }
        tracing::info!(target: "worker", "queue worker stopped");
        Ok(())
    }

    /// Drives one job through the dispatch table. Collaborator failures
    /// park the job in the error state for the next due cycle; only
    /// persistence failures propagate.
    pub(crate) async fn process(&self, job: &Job) -> Result<(), QueueError> {
        let mut download_status = job.download_status;
        let mut owner = job.post_owner.clone();

        if !download_status.is_terminal() {
            match self.downloader.fetch(&job.post_id).await {
                Ok(outcome) => {
                    download_status = outcome.status;
                    if let Some(fetched) = outcome.owner {
                        owner = fetched;
                    }
                    self.queue
                        .transition(
                            &job.post_id,
                            JobState::Processing,
                            Some(download_status),
                            None,
                            Some(&owner),
                        )
                        .await?;
                }
                Err(err) => {
                    tracing::warn!(
                        target: "worker",
                        error = %err,
                        post_id = %job.post_id,
                        user_id = job.user_id,
                        "download failed, job parked for retry"
                    );
                    self.queue
                        .transition(
                            &job.post_id,
                            JobState::Error,
                            Some(DownloadStatus::DownloadError),
                            None,
                            None,
                        )
                        .await?;
                    return Ok(());
                }
            }
        }

        match download_status {
            DownloadStatus::Completed => {}
            DownloadStatus::SourceNotFound => {
                self.queue
                    .transition(&job.post_id, JobState::Processed, Some(download_status), None, None)
                    .await?;
                tracing::info!(
                    target: "worker",
                    post_id = %job.post_id,
                    user_id = job.user_id,
                    "source gone, job closed without upload"
                );
                return Ok(());
            }
            DownloadStatus::NotSupported => {
                self.queue
                    .transition(&job.post_id, JobState::NotSupported, Some(download_status), None, None)
                    .await?;
                tracing::info!(
                    target: "worker",
                    post_id = %job.post_id,
                    user_id = job.user_id,
                    "content type not supported, job closed"
                );
                return Ok(());
            }
            DownloadStatus::DownloadError | DownloadStatus::NotStarted => {
                return Ok(());
            }
        }

        let mut upload_status = job.upload_status;
        if upload_status != UploadStatus::Completed {
            match self.uploader.relay(&owner).await {
                Ok(status) => {
                    upload_status = status;
                }
                Err(err) => {
                    tracing::warn!(
                        target: "worker",
                        error = %err,
                        post_id = %job.post_id,
                        user_id = job.user_id,
                        "upload failed, job parked for retry"
                    );
                    self.queue
                        .transition(
                            &job.post_id,
                            JobState::Error,
                            None,
                            Some(UploadStatus::UploadError),
                            None,
                        )
                        .await?;
                    return Ok(());
                }
            }
        }

        if upload_status == UploadStatus::Completed {
            self.queue
                .transition(
                    &job.post_id,
                    JobState::Processed,
                    Some(download_status),
                    Some(upload_status),
                    None,
                )
                .await?;
            tracing::info!(
                target: "worker",
                post_id = %job.post_id,
                user_id = job.user_id,
                "job processed"
            );
        } else if upload_status == UploadStatus::UploadError {
            self.queue
                .transition(&job.post_id, JobState::Error, None, Some(upload_status), None)
                .await?;
        } else {
            self.queue
                .transition(&job.post_id, JobState::Processing, None, Some(upload_status), None)
                .await?;
        }
        Ok(())
    }
}
