use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use utoipa::ToSchema;

use crate::jobs::{JobStatistics, JobStatus, ScrapeJob};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobNotification {
    pub job_id: String,
    pub status: JobStatus,
    pub total_cars: usize,
    pub download_url: String,
    pub stats: JobStatistics,
    pub error_message: Option<String>,
}

/// Posts a one-shot notification when a job ends. Never retried.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    public_base_url: String,
}

impl Notifier {
    pub fn new(public_base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(NOTIFY_TIMEOUT).build()?;
        Ok(Self {
            client,
            public_base_url: public_base_url.into(),
        })
    }

    pub fn payload(&self, job: &ScrapeJob) -> JobNotification {
        JobNotification {
            job_id: job.job_id.clone(),
            status: job.status,
            total_cars: job.records.len(),
            download_url: format!(
                "{}/download/{}",
                self.public_base_url.trim_end_matches('/'),
                job.job_id
            ),
            stats: job.stats(),
            error_message: job.error_message.clone(),
        }
    }

    /// Fire and forget; delivery problems are only logged.
    pub fn spawn_notify(&self, target: String, payload: JobNotification) {
        let notifier = self.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.deliver(&target, &payload).await {
                error!("❌ Webhook to {} failed for job {}: {}", target, payload.job_id, e);
            }
        });
    }

    pub async fn deliver(&self, target: &str, payload: &JobNotification) -> Result<()> {
        self.client
            .post(target)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        info!("📣 Webhook sent to {} for job {}", target, payload.job_id);
        Ok(())
    }
}
