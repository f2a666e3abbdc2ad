//! Scrape jobs and the process-wide registry that holds them.
//!
//! A job is written only by the task executing it; handlers read copies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::extraction::ExtractOptions;
use crate::listing::ListingRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("job cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

fn default_client_name() -> String {
    "default".to_string()
}

pub(crate) fn default_max_pages() -> usize {
    50
}

pub(crate) fn default_delay() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

/// What a caller asks the engine to scrape.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScrapeRequest {
    /// Index page listing the vehicles.
    #[schema(example = "https://www.autocarro.com.br/carros")]
    pub url: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Extra selectors per field, appended after the built-in chains.
    #[serde(default)]
    pub custom_selectors: Option<HashMap<String, Vec<String>>>,
    /// Maximum number of listings to visit.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Seconds to wait between listing pages.
    #[serde(default = "default_delay")]
    pub delay_between_requests: f64,
    #[serde(default = "default_true")]
    pub extract_images: bool,
    #[serde(default = "default_true")]
    pub extract_optionals: bool,
    /// URL to POST a notification to once the job ends.
    #[serde(default)]
    pub webhook_callback: Option<String>,
}

impl ScrapeRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: default_client_name(),
            custom_selectors: None,
            max_pages: default_max_pages(),
            delay_between_requests: default_delay(),
            extract_images: true,
            extract_optionals: true,
            webhook_callback: None,
        }
    }

    /// Reject requests the engine could never run.
    pub fn validate(&self) -> Result<(), String> {
        let url = Url::parse(&self.url).map_err(|e| format!("invalid url {:?}: {}", self.url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("unsupported url scheme: {}", url.scheme()));
        }
        if !self.delay_between_requests.is_finite() || self.delay_between_requests < 0.0 {
            return Err("delay_between_requests must be a non-negative number".to_string());
        }
        if let Some(target) = &self.webhook_callback {
            Url::parse(target).map_err(|e| format!("invalid webhook_callback: {}", e))?;
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.delay_between_requests).unwrap_or_default()
    }

    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            images: self.extract_images,
            optionals: self.extract_optionals,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeJob {
    pub job_id: String,
    pub request: ScrapeRequest,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Distinct listing links discovered, before the `max_pages` cap.
    pub total_found: usize,
    pub successfully_scraped: usize,
    pub errors: usize,
    pub error_message: Option<String>,
    /// Extracted records in link order, kept even when the job fails.
    pub records: Vec<ListingRecord>,
    pub result_file: Option<String>,
}

impl ScrapeJob {
    pub fn new(request: ScrapeRequest) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            request,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_found: 0,
            successfully_scraped: 0,
            errors: 0,
            error_message: None,
            records: Vec::new(),
            result_file: None,
        }
    }

    /// Move to `next`, stamping start and finish times.
    pub fn advance(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            _ if next.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn push_record(&mut self, record: ListingRecord) {
        self.records.push(record);
        self.successfully_scraped += 1;
    }

    pub fn stats(&self) -> JobStatistics {
        JobStatistics::from(self)
    }

    pub fn download_available(&self) -> bool {
        self.status == JobStatus::Completed && self.result_file.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobStatistics {
    pub total_found: usize,
    pub successfully_scraped: usize,
    pub errors: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Percentage of selected links that produced a record.
    pub success_rate: f64,
    pub duration_seconds: Option<f64>,
}

impl From<&ScrapeJob> for JobStatistics {
    fn from(job: &ScrapeJob) -> Self {
        let success_rate = if job.total_found > 0 {
            let rate = job.successfully_scraped as f64 / job.total_found as f64 * 100.0;
            (rate * 100.0).round() / 100.0
        } else {
            0.0
        };
        let duration_seconds = match (job.started_at, job.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        };
        Self {
            total_found: job.total_found,
            successfully_scraped: job.successfully_scraped,
            errors: job.errors,
            started_at: job.started_at,
            finished_at: job.completed_at,
            success_rate,
            duration_seconds,
        }
    }
}

/// Jobs by id for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<DashMap<String, ScrapeJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: ScrapeJob) {
        self.jobs.insert(job.job_id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<ScrapeJob> {
        self.jobs.get(job_id).map(|job| job.clone())
    }

    /// Apply `f` to the job in place. `None` when the id is unknown.
    pub fn update<T>(&self, job_id: &str, f: impl FnOnce(&mut ScrapeJob) -> T) -> Option<T> {
        self.jobs.get_mut(job_id).map(|mut job| f(&mut job))
    }

    pub fn remove(&self, job_id: &str) -> Option<ScrapeJob> {
        self.jobs.remove(job_id).map(|(_, job)| job)
    }

    /// Map every job without cloning its records, newest first.
    pub fn collect<T>(&self, f: impl Fn(&ScrapeJob) -> T) -> Vec<T> {
        let mut rows: Vec<(DateTime<Utc>, T)> = self
            .jobs
            .iter()
            .map(|entry| (entry.created_at, f(entry.value())))
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows.into_iter().map(|(_, row)| row).collect()
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|job| job.status == status).count()
    }
}
