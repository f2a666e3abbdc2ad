use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::jobs::{JobStatistics, JobStatus, ScrapeJob};
use crate::listing::ListingRecord;

/// The JSON document written for every finished job.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResultArtifact {
    pub job_id: String,
    pub client_name: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub status: JobStatus,
    pub stats: JobStatistics,
    pub cars: Vec<ListingRecord>,
}

impl From<&ScrapeJob> for ResultArtifact {
    fn from(job: &ScrapeJob) -> Self {
        Self {
            job_id: job.job_id.clone(),
            client_name: job.request.client_name.clone(),
            url: job.request.url.clone(),
            timestamp: Utc::now(),
            status: job.status,
            stats: job.stats(),
            cars: job.records.clone(),
        }
    }
}

/// Result artifacts as pretty JSON files under one directory.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn save(&self, artifact: &ResultArtifact) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let short_id: String = artifact.job_id.chars().take(8).collect();
        let file_name = format!(
            "scrape_{}_{}_{}.json",
            file_safe(&artifact.client_name),
            artifact.timestamp.format("%Y%m%d_%H%M%S"),
            short_id
        );
        let path = self.dir.join(file_name);

        let body = serde_json::to_vec_pretty(artifact)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        info!("💾 Results saved: {} ({} cars)", path.display(), artifact.cars.len());
        Ok(path)
    }

    /// `Ok(None)` when the file is gone.
    pub async fn load(&self, path: &Path) -> Result<Option<ResultArtifact>> {
        let body = match tokio::fs::read(path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let artifact = serde_json::from_slice(&body)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(artifact))
    }

    pub async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Result file already gone: {}", path.display());
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
}

fn file_safe(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}
