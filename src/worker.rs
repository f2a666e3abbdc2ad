//! Job execution.
//!
//! Each submitted job runs on its own tokio task with its own browser
//! session: discovery once, then every listing strictly in sequence with a
//! pause between pages. Only a lost or unlaunchable session fails a job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn, Instrument};

use crate::browser::{PageError, PageSession, PageTimings, SessionLauncher};
use crate::discovery::discover_links;
use crate::extraction::{extract_listing, ExtractOptions};
use crate::jobs::{JobRegistry, JobStatus, ScrapeJob, ScrapeRequest};
use crate::listing::ListingRecord;
use crate::selectors::{self, SelectorSet};
use crate::storage::{ResultArtifact, ResultStore};
use crate::webhook::Notifier;

#[derive(Clone)]
pub struct JobRunner {
    pub registry: JobRegistry,
    pub store: ResultStore,
    launcher: Arc<dyn SessionLauncher>,
    notifier: Notifier,
    timings: PageTimings,
}

impl JobRunner {
    pub fn new(
        registry: JobRegistry,
        launcher: Arc<dyn SessionLauncher>,
        store: ResultStore,
        notifier: Notifier,
        timings: PageTimings,
    ) -> Self {
        Self {
            registry,
            store,
            launcher,
            notifier,
            timings,
        }
    }

    /// Register a pending job and start it in the background.
    pub fn submit(&self, request: ScrapeRequest) -> String {
        let job = ScrapeJob::new(request);
        let job_id = job.job_id.clone();
        info!("📥 Job {} queued for {}", job_id, job.request.url);
        self.registry.insert(job);

        let runner = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move { runner.run(&id).await });
        job_id
    }

    /// Drive one job to a terminal state.
    pub async fn run(&self, job_id: &str) {
        let span = tracing::info_span!("job", job_id = %job_id);
        self.run_inner(job_id).instrument(span).await
    }

    async fn run_inner(&self, job_id: &str) {
        let Some(request) = self.registry.get(job_id).map(|job| job.request) else {
            warn!("Job vanished before it started");
            return;
        };
        match self.registry.update(job_id, |job| job.advance(JobStatus::Running)) {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!("Not running job: {}", e);
                return;
            }
            None => return,
        }
        info!("🚀 Scraping {} for client {}", request.url, request.client_name);

        let outcome = match self.launcher.launch().await {
            Ok(mut page) => {
                let outcome = self.scrape(job_id, &request, page.as_mut()).await;
                page.close().await;
                outcome
            }
            Err(e) => Err(e),
        };

        let terminal = match &outcome {
            Ok(()) => JobStatus::Completed,
            Err(e) => {
                error!("❌ Job failed: {}", e);
                JobStatus::Failed
            }
        };
        // The terminal state and the result file become visible together.
        let Some(mut finished) = self.registry.get(job_id) else {
            warn!("Job deleted while running; results discarded");
            return;
        };
        if let Err(e) = &outcome {
            finished.error_message = Some(e.to_string());
        }
        if let Err(e) = finished.advance(terminal) {
            warn!("{}", e);
        }
        let saved = self.persist(&finished).await;
        finished.result_file = saved.as_ref().map(|path| path.to_string_lossy().to_string());

        if self.registry.update(job_id, |job| *job = finished.clone()).is_none() {
            warn!("Job deleted while running; results discarded");
            if let Some(path) = saved {
                if let Err(e) = self.store.remove(&path).await {
                    warn!("Failed to remove {}: {:#}", path.display(), e);
                }
            }
            return;
        }

        let stats = finished.stats();
        info!(
            "🏁 Job {:?}: {}/{} listings, {} errors, {:.2}% success",
            finished.status, stats.successfully_scraped, stats.total_found, stats.errors, stats.success_rate
        );

        if let Some(target) = request.webhook_callback.clone() {
            let payload = self.notifier.payload(&finished);
            self.notifier.spawn_notify(target, payload);
        }
    }

    /// Discovery followed by sequential extraction.
    async fn scrape(
        &self,
        job_id: &str,
        request: &ScrapeRequest,
        page: &mut dyn PageSession,
    ) -> Result<(), PageError> {
        let selectors = SelectorSet::resolve(request.custom_selectors.as_ref());
        let discovered = discover_links(
            page,
            &request.url,
            selectors.chain(selectors::CAR_LINKS),
            request.max_pages,
            &self.timings,
        )
        .await?;
        let total_found = discovered.total_found;
        let links = discovered.links;
        info!("🔗 {} listings selected of {} found", links.len(), total_found);
        self.registry.update(job_id, |job| job.total_found = total_found);

        if links.is_empty() {
            warn!("No listing links found on {}", request.url);
            return Ok(());
        }

        let options = request.extract_options();
        let delay = request.delay();
        for (index, link) in links.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(delay).await;
            }
            info!("📄 [{}/{}] {}", index + 1, links.len(), link);

            match extract_listing(page, link, &selectors, options, &self.timings).await {
                Ok(record) => {
                    self.registry.update(job_id, |job| job.push_record(record));
                }
                Err(e) => {
                    warn!("✗ {}: {}", link, e);
                    self.registry.update(job_id, |job| job.errors += 1);
                    if e.is_fatal() {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Completed jobs always get an artifact; failed ones only when they
    /// produced something.
    async fn persist(&self, job: &ScrapeJob) -> Option<PathBuf> {
        if job.status != JobStatus::Completed && job.records.is_empty() {
            return None;
        }
        match self.store.save(&ResultArtifact::from(job)).await {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Failed to save results: {:#}", e);
                None
            }
        }
    }

    /// Extract a single listing in a throwaway session.
    pub async fn extract_single(
        &self,
        url: &str,
        custom_selectors: Option<&HashMap<String, Vec<String>>>,
    ) -> Result<ListingRecord, PageError> {
        let selectors = SelectorSet::resolve(custom_selectors);
        let mut page = self.launcher.launch().await?;
        let result = extract_listing(page.as_mut(), url, &selectors, ExtractOptions::default(), &self.timings).await;
        page.close().await;
        result
    }
}
