mod api;
mod browser;
mod config;
mod discovery;
mod extraction;
mod jobs;
mod listing;
mod selectors;
mod storage;
mod webhook;
mod worker;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::browser::ChromeLauncher;
use crate::config::AppConfig;
use crate::jobs::JobRegistry;
use crate::storage::ResultStore;
use crate::webhook::Notifier;
use crate::worker::JobRunner;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::health,
        api::start_scrape,
        api::get_job_status,
        api::download_results,
        api::list_jobs,
        api::delete_job,
        api::test_selectors,
        api::metrics,
        api::webhook_callback,
        api::n8n_trigger,
        api::n8n_callback
    ),
    components(
        schemas(
            jobs::ScrapeRequest,
            jobs::JobStatus,
            jobs::JobStatistics,
            listing::ListingRecord,
            storage::ResultArtifact,
            api::ScrapeResponse,
            api::JobStatusResponse,
            api::JobSummary,
            api::TestSelectorsRequest,
            api::TestSelectorsResponse,
            api::HealthResponse,
            api::MetricsResponse,
            api::N8nTrigger,
            api::N8nTriggerResponse,
            api::CallbackAck,
            webhook::JobNotification
        )
    ),
    tags(
        (name = "scraper", description = "Car listing scraper API"),
        (name = "webhooks", description = "n8n trigger and callback receivers")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;
    info!("⚙️ Results directory: {}", config.data_dir.display());

    let launcher = ChromeLauncher::new(config.headless, config.chrome_path.clone());
    let runner = JobRunner::new(
        JobRegistry::new(),
        Arc::new(launcher),
        ResultStore::new(&config.data_dir),
        Notifier::new(config.public_base_url.clone())?,
        config.page_timings(),
    );

    let app = api::router(api::AppState {
        runner,
        public_base_url: config.public_base_url.clone(),
    })
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚗 Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
