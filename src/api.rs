use std::collections::HashMap;
use std::path::Path as FsPath;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::jobs::{default_delay, default_max_pages, JobStatistics, JobStatus, ScrapeRequest};
use crate::listing::ListingRecord;
use crate::storage::ResultArtifact;
use crate::webhook::JobNotification;
use crate::worker::JobRunner;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub runner: JobRunner,
    /// Absolute prefix for links handed to n8n. Empty keeps them relative.
    pub public_base_url: String,
}

impl AppState {
    fn link(&self, path: &str) -> String {
        format!("{}{}", self.public_base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(e) => {
                error!("Request failed: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ScrapeResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub client_name: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub stats: JobStatistics,
    pub error_message: Option<String>,
    pub download_available: bool,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct JobSummary {
    pub job_id: String,
    pub client_name: String,
    pub url: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub total_cars: usize,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct TestSelectorsRequest {
    /// A single listing page.
    pub url: String,
    #[serde(default)]
    pub custom_selectors: HashMap<String, Vec<String>>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct TestSelectorsResponse {
    pub success: bool,
    pub data: Option<ListingRecord>,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub active_jobs: usize,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct MetricsResponse {
    pub total_jobs: usize,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub total_cars_scraped: usize,
    /// Mean success rate over jobs that found at least one link.
    pub average_success_rate: f64,
}

fn default_n8n_client() -> String {
    "n8n_trigger".to_string()
}

/// Trigger body sent by an n8n workflow.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct N8nTrigger {
    pub url: Option<String>,
    #[serde(default = "default_n8n_client")]
    pub client_name: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Seconds between listing pages.
    #[serde(default = "default_delay")]
    pub delay: f64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct N8nTriggerResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub n8n_integration: bool,
    pub monitor_url: String,
    pub download_url: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct CallbackAck {
    pub received: bool,
    pub job_id: Option<String>,
    pub status: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/scrape", post(start_scrape))
        .route("/job/:job_id", get(get_job_status).delete(delete_job))
        .route("/download/:job_id", get(download_results))
        .route("/jobs", get(list_jobs))
        .route("/test-selectors", post(test_selectors))
        .route("/metrics", get(metrics))
        .route("/webhook/callback", post(webhook_callback))
        .route("/webhook/n8n", post(n8n_trigger))
        .route("/webhook/n8n/callback", post(n8n_callback))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Car listing scraper",
        "version": VERSION,
        "endpoints": {
            "scrape": "POST /scrape",
            "status": "GET /job/{job_id}",
            "download": "GET /download/{job_id}",
            "jobs": "GET /jobs",
            "delete": "DELETE /job/{job_id}",
            "test_selectors": "POST /test-selectors",
            "metrics": "GET /metrics",
            "n8n": "POST /webhook/n8n",
            "health": "GET /health",
            "docs": "GET /swagger-ui"
        }
    }))
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "scraper"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        version: VERSION.to_string(),
        active_jobs: state.runner.registry.count_with_status(JobStatus::Running),
    })
}

#[utoipa::path(
    post,
    path = "/scrape",
    request_body = ScrapeRequest,
    responses(
        (status = 200, description = "Job accepted", body = ScrapeResponse),
        (status = 400, description = "Request rejected")
    ),
    tag = "scraper"
)]
pub async fn start_scrape(
    State(state): State<AppState>,
    Json(request): Json<ScrapeRequest>,
) -> Result<Json<ScrapeResponse>, ApiError> {
    request.validate().map_err(ApiError::BadRequest)?;
    let url = request.url.clone();
    let job_id = state.runner.submit(request);
    info!("🎯 Scrape requested for {} ({})", url, job_id);

    Ok(Json(ScrapeResponse {
        job_id,
        status: JobStatus::Pending,
        message: format!("Scraping started for {}", url),
    }))
}

#[utoipa::path(
    get,
    path = "/job/{job_id}",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job state", body = JobStatusResponse),
        (status = 404, description = "Unknown job")
    ),
    tag = "scraper"
)]
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state
        .runner
        .registry
        .get(&job_id)
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", job_id)))?;

    Ok(Json(JobStatusResponse {
        job_id: job.job_id.clone(),
        status: job.status,
        client_name: job.request.client_name.clone(),
        url: job.request.url.clone(),
        created_at: job.created_at,
        stats: job.stats(),
        error_message: job.error_message.clone(),
        download_available: job.download_available(),
    }))
}

#[utoipa::path(
    get,
    path = "/download/{job_id}",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Result artifact", body = ResultArtifact),
        (status = 400, description = "Job not completed"),
        (status = 404, description = "Unknown job or missing file")
    ),
    tag = "scraper"
)]
pub async fn download_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ResultArtifact>, ApiError> {
    let job = state
        .runner
        .registry
        .get(&job_id)
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", job_id)))?;

    if job.status != JobStatus::Completed {
        return Err(ApiError::BadRequest("Job not completed yet".to_string()));
    }
    let path = job
        .result_file
        .ok_or_else(|| ApiError::BadRequest("No results available".to_string()))?;

    let artifact = state
        .runner
        .store
        .load(FsPath::new(&path))
        .await?
        .ok_or_else(|| ApiError::NotFound("Result file not found".to_string()))?;
    Ok(Json(artifact))
}

#[utoipa::path(
    get,
    path = "/jobs",
    responses((status = 200, description = "All jobs, newest first", body = Vec<JobSummary>)),
    tag = "scraper"
)]
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSummary>> {
    Json(state.runner.registry.collect(|job| JobSummary {
        job_id: job.job_id.clone(),
        client_name: job.request.client_name.clone(),
        url: job.request.url.clone(),
        status: job.status,
        created_at: job.created_at,
        total_cars: job.successfully_scraped,
    }))
}

#[utoipa::path(
    delete,
    path = "/job/{job_id}",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job and its results removed"),
        (status = 404, description = "Unknown job")
    ),
    tag = "scraper"
)]
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .runner
        .registry
        .remove(&job_id)
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", job_id)))?;

    if let Some(path) = &job.result_file {
        state.runner.store.remove(FsPath::new(path)).await?;
    }
    info!("🗑️ Job {} deleted", job_id);
    Ok(Json(json!({ "message": format!("Job {} deleted", job_id) })))
}

#[utoipa::path(
    post,
    path = "/test-selectors",
    request_body = TestSelectorsRequest,
    responses((status = 200, description = "Extraction outcome", body = TestSelectorsResponse)),
    tag = "scraper"
)]
pub async fn test_selectors(
    State(state): State<AppState>,
    Json(request): Json<TestSelectorsRequest>,
) -> Json<TestSelectorsResponse> {
    let custom = (!request.custom_selectors.is_empty()).then_some(&request.custom_selectors);
    match state.runner.extract_single(&request.url, custom).await {
        Ok(record) => Json(TestSelectorsResponse {
            success: true,
            data: Some(record),
            error: None,
        }),
        Err(e) => Json(TestSelectorsResponse {
            success: false,
            data: None,
            error: Some(e.to_string()),
        }),
    }
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Aggregate job metrics", body = MetricsResponse)),
    tag = "scraper"
)]
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    let rows = state
        .runner
        .registry
        .collect(|job| (job.status, job.successfully_scraped, job.total_found, job.stats().success_rate));

    let count = |status: JobStatus| rows.iter().filter(|row| row.0 == status).count();
    let rates: Vec<f64> = rows.iter().filter(|row| row.2 > 0).map(|row| row.3).collect();
    let average_success_rate = if rates.is_empty() {
        0.0
    } else {
        let mean = rates.iter().sum::<f64>() / rates.len() as f64;
        (mean * 100.0).round() / 100.0
    };

    Json(MetricsResponse {
        total_jobs: rows.len(),
        pending_jobs: count(JobStatus::Pending),
        running_jobs: count(JobStatus::Running),
        completed_jobs: count(JobStatus::Completed),
        failed_jobs: count(JobStatus::Failed),
        total_cars_scraped: rows.iter().map(|row| row.1).sum(),
        average_success_rate,
    })
}

#[utoipa::path(
    post,
    path = "/webhook/callback",
    request_body = JobNotification,
    responses((status = 200, description = "Notification logged")),
    tag = "webhooks"
)]
pub async fn webhook_callback(Json(body): Json<Value>) -> Json<Value> {
    let job_id = body["job_id"].as_str().unwrap_or("?");
    match body["status"].as_str() {
        Some("completed") => info!(
            "📞 Job {} completed: {} cars, stats {}",
            job_id, body["total_cars"], body["stats"]
        ),
        status => info!("📞 Callback for job {}: {:?}", job_id, status),
    }
    Json(json!({ "message": "Callback received" }))
}

#[utoipa::path(
    post,
    path = "/webhook/n8n",
    request_body = N8nTrigger,
    responses(
        (status = 200, description = "Job accepted", body = N8nTriggerResponse),
        (status = 400, description = "Request rejected")
    ),
    tag = "webhooks"
)]
pub async fn n8n_trigger(
    State(state): State<AppState>,
    Json(trigger): Json<N8nTrigger>,
) -> Result<Json<N8nTriggerResponse>, ApiError> {
    let url = trigger
        .url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::BadRequest("url is required".to_string()))?;

    let mut request = ScrapeRequest::new(url);
    request.client_name = trigger.client_name;
    request.max_pages = trigger.max_pages;
    request.delay_between_requests = trigger.delay;
    if state.public_base_url.is_empty() {
        warn!("PUBLIC_BASE_URL unset; n8n job runs without a callback");
    } else {
        request.webhook_callback = Some(state.link("/webhook/n8n/callback"));
    }
    request.validate().map_err(ApiError::BadRequest)?;

    let job_id = state.runner.submit(request);
    info!("🔔 n8n triggered job {}", job_id);

    Ok(Json(N8nTriggerResponse {
        monitor_url: state.link(&format!("/job/{job_id}")),
        download_url: state.link(&format!("/download/{job_id}")),
        job_id,
        status: JobStatus::Pending,
        n8n_integration: true,
    }))
}

#[utoipa::path(
    post,
    path = "/webhook/n8n/callback",
    request_body = JobNotification,
    responses((status = 200, description = "Acknowledgement for n8n", body = CallbackAck)),
    tag = "webhooks"
)]
pub async fn n8n_callback(Json(body): Json<Value>) -> Json<CallbackAck> {
    info!("📨 n8n callback: {}", body);
    Json(CallbackAck {
        received: true,
        job_id: body["job_id"].as_str().map(str::to_string),
        status: body["status"].as_str().map(str::to_string),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::PageTimings;
    use crate::jobs::JobRegistry;
    use crate::storage::ResultStore;
    use crate::testing::{fast_timings, FakeLauncher, FakePage};
    use crate::webhook::Notifier;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const INDEX: &str = "https://loja.example.com/estoque";
    const LISTING: &str = "https://loja.example.com/veiculo/1";

    fn setup_test_app() -> (Router, JobRunner, TempDir) {
        let page = FakePage::new()
            .with_page(INDEX, r#"<html><body><a href="/veiculo/1">Gol</a></body></html>"#)
            .with_page(
                LISTING,
                r#"<html><body><h1>Volkswagen Gol</h1><span class="preco">R$ 39.900</span></body></html>"#,
            );
        let dir = tempfile::tempdir().unwrap();
        let timings: PageTimings = fast_timings();
        let runner = JobRunner::new(
            JobRegistry::new(),
            Arc::new(FakeLauncher::new(page)),
            ResultStore::new(dir.path()),
            Notifier::new("").unwrap(),
            timings,
        );
        let app = router(AppState {
            runner: runner.clone(),
            public_base_url: "http://scraper.test/".to_string(),
        });
        (app, runner, dir)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn wait_for_terminal(runner: &JobRunner, job_id: &str) {
        for _ in 0..100 {
            if runner.registry.get(job_id).map_or(true, |job| job.status.is_terminal()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {job_id} never finished");
    }

    #[tokio::test]
    async fn health_and_root() {
        let (app, _runner, _dir) = setup_test_app();

        let (status, json) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["active_jobs"], 0);

        let (status, json) = send(&app, "GET", "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["endpoints"]["scrape"], "POST /scrape");
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let (app, runner, _dir) = setup_test_app();
        let (status, json) = send(&app, "POST", "/scrape", Some(json!({ "url": "not-a-url" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].as_str().unwrap().contains("invalid url"));
        assert!(runner.registry.collect(|job| job.job_id.clone()).is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let (app, _runner, _dir) = setup_test_app();
        for (method, uri) in [("GET", "/job/nope"), ("GET", "/download/nope"), ("DELETE", "/job/nope")] {
            let (status, _) = send(&app, method, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scrape_lifecycle() {
        let (app, runner, _dir) = setup_test_app();

        let (status, json) = send(
            &app,
            "POST",
            "/scrape",
            Some(json!({ "url": INDEX, "client_name": "acme", "delay_between_requests": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "pending");
        let job_id = json["job_id"].as_str().unwrap().to_string();

        wait_for_terminal(&runner, &job_id).await;

        let (status, json) = send(&app, "GET", &format!("/job/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "completed");
        assert_eq!(json["download_available"], true);
        assert_eq!(json["stats"]["successfully_scraped"], 1);
        assert_eq!(json["stats"]["success_rate"], 100.0);

        let (status, json) = send(&app, "GET", &format!("/download/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["client_name"], "acme");
        assert_eq!(json["cars"][0]["price"], "R$ 39.900");
        assert_eq!(json["cars"][0]["brand"], "VOLKSWAGEN");

        let (_, json) = send(&app, "GET", "/jobs", None).await;
        assert_eq!(json[0]["job_id"], job_id);
        assert_eq!(json[0]["total_cars"], 1);

        let (_, json) = send(&app, "GET", "/metrics", None).await;
        assert_eq!(json["total_jobs"], 1);
        assert_eq!(json["completed_jobs"], 1);
        assert_eq!(json["total_cars_scraped"], 1);
        assert_eq!(json["average_success_rate"], 100.0);

        let result_file = runner.registry.get(&job_id).unwrap().result_file.unwrap();
        let (status, _) = send(&app, "DELETE", &format!("/job/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!std::path::Path::new(&result_file).exists());

        let (status, _) = send(&app, "GET", &format!("/job/{job_id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn download_before_completion_is_400() {
        let (app, runner, _dir) = setup_test_app();
        let job = crate::jobs::ScrapeJob::new(ScrapeRequest::new(INDEX));
        let job_id = job.job_id.clone();
        runner.registry.insert(job);

        let (status, json) = send(&app, "GET", &format!("/download/{job_id}"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["detail"], "Job not completed yet");
    }

    #[tokio::test(start_paused = true)]
    async fn selector_test_endpoint() {
        let (app, _runner, _dir) = setup_test_app();

        let (status, json) = send(
            &app,
            "POST",
            "/test-selectors",
            Some(json!({ "url": LISTING, "custom_selectors": { "seller": [".loja"] } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["title"], "Volkswagen Gol");

        let (_, json) = send(
            &app,
            "POST",
            "/test-selectors",
            Some(json!({ "url": "https://loja.example.com/veiculo/404" })),
        )
        .await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn n8n_trigger_submits_with_callback() {
        let (app, runner, _dir) = setup_test_app();

        let (status, json) = send(
            &app,
            "POST",
            "/webhook/n8n",
            Some(json!({ "url": INDEX, "max_pages": 5, "delay": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["n8n_integration"], true);
        let job_id = json["job_id"].as_str().unwrap().to_string();
        assert_eq!(json["monitor_url"], format!("http://scraper.test/job/{job_id}"));
        assert_eq!(json["download_url"], format!("http://scraper.test/download/{job_id}"));

        let job = runner.registry.get(&job_id).unwrap();
        assert_eq!(job.request.client_name, "n8n_trigger");
        assert_eq!(job.request.max_pages, 5);
        assert_eq!(
            job.request.webhook_callback.as_deref(),
            Some("http://scraper.test/webhook/n8n/callback")
        );

        wait_for_terminal(&runner, &job_id).await;
        assert_eq!(runner.registry.get(&job_id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn n8n_trigger_requires_url() {
        let (app, runner, _dir) = setup_test_app();

        let (status, json) = send(&app, "POST", "/webhook/n8n", Some(json!({ "client_name": "x" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["detail"], "url is required");
        assert!(runner.registry.collect(|job| job.job_id.clone()).is_empty());
    }

    #[tokio::test]
    async fn callback_receivers_acknowledge() {
        let (app, _runner, _dir) = setup_test_app();
        let notification = json!({ "job_id": "abc", "status": "completed", "total_cars": 3, "stats": {} });

        let (status, json) = send(&app, "POST", "/webhook/callback", Some(notification.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Callback received");

        let (status, json) = send(&app, "POST", "/webhook/n8n/callback", Some(notification)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["received"], true);
        assert_eq!(json["job_id"], "abc");
        assert_eq!(json["status"], "completed");
        assert!(json["timestamp"].as_str().is_some());
    }
}
