//! HTTP server: screenshots, suite runs, run artifacts and baselines

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use visreg_common::{
    BlobRef, BlobStore, Dimensions, DriverError, Error, TargetKey, ViewportClass, ViewportSpec,
};
use visreg_engine::baseline::{BaselineHistory, BaselineStore, BaselineSummary, BaselineVersion};
use visreg_engine::compare::decoded_dimensions;
use visreg_engine::context::{RunContext, RUNS_NAMESPACE};
use visreg_engine::driver::{BrowserDriver, CaptureRequest};
use visreg_engine::orchestrator::{CaptureOrchestrator, CaptureSettings};
use visreg_engine::report::{Report, ReportSummary};
use visreg_engine::runner::{RegressionRunner, RunFilter, RunOptions, REPORT_FILE};
use visreg_engine::suite::{join_url, SuiteConfig};

/// Namespace for ad-hoc screenshots when the caller names none
pub const DEFAULT_SCREENSHOT_NAMESPACE: &str = "screenshots";

/// Web server configuration
#[derive(Debug, Clone)]
pub struct WebServerConfig {
    /// Suite served by `/api/suite/run`; runs are refused without one
    pub suite: Option<SuiteConfig>,
    /// Base for screenshot paths that are not absolute URLs
    pub base_url: String,
    pub capture_timeout: Duration,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            suite: None,
            base_url: "http://127.0.0.1:8000".to_string(),
            capture_timeout: Duration::from_secs(30),
        }
    }
}

struct AppState {
    runner: Option<RegressionRunner>,
    capture: CaptureOrchestrator,
    blobs: Arc<dyn BlobStore>,
    baselines: Arc<BaselineStore>,
    base_url: String,
}

/// The HTTP surface over one blob store and one browser driver
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(
        cfg: WebServerConfig,
        driver: Arc<dyn BrowserDriver>,
        blobs: Arc<dyn BlobStore>,
    ) -> visreg_common::Result<Self> {
        let baselines = Arc::new(BaselineStore::new(blobs.clone()));
        let runner = cfg
            .suite
            .map(|suite| {
                RegressionRunner::new(suite, driver.clone(), blobs.clone(), baselines.clone())
            })
            .transpose()?;
        let capture = CaptureOrchestrator::new(
            driver,
            blobs.clone(),
            CaptureSettings {
                concurrency: 1,
                timeout: cfg.capture_timeout,
                ..Default::default()
            },
        )?;

        Ok(Self {
            state: Arc::new(AppState {
                runner,
                capture,
                blobs,
                baselines,
                base_url: cfg.base_url,
            }),
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/api/screenshots", post(screenshot_handler))
            .route("/api/suite/run", post(run_suite_handler))
            .route("/api/runs", get(list_runs_handler))
            .route("/api/runs/:run_id/report", get(run_report_handler))
            .route("/api/runs/:run_id/artifacts/*key", get(run_artifact_handler))
            .route("/api/baselines", get(list_baselines_handler))
            .route("/api/baselines/:page/:viewport/history", get(baseline_history_handler))
            .route("/api/baselines/:page/:viewport/rollback", post(baseline_rollback_handler))
            .route("/api/baselines/:page/:viewport/prune", post(baseline_prune_handler))
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!("visreg web starting on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

/// Start the server on `addr`
pub async fn serve(
    addr: SocketAddr,
    cfg: WebServerConfig,
    driver: Arc<dyn BrowserDriver>,
    blobs: Arc<dyn BlobStore>,
) -> anyhow::Result<()> {
    let server = WebServer::new(cfg, driver, blobs)?;
    server.serve(addr).await
}

// ============================================================================
// Errors
// ============================================================================

/// Engine error rendered as a JSON body with a matching status code
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidConfig(_) | Error::InvalidKey(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::DriverUnavailable(_) | Error::Driver(DriverError::Unavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Driver(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "visreg-web",
        "version": visreg_common::VERSION,
    }))
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScreenshotRequest {
    /// Absolute URL or a path on the configured base URL
    pub url: String,
    #[serde(default)]
    pub viewport: Option<ViewportClass>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default = "default_true")]
    pub full_page: bool,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Key prefix for the stored image
    #[serde(default)]
    pub name: Option<String>,
}

impl ScreenshotRequest {
    fn viewport(&self) -> Result<ViewportSpec, Error> {
        let class = self.viewport.unwrap_or(ViewportClass::Desktop);
        match (self.width, self.height) {
            (None, None) => Ok(ViewportSpec::preset(class)),
            (Some(width), Some(height)) if width > 0 && height > 0 => {
                Ok(ViewportSpec::new(class, width, height))
            }
            _ => Err(Error::InvalidConfig(
                "width and height must be given together and be positive".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotResponse {
    pub blob: BlobRef,
    pub url: String,
    pub viewport: ViewportSpec,
    pub dimensions: Dimensions,
    pub digest: String,
    pub attempts: u32,
    pub captured_at: DateTime<Utc>,
}

async fn screenshot_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScreenshotRequest>,
) -> ApiResult<Json<ScreenshotResponse>> {
    if req.url.trim().is_empty() {
        return Err(Error::InvalidConfig("url is empty".to_string()).into());
    }
    let viewport = req.viewport()?;
    let url = join_url(&state.base_url, &req.url);

    let request = CaptureRequest {
        url: url.clone(),
        width: viewport.width,
        height: viewport.height,
        full_page: req.full_page,
        timeout: state.capture.settings().timeout,
    };
    let (result, attempts) = state.capture.capture_with_retry(&request).await;
    let bytes = result.map_err(|e| match e {
        DriverError::Unavailable(msg) => Error::DriverUnavailable(msg),
        other => Error::Driver(other),
    })?;
    let dimensions = decoded_dimensions(&bytes).map_err(|e| {
        Error::Driver(DriverError::Crashed(format!("driver returned an undecodable image: {}", e)))
    })?;

    let captured_at = Utc::now();
    let namespace = req
        .namespace
        .as_deref()
        .unwrap_or(DEFAULT_SCREENSHOT_NAMESPACE);
    let key = format!(
        "{}/{}-{}-{}.png",
        req.name.as_deref().unwrap_or("capture"),
        viewport.class,
        captured_at.format("%Y%m%dT%H%M%S%3fZ"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    );
    let blob = state.blobs.put(namespace, &key, &bytes).await?;

    info!("Captured {} at {} into {}", url, viewport.class, blob);
    Ok(Json(ScreenshotResponse {
        blob,
        url,
        viewport,
        dimensions,
        digest: visreg_common::blob::digest(&bytes),
        attempts,
        captured_at,
    }))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub update_baselines: bool,
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub viewports: Vec<ViewportClass>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub clean: bool,
    pub report: Report,
}

async fn run_suite_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunRequest>,
) -> ApiResult<Json<RunResponse>> {
    if state.runner.is_none() {
        return Err(Error::InvalidConfig("no suite configured (set VISREG_SUITE)".to_string()).into());
    }
    let options = RunOptions {
        update_baselines: req.update_baselines,
        filter: RunFilter {
            page: req.page,
            viewports: req.viewports,
        },
    };

    // A dropped request cancels the run; the task still settles and
    // persists whatever completed
    let ctx = RunContext::new();
    let _cancel_on_drop = ctx.cancellation().clone().drop_guard();
    let task_state = state.clone();
    let run = tokio::spawn(async move {
        match &task_state.runner {
            Some(runner) => runner.run(&ctx, &options).await,
            None => Err(Error::Internal("suite runner disappeared".to_string())),
        }
    })
    .await
    .map_err(|e| Error::Internal(format!("run task failed: {}", e)))??;

    let report = Report::generate(&run);
    Ok(Json(RunResponse {
        clean: run.is_clean(),
        report,
    }))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListing {
    pub run_id: String,
    pub suite: String,
    pub started_at: DateTime<Utc>,
    pub clean: bool,
    pub cancelled: bool,
    pub summary: ReportSummary,
}

async fn load_report(state: &AppState, run_id: &str) -> Result<Report, Error> {
    let namespace = format!("{}/{}", RUNS_NAMESPACE, run_id);
    let bytes = state
        .blobs
        .get(&namespace, REPORT_FILE)
        .await?
        .ok_or_else(|| Error::not_found("run", run_id))?;
    Report::from_json(&String::from_utf8_lossy(&bytes))
}

async fn list_runs_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<RunListing>>> {
    let keys = state.blobs.list(RUNS_NAMESPACE, "").await?;
    let suffix = format!("/{}", REPORT_FILE);

    let mut runs = Vec::new();
    for run_id in keys.iter().filter_map(|k| k.strip_suffix(suffix.as_str())) {
        if run_id.contains('/') {
            continue;
        }
        match load_report(&state, run_id).await {
            Ok(report) => runs.push(RunListing {
                run_id: report.run_id,
                suite: report.suite,
                started_at: report.started_at,
                clean: report.clean,
                cancelled: report.cancelled,
                summary: report.summary,
            }),
            Err(e) => warn!("Skipping unreadable report for run {}: {}", run_id, e),
        }
    }
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(Json(runs))
}

async fn run_report_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Report>> {
    Ok(Json(load_report(&state, &run_id).await?))
}

async fn run_artifact_handler(
    State(state): State<Arc<AppState>>,
    Path((run_id, key)): Path<(String, String)>,
) -> ApiResult<Response> {
    let namespace = format!("{}/{}", RUNS_NAMESPACE, run_id);
    let key = key.trim_start_matches('/');
    let bytes = state
        .blobs
        .get(&namespace, key)
        .await?
        .ok_or_else(|| Error::not_found("artifact", format!("{}/{}", namespace, key)))?;

    let content_type = if key.ends_with(".png") {
        "image/png"
    } else if key.ends_with(".json") {
        "application/json"
    } else {
        "application/octet-stream"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

async fn list_baselines_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<BaselineSummary>>> {
    Ok(Json(state.baselines.list().await?))
}

fn baseline_key(page: &str, viewport: &str) -> Result<TargetKey, Error> {
    Ok(TargetKey::new(page, viewport.parse::<ViewportClass>()?))
}

async fn baseline_history_handler(
    State(state): State<Arc<AppState>>,
    Path((page, viewport)): Path<(String, String)>,
) -> ApiResult<Json<BaselineHistory>> {
    let key = baseline_key(&page, &viewport)?;
    Ok(Json(state.baselines.history(&key).await?))
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub version: u32,
}

async fn baseline_rollback_handler(
    State(state): State<Arc<AppState>>,
    Path((page, viewport)): Path<(String, String)>,
    Json(req): Json<RollbackRequest>,
) -> ApiResult<Json<BaselineVersion>> {
    let key = baseline_key(&page, &viewport)?;
    Ok(Json(state.baselines.rollback(&key, req.version).await?))
}

#[derive(Debug, Deserialize)]
pub struct PruneRequest {
    pub keep_last: usize,
}

async fn baseline_prune_handler(
    State(state): State<Arc<AppState>>,
    Path((page, viewport)): Path<(String, String)>,
    Json(req): Json<PruneRequest>,
) -> ApiResult<impl IntoResponse> {
    let key = baseline_key(&page, &viewport)?;
    let removed = state.baselines.prune(&key, req.keep_last).await?;
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "key": key.to_string(), "removed": removed })),
    ))
}
