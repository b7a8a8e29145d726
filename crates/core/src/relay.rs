//! Webhook relay for workflow-automation tools.
//!
//! A stateless adapter over the primary API: it renames the surface to
//! `/webhook/*`, reshapes payloads, and re-validates identifiers before
//! handing out download URLs. All job state lives in the primary service.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::client::{ApiClient, ClientError};
use crate::jobs::JobStatus;
use crate::params::{GenerationRequest, Preset};
use crate::server::AppError;

const SERVICE_NAME: &str = "vidgen webhook relay";
const DEFAULT_RELAY_PRESET: Preset = Preset::Portrait60s;
/// Advertised to callers; the primary API's own estimate is per-step.
const RELAY_ESTIMATED_SECONDS: u32 = 900;
const JOB_ID_LEN: usize = 36;
const VIDEO_URL_PREFIX: &str = "/api/videos/";
const VIDEO_URL_SUFFIX: &str = ".mp4";

#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    api: ApiClient,
    listen_port: u16,
}

impl RelayState {
    pub fn new(api_base_url: &str, listen_port: u16) -> Result<Self, ClientError> {
        Ok(Self {
            inner: Arc::new(RelayInner {
                api: ApiClient::new(api_base_url)?,
                listen_port,
            }),
        })
    }

    fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    fn api_base(&self) -> &str {
        self.inner.api.base_url().as_str().trim_end_matches('/')
    }
}

fn default_relay_preset() -> Option<String> {
    Some(DEFAULT_RELAY_PRESET.as_str().to_string())
}

/// Generation request as sent by automation tools. Explicit fields override
/// the preset, which defaults to `portrait_60s` when omitted.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayGenerateRequest {
    pub prompt: String,
    #[serde(default = "default_relay_preset")]
    pub preset: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub video_length: Option<u32>,
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub num_inference_steps: Option<u32>,
    /// Accepted for compatibility; completion callbacks are not sent.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayGenerateResponse {
    pub success: bool,
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
    pub status_url: String,
    pub estimated_time_seconds: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayStatusResponse {
    pub success: bool,
    pub job_id: String,
    pub status: JobStatus,
    pub progress_percent: f64,
    pub video_url: Option<String>,
    pub download_url: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayDownloadResponse {
    pub success: bool,
    pub job_id: String,
    pub download_url: String,
    pub message: String,
    pub instructions: String,
}

/// Translate a relay request into a primary API request: the preset supplies
/// the base values and every explicit field wins over it.
pub fn build_api_request(request: &RelayGenerateRequest) -> GenerationRequest {
    let preset_defaults = GenerationRequest {
        prompt: Some(request.prompt.clone()),
        preset: request.preset.clone(),
        ..Default::default()
    };
    let overrides = GenerationRequest {
        width: request.width,
        height: request.height,
        video_length: request.video_length,
        fps: request.fps,
        seed: request.seed,
        num_inference_steps: request.num_inference_steps,
        ..Default::default()
    };
    preset_defaults.merge_overrides(overrides)
}

/// Job ids are lowercase hyphenated UUIDs.
pub fn is_valid_job_id(job_id: &str) -> bool {
    job_id.len() == JOB_ID_LEN
        && job_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b) || b == b'-')
}

/// File name of a primary API video URL, or `None` if it is not exactly
/// `/api/videos/<hex-and-hyphens>.mp4`.
pub fn video_filename_from_url(video_url: &str) -> Option<&str> {
    let filename = video_url.strip_prefix(VIDEO_URL_PREFIX)?;
    let stem = filename.strip_suffix(VIDEO_URL_SUFFIX)?;
    let valid = !stem.is_empty()
        && stem
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b) || b == b'-');
    valid.then_some(filename)
}

fn upstream_error(err: ClientError) -> AppError {
    match err {
        ClientError::Status {
            status, message, ..
        } => AppError::Upstream(status, message),
        other => AppError::ServiceUnavailable(format!("Backend API error: {other}")),
    }
}

pub fn relay_router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/webhook/info", get(webhook_info))
        .route("/webhook/generate", post(webhook_generate))
        .route("/webhook/status/{job_id}", get(webhook_status))
        .route("/webhook/download/{job_id}", get(webhook_download))
        .route("/webhook/test", post(webhook_test))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root(State(state): State<RelayState>) -> Json<serde_json::Value> {
    let port = state.inner.listen_port;
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "backend": state.api_base(),
        "endpoints": {
            "generate": "/webhook/generate (POST)",
            "status": "/webhook/status/{job_id} (GET)",
            "download": "/webhook/download/{job_id} (GET)",
            "info": "/webhook/info (GET)",
            "test": "/webhook/test (POST)",
        },
        "setup": {
            "step_1": "Create an HTTP Request node",
            "step_2": "Set method to POST",
            "step_3": format!("Set URL to http://your-server:{port}/webhook/generate"),
            "step_4": "Set body type to JSON",
            "step_5": "Add prompt and preset to body",
            "step_6": "Poll the status endpoint until completed",
            "step_7": "Fetch the download endpoint for the video URL",
        },
    }))
}

async fn webhook_info(State(state): State<RelayState>) -> Result<Json<serde_json::Value>, AppError> {
    state.api().info().await.map(Json).map_err(|err| {
        error!(error = %err, "Failed to get API info");
        AppError::ServiceUnavailable("Backend API not available".to_string())
    })
}

async fn webhook_generate(
    State(state): State<RelayState>,
    Json(request): Json<RelayGenerateRequest>,
) -> Result<Json<RelayGenerateResponse>, AppError> {
    let api_request = build_api_request(&request);
    info!(
        preset = ?api_request.preset,
        webhook_url = ?request.webhook_url,
        "Relaying video generation request"
    );

    let created = state.api().submit(&api_request).await.map_err(|err| {
        error!(error = %err, "Failed to submit video generation");
        upstream_error(err)
    })?;

    Ok(Json(RelayGenerateResponse {
        success: true,
        status_url: format!("/webhook/status/{}", created.job_id),
        job_id: created.job_id,
        status: created.status,
        message: "Video generation started successfully".to_string(),
        estimated_time_seconds: RELAY_ESTIMATED_SECONDS,
        timestamp: Utc::now(),
    }))
}

async fn webhook_status(
    State(state): State<RelayState>,
    Path(job_id): Path<String>,
) -> Result<Json<RelayStatusResponse>, AppError> {
    let status = state.api().status(&job_id).await.map_err(|err| {
        error!(job_id = %job_id, error = %err, "Failed to get status");
        AppError::NotFound("Job not found or API unavailable".to_string())
    })?;

    let download_url = (status.status == JobStatus::Completed && status.video_url.is_some())
        .then(|| format!("/webhook/download/{}", status.job_id));

    Ok(Json(RelayStatusResponse {
        success: true,
        job_id: status.job_id,
        status: status.status,
        progress_percent: status.progress * 100.0,
        video_url: status.video_url,
        download_url,
        error: status.error,
        timestamp: Utc::now(),
    }))
}

async fn webhook_download(
    State(state): State<RelayState>,
    Path(job_id): Path<String>,
) -> Result<Json<RelayDownloadResponse>, AppError> {
    if !is_valid_job_id(&job_id) {
        return Err(AppError::BadRequest("Invalid job ID format".to_string()));
    }

    let status = state.api().status(&job_id).await.map_err(|err| {
        error!(job_id = %job_id, error = %err, "Failed to get download URL");
        upstream_error(err)
    })?;

    if status.status != JobStatus::Completed {
        return Err(AppError::BadRequest(format!(
            "Video not ready. Current status: {}",
            status.status
        )));
    }

    let video_url = status
        .video_url
        .ok_or_else(|| AppError::NotFound("Video URL not available".to_string()))?;
    if video_filename_from_url(&video_url).is_none() {
        return Err(AppError::BadRequest("Invalid video path format".to_string()));
    }

    Ok(Json(RelayDownloadResponse {
        success: true,
        download_url: format!("{}{video_url}", state.api_base()),
        job_id,
        message: "Video is ready for download".to_string(),
        instructions: "Download the video from the download_url provided".to_string(),
    }))
}

async fn webhook_test(headers: HeaderMap, body: Bytes) -> Result<Json<serde_json::Value>, AppError> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));

    let received = if is_json && !body.is_empty() {
        serde_json::from_slice::<serde_json::Value>(&body)
            .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {e}")))?
    } else {
        serde_json::json!({})
    };

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Webhook test successful!",
        "received": received,
        "timestamp": Utc::now(),
        "service": SERVICE_NAME,
    })))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use tempfile::tempdir;
    use tower::{Service, ServiceExt};

    use super::*;
    use crate::config::AppConfig;
    use crate::server::{app_router, AppState, ErrorResponse};
    use crate::test_support::{output_dir, FileEncoder, GatedSampler, SharedLoader};

    struct Harness {
        relay: Router,
        api: AppState,
        api_base: String,
        sampler: Arc<GatedSampler>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.model_root = dir.path().join("ckpts");
        config.paths.output_dir = output_dir(dir.path());
        config.model.preload = false;

        let sampler = Arc::new(GatedSampler::default());
        let api = AppState::new(
            &config,
            Arc::new(SharedLoader::new(sampler.clone())),
            Arc::new(FileEncoder),
        )
        .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_base = format!("http://{}", listener.local_addr().unwrap());
        let router = app_router(api.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let relay = relay_router(RelayState::new(&api_base, 8080).unwrap());
        Harness {
            relay,
            api,
            api_base,
            sampler,
            _dir: dir,
        }
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(resp: Response) -> T {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn relay_request(body: serde_json::Value) -> RelayGenerateRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn omitted_preset_defaults_to_portrait_60s() {
        let request = relay_request(serde_json::json!({"prompt": "a cat"}));
        let params = build_api_request(&request).resolve().unwrap();
        assert_eq!((params.width, params.height), (544, 960));
        assert_eq!((params.video_length, params.fps), (129, 24));
        assert_eq!(params.preset, Some(Preset::Portrait60s));
    }

    #[test]
    fn explicit_fields_override_the_preset() {
        let request = relay_request(serde_json::json!({
            "prompt": "a cat",
            "preset": "landscape_30s",
            "fps": 12,
            "seed": 42,
            "webhook_url": "http://automation.local/hook"
        }));
        let api_request = build_api_request(&request);
        assert_eq!(api_request.fps, Some(12));
        assert_eq!(api_request.seed, Some(42));

        let params = api_request.resolve().unwrap();
        assert_eq!((params.width, params.height, params.video_length), (960, 544, 65));
        assert_eq!(params.fps, 12);
    }

    #[test]
    fn null_preset_falls_back_to_plain_defaults() {
        let request = relay_request(serde_json::json!({"prompt": "a cat", "preset": null}));
        let params = build_api_request(&request).resolve().unwrap();
        assert_eq!((params.width, params.height), (640, 480));
        assert_eq!(params.preset, None);
    }

    #[test]
    fn job_id_and_video_url_validation() {
        assert!(is_valid_job_id("0f8fad5b-d9cb-469f-a165-70867728950e"));
        assert!(!is_valid_job_id("0F8FAD5B-D9CB-469F-A165-70867728950E"));
        assert!(!is_valid_job_id("../../etc/passwd"));
        assert!(!is_valid_job_id("0f8fad5b"));

        assert_eq!(
            video_filename_from_url("/api/videos/0f8fad5b-d9cb.mp4"),
            Some("0f8fad5b-d9cb.mp4")
        );
        assert_eq!(video_filename_from_url("https://evil.example/x.mp4"), None);
        assert_eq!(video_filename_from_url("/api/videos/../x.mp4"), None);
        assert_eq!(video_filename_from_url("/api/videos/.mp4"), None);
        assert_eq!(video_filename_from_url("/api/videos/abc.avi"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn generate_status_download_through_the_relay() {
        let mut h = harness().await;

        let resp = send_request(
            &mut h.relay,
            post_json("/webhook/generate", serde_json::json!({"prompt": "a heron"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let created: RelayGenerateResponse = read_json(resp).await;
        assert!(created.success);
        assert_eq!(created.status, JobStatus::Queued);
        assert_eq!(created.estimated_time_seconds, 900);
        assert_eq!(created.status_url, format!("/webhook/status/{}", created.job_id));

        let job = h.api.registry().status(&created.job_id).unwrap();
        assert_eq!((job.params.width, job.params.height), (544, 960));

        crate::test_support::wait_until(|| !h.sampler.started().is_empty()).await;
        let resp = send_request(&mut h.relay, get(&created.status_url)).await;
        let running: RelayStatusResponse = read_json(resp).await;
        assert_eq!(running.progress_percent, 10.0);
        assert!(running.download_url.is_none());

        let resp = send_request(&mut h.relay, get(&format!("/webhook/download/{}", created.job_id))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let err: ErrorResponse = read_json(resp).await;
        assert_eq!(err.error, "Video not ready. Current status: processing");

        h.sampler.open_all();
        let registry = h.api.registry().clone();
        let id = created.job_id.clone();
        crate::test_support::wait_until(move || {
            registry.status(&id).map(|j| j.status.is_terminal()).unwrap_or(false)
        })
        .await;

        let done: RelayStatusResponse =
            read_json(send_request(&mut h.relay, get(&created.status_url)).await).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress_percent, 100.0);
        assert_eq!(
            done.download_url,
            Some(format!("/webhook/download/{}", created.job_id))
        );

        let resp = send_request(&mut h.relay, get(&format!("/webhook/download/{}", created.job_id))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let download: RelayDownloadResponse = read_json(resp).await;
        assert_eq!(
            download.download_url,
            format!("{}/api/videos/{}.mp4", h.api_base, created.job_id)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn upstream_rejections_keep_their_status() {
        let mut h = harness().await;

        let resp = send_request(
            &mut h.relay,
            post_json(
                "/webhook/generate",
                serde_json::json!({"prompt": "a heron", "video_length": 400}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let err: ErrorResponse = read_json(resp).await;
        assert!(err.error.contains("video_length"));

        let resp = send_request(&mut h.relay, get("/webhook/status/unknown")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send_request(&mut h.relay, get("/webhook/download/not-a-uuid")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send_request(
            &mut h.relay,
            get("/webhook/download/0f8fad5b-d9cb-469f-a165-70867728950e"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unreachable_backend_is_service_unavailable() {
        let mut relay = relay_router(RelayState::new("http://127.0.0.1:9", 8080).unwrap());

        let resp = send_request(
            &mut relay,
            post_json("/webhook/generate", serde_json::json!({"prompt": "a heron"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = send_request(&mut relay, get("/webhook/info")).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn info_is_proxied_and_test_echoes() {
        let mut h = harness().await;

        let info: serde_json::Value =
            read_json(send_request(&mut h.relay, get("/webhook/info")).await).await;
        assert_eq!(info["presets"]["landscape_60s"]["width"], 960);

        let echoed: serde_json::Value = read_json(
            send_request(
                &mut h.relay,
                post_json("/webhook/test", serde_json::json!({"ping": 1})),
            )
            .await,
        )
        .await;
        assert_eq!(echoed["success"], true);
        assert_eq!(echoed["received"]["ping"], 1);

        let root: serde_json::Value = read_json(send_request(&mut h.relay, get("/")).await).await;
        assert_eq!(root["backend"], h.api_base.as_str());
    }
}
