use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::backend::{Encoder, FfmpegEncoder, ModelLoader, ProcessModelLoader};
use crate::config::AppConfig;
use crate::jobs::{JobRecord, JobRegistry, JobStatus, RegistryError, DEFAULT_LIST_LIMIT};
use crate::model::{ModelGuard, ModelState};
use crate::params::{
    GenerationParams, GenerationRequest, Preset, DEFAULT_INFERENCE_STEPS, ESTIMATED_SECONDS_PER_STEP,
    FPS_RANGE, INFERENCE_STEPS_RANGE, RESOLUTION_RANGE, VIDEO_LENGTH_RANGE,
};

const SERVICE_NAME: &str = "vidgen";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: JobRegistry,
    started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire the registry and model guard for `config`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: &AppConfig,
        loader: Arc<dyn ModelLoader>,
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self> {
        let model = Arc::new(ModelGuard::new(loader, config.paths.model_root.clone()));
        let registry = JobRegistry::new(
            model,
            encoder,
            config.paths.output_dir.clone(),
            config.workers.effective_pool_size(),
        )?;

        Ok(Self {
            inner: Arc::new(AppStateInner {
                registry,
                started_at: Utc::now(),
            }),
        })
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn model(&self) -> &Arc<ModelGuard> {
        self.inner.registry.model()
    }

    /// Load the model on a blocking thread without holding up startup.
    pub fn start_background_warmup(&self) {
        let model = Arc::clone(self.model());
        tokio::task::spawn_blocking(move || {
            if let Err(err) = model.ensure_ready() {
                warn!(reason = %err.reason, "Background model warmup failed");
            }
        });
    }
}

/// Production state: subprocess sampler and FFmpeg encoder from `config`.
pub fn app_state_with_config(config: &AppConfig) -> Result<AppState> {
    let loader = ProcessModelLoader::new(
        config.model.sampler_program.clone(),
        config.model.sampler_args.clone(),
    );
    let encoder = FfmpegEncoder::new(config.model.encoder_program.clone());
    AppState::new(config, Arc::new(loader), Arc::new(encoder))
}

// ─── Responses ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
    pub check_status_url: String,
    pub estimated_time: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub video_url: Option<String>,
    pub error: Option<String>,
    pub estimated_time: u32,
    pub request: GenerationParams,
}

impl From<JobRecord> for JobStatusResponse {
    fn from(job: JobRecord) -> Self {
        Self {
            video_url: job.video_url(),
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            created_at: job.created_at,
            updated_at: job.updated_at,
            error: job.error,
            estimated_time: job.estimated_seconds,
            request: job.params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub total: usize,
    pub jobs: Vec<JobStatusResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub message: String,
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkersSummary {
    pub size: usize,
    pub busy: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub model_state: ModelState,
    pub error: Option<String>,
    pub active_jobs: usize,
    pub total_jobs: usize,
    pub workers: WorkersSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WarmupResponse {
    pub status: String,
    pub model_state: ModelState,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/api/info", get(info))
        .route("/api/generate", post(generate))
        .route("/api/status/{job_id}", get(job_status))
        .route("/api/videos/{filename}", get(get_video))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{job_id}", delete(delete_job))
        .route("/api/warmup", post(warmup))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "started_at": state.inner.started_at,
        "description": "Text-to-video generation job queue",
        "endpoints": {
            "health": "/health",
            "info": "/api/info",
            "generate": "/api/generate",
            "status": "/api/status/{job_id}",
            "video": "/api/videos/{filename}",
            "jobs": "/api/jobs",
            "warmup": "/api/warmup",
        },
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.registry();
    let model_state = state.model().state();
    let status = match model_state {
        ModelState::Ready => "healthy",
        ModelState::Failed => "unhealthy",
        ModelState::Uninitialized | ModelState::Initializing => "initializing",
    };

    Json(HealthResponse {
        status: status.to_string(),
        model_loaded: model_state == ModelState::Ready,
        model_state,
        error: state.model().failure().map(|err| err.reason),
        active_jobs: registry.active_count(),
        total_jobs: registry.total_count(),
        workers: WorkersSummary {
            size: registry.pool_size(),
            busy: registry.busy_workers(),
        },
    })
}

async fn info() -> Json<serde_json::Value> {
    let presets: serde_json::Map<String, serde_json::Value> = Preset::ALL
        .iter()
        .map(|preset| {
            let bundle = preset.bundle();
            (
                preset.as_str().to_string(),
                serde_json::json!({
                    "width": bundle.width,
                    "height": bundle.height,
                    "video_length": bundle.video_length,
                    "fps": bundle.fps,
                    "num_inference_steps": bundle.num_inference_steps,
                }),
            )
        })
        .collect();

    Json(serde_json::json!({
        "model": "HunyuanVideo",
        "deployment": "CPU inference behind a job queue",
        "supported_resolutions": {
            "min": RESOLUTION_RANGE.start(),
            "max": RESOLUTION_RANGE.end(),
            "low": "480x360 (4:3)",
            "medium": "640x480 (4:3)",
            "high": "960x544 (16:9)",
            "recommended": "640x480 for CPU deployment",
        },
        "video_length": {
            "min_frames": VIDEO_LENGTH_RANGE.start(),
            "max_frames": VIDEO_LENGTH_RANGE.end(),
            "recommended_60sec_15fps": 61,
            "note": "Lower frame counts generate faster on CPU",
        },
        "fps": {
            "min": FPS_RANGE.start(),
            "max": FPS_RANGE.end(),
            "options": [8, 15, 24, 30],
        },
        "inference_steps": {
            "min": INFERENCE_STEPS_RANGE.start(),
            "max": INFERENCE_STEPS_RANGE.end(),
            "recommended_cpu": DEFAULT_INFERENCE_STEPS,
            "note": "Lower steps = faster generation but lower quality",
        },
        "presets": presets,
        "estimated_generation_time": {
            "seconds_per_step": ESTIMATED_SECONDS_PER_STEP,
            "note": "Advisory only; actual time varies with resolution and load",
        },
    }))
}

async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerateResponse>, AppError> {
    let job = state.registry().submit(&request)?;

    Ok(Json(GenerateResponse {
        check_status_url: format!("/api/status/{}", job.id),
        job_id: job.id,
        status: job.status,
        message: "Video generation job submitted successfully".to_string(),
        estimated_time: job.estimated_seconds,
    }))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let job = state.registry().status(&job_id)?;
    Ok(Json(job.into()))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, AppError> {
    let filter = query
        .status
        .as_deref()
        .map(str::trim)
        .filter(|status| !status.is_empty())
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let jobs: Vec<JobStatusResponse> = state
        .registry()
        .list(filter, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .into_iter()
        .map(JobStatusResponse::from)
        .collect();

    Ok(Json(JobListResponse {
        total: jobs.len(),
        jobs,
    }))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    state.registry().delete(&job_id)?;
    Ok(Json(DeleteResponse {
        message: "Job deleted successfully".to_string(),
        job_id,
    }))
}

async fn get_video(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let not_found = || AppError::NotFound(format!("video not found: {filename}"));
    let path = state.registry().artifact_path(&filename).ok_or_else(not_found)?;

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(err) => return Err(AppError::Internal(format!("failed to open video: {err}"))),
    };
    let metadata = file
        .metadata()
        .await
        .map_err(|e| AppError::Internal(format!("failed to stat video: {e}")))?;
    if !metadata.is_file() {
        return Err(not_found());
    }

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CONTENT_LENGTH, metadata.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{filename}\""),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| AppError::Internal(format!("failed to build video response: {e}")))
}

async fn warmup(State(state): State<AppState>) -> Result<Json<WarmupResponse>, AppError> {
    let model = Arc::clone(state.model());
    let outcome = tokio::task::spawn_blocking(move || model.ensure_ready().map(|_| ()))
        .await
        .map_err(|e| AppError::Internal(format!("warmup task failed: {e}")))?;

    match outcome {
        Ok(()) => {
            info!("Model warmed up on request");
            Ok(Json(WarmupResponse {
                status: "ready".to_string(),
                model_state: ModelState::Ready,
            }))
        }
        Err(err) => Err(AppError::ServiceUnavailable(err.to_string())),
    }
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    ServiceUnavailable(String),
    /// A status relayed verbatim from an upstream service.
    Upstream(StatusCode, String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Upstream(status, msg) => (status, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Invalid(err) => AppError::BadRequest(err.to_string()),
            RegistryError::NotFound(_) => AppError::NotFound(err.to_string()),
            RegistryError::Conflict(_) => AppError::Conflict(err.to_string()),
            RegistryError::BackendUnavailable(_) => AppError::ServiceUnavailable(err.to_string()),
        }
    }
}
