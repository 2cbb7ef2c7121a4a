use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::errors::PipelineError;
use crate::render::cache::{self, CacheNamespace, ResultCache};
use crate::render::llm::CodeAssistant;
use crate::render::models::{Job, JobStatus, Quality};
use crate::render::pipeline::{RenderPipeline, Submission};
use crate::render::prompt::GenerateRequest;
use crate::render::worker::Dispatcher;

const GENERATION_CACHE_WARNING: &str = "Served from generation cache";
const INSTRUCTION_MAX_CHARS: usize = 500;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub pipeline: Arc<RenderPipeline>,
    pub assistant: CodeAssistant,
    /// Generation cache; the pipeline holds its own handle for renders.
    pub cache: ResultCache,
    pub dispatcher: Dispatcher,
    pub default_quality: Quality,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub code: String,
    pub model: String,
    pub warnings: Vec<String>,
}

#[derive(Deserialize)]
pub struct RegenerateRequest {
    pub code: String,
    pub instruction: String,
}

#[derive(Serialize)]
pub struct RegenerateResponse {
    pub code: String,
}

fn default_retry_on_error() -> bool {
    true
}

#[derive(Deserialize)]
pub struct RenderRequest {
    pub code: String,
    /// Falls back to `render.default_quality`.
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default = "default_retry_on_error")]
    pub retry_on_error: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RenderResponse {
    pub job_id: String,
    pub status: JobStatus,
}

/// Public view of a job; the artifact path stays internal.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub stage: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            progress: job.progress,
            stage: job.stage,
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    /// Rule violations, reported as a list.
    Invalid(Vec<String>),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({"error": msg})),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            ApiError::Invalid(errors) => (
                StatusCode::BAD_REQUEST,
                json!({"error": "validation failed", "errors": errors}),
            ),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({"error": msg})),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, json!({"error": msg})),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": msg})),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::JobNotFound { job_id } => ApiError::NotFound(format!("Job {} not found", job_id)),
            PipelineError::QueueClosed => ApiError::Unavailable(e.to_string()),
            other => {
                error!(error = %other, "request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/generate", post(generate))
        .route("/regenerate", post(regenerate))
        .route("/render", post(render))
        .route("/status/{job_id}", get(job_status))
        .route("/video/{job_id}", get(job_video))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn generate(
    State(state): State<SharedState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(request) = payload?;
    let problems = request.check();
    if !problems.is_empty() {
        return Err(ApiError::Invalid(problems));
    }

    let assistant = &state.assistant;
    let request_json = serde_json::to_string(&request).map_err(|e| ApiError::Internal(e.to_string()))?;
    let fingerprint = cache::fingerprint(&cache::generation_canonical(
        assistant.provider(),
        assistant.model(),
        &request_json,
    ));

    if let Some(code) = state.cache.get(CacheNamespace::Generation, &fingerprint).await {
        info!(topic = %request.topic, "generation cache hit");
        return Ok(Json(GenerateResponse {
            code,
            model: assistant.model().to_string(),
            warnings: vec![GENERATION_CACHE_WARNING.to_string()],
        }));
    }

    let (code, mut warnings) = assistant.generate_code(&request).await;
    let validation = state.pipeline.validator().validate(&code);
    if !validation.ok {
        warnings.extend(validation.errors);
    } else if warnings.is_empty() {
        state.cache.put(CacheNamespace::Generation, &fingerprint, &code).await;
    }

    Ok(Json(GenerateResponse {
        code,
        model: assistant.model().to_string(),
        warnings,
    }))
}

async fn regenerate(
    State(state): State<SharedState>,
    payload: Result<Json<RegenerateRequest>, JsonRejection>,
) -> Result<Json<RegenerateResponse>, ApiError> {
    let Json(request) = payload?;
    if request.code.trim().is_empty() {
        return Err(ApiError::BadRequest("code must not be empty".to_string()));
    }
    let instruction_len = request.instruction.chars().count();
    if instruction_len == 0 || instruction_len > INSTRUCTION_MAX_CHARS {
        return Err(ApiError::BadRequest(format!(
            "instruction must be between 1 and {} characters",
            INSTRUCTION_MAX_CHARS
        )));
    }

    let code = state.assistant.revise_code(&request.code, &request.instruction).await;
    let validation = state.pipeline.validator().validate(&code);
    if !validation.ok {
        return Err(ApiError::Invalid(validation.errors));
    }
    Ok(Json(RegenerateResponse { code }))
}

async fn render(
    State(state): State<SharedState>,
    payload: Result<Json<RenderRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    if request.code.trim().is_empty() {
        return Err(ApiError::BadRequest("code must not be empty".to_string()));
    }
    let quality = match request.quality.as_deref() {
        Some(q) => q.parse::<Quality>().map_err(ApiError::BadRequest)?,
        None => state.default_quality,
    };

    let validation = state.pipeline.validator().validate(&request.code);
    if !validation.ok && !request.retry_on_error {
        return Err(ApiError::Invalid(validation.errors));
    }

    let submission = state
        .pipeline
        .submit(&request.code, quality, request.retry_on_error)
        .await?;
    let job = match submission {
        Submission::Cached(job) | Submission::InFlight(job) => job,
        Submission::Enqueued(job, task) => {
            if let Err(e) = state.dispatcher.dispatch(task).await {
                warn!(job_id = %job.job_id, error = %e, "failed to dispatch render job");
                if let Err(store_err) = state.pipeline.abandon(&job.job_id, &e.to_string()).await {
                    error!(job_id = %job.job_id, error = %store_err, "failed to record dispatch failure");
                }
                return Err(e.into());
            }
            info!(job_id = %job.job_id, quality = %quality, mode = state.dispatcher.mode(), "render job dispatched");
            job
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(RenderResponse {
            job_id: job.job_id,
            status: job.status,
        }),
    ))
}

async fn load_job(state: &SharedState, job_id: &str) -> Result<Job, ApiError> {
    state
        .pipeline
        .jobs()
        .get(job_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", job_id)))
}

async fn job_status(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = load_job(&state, &job_id).await?;
    Ok(Json(job.into()))
}

async fn job_video(State(state): State<SharedState>, Path(job_id): Path<String>) -> Result<Response, ApiError> {
    let job = load_job(&state, &job_id).await?;
    if job.status != JobStatus::Done {
        return Err(ApiError::Conflict(format!(
            "Job {} is not finished (status: {})",
            job_id, job.status
        )));
    }

    let storage = state.pipeline.storage();
    let missing = || ApiError::NotFound(format!("Video for job {} not found", job_id));
    let path = storage
        .get(&job_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(missing)?;
    // Rendered clips are short; the whole file is buffered per request.
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    };

    Ok((
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.mp4\"", job_id),
            ),
        ],
        bytes,
    )
        .into_response())
}
