//! Axum HTTP layer over [`InferenceDispatchService`]
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Banner |
//! | `GET`  | `/health` | Liveness check |
//! | `GET`  | `/models` | Every registered model and its state |
//! | `GET`  | `/models/{id}` | Descriptor and live metadata of one model |
//! | `POST` | `/models/{id}/load` | Load a model ahead of traffic |
//! | `POST` | `/models/{id}/unload` | Release a model |
//! | `POST` | `/cache/clear` | Return cached accelerator memory |
//! | `POST` | `/remove-background` | Multipart upload, returns a PNG |
//!
//! Every failure is rendered as
//! `{"status":"failed","error_code":"<REASON>","error":"<message>"}`.

use crate::error::{BgServeError, FailureReason};
use crate::service::{InferenceDispatchService, InferenceRequest};
use crate::tracing_config::spans;
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, Instrument};
use uuid::Uuid;

/// Header carrying the per-request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Room for multipart framing on top of the image itself
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Shared state injected into every handler
#[derive(Clone, Debug)]
pub struct AppState {
    service: Arc<InferenceDispatchService>,
}

/// Error rendered as a JSON failure body
#[derive(Debug)]
pub enum ApiError {
    /// Failure reported by the dispatch service
    Service(BgServeError),
    /// Malformed HTTP request (missing field, bad multipart)
    BadRequest(String),
}

impl From<BgServeError> for ApiError {
    fn from(error: BgServeError) -> Self {
        Self::Service(error)
    }
}

/// HTTP status for a failure reason
#[must_use]
pub fn status_for(reason: FailureReason) -> StatusCode {
    match reason {
        FailureReason::ModelNotFound => StatusCode::NOT_FOUND,
        FailureReason::InvalidImage | FailureReason::InvalidRequest => StatusCode::BAD_REQUEST,
        FailureReason::ModelBusy => StatusCode::CONFLICT,
        FailureReason::ModelLoadFailed => StatusCode::BAD_GATEWAY,
        FailureReason::ModelLoadTimeout | FailureReason::InferenceTimeout => {
            StatusCode::GATEWAY_TIMEOUT
        },
        FailureReason::InferenceFailed | FailureReason::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (reason, message) = match self {
            Self::Service(error) => (error.reason(), error.public_message()),
            Self::BadRequest(message) => (FailureReason::InvalidRequest, message),
        };
        let body = json!({
            "status": "failed",
            "error_code": reason.as_str(),
            "error": message,
        });
        (status_for(reason), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the router with CORS, tracing, request ids and the upload limit
pub fn router(service: Arc<InferenceDispatchService>) -> Router {
    let body_limit = service
        .config()
        .limits
        .max_bytes
        .saturating_add(MULTIPART_OVERHEAD);
    let state = AppState { service };

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/models", get(list_models_handler))
        .route("/models/{id}", get(model_metadata_handler))
        .route("/models/{id}/load", post(load_model_handler))
        .route("/models/{id}/unload", post(unload_model_handler))
        .route("/cache/clear", post(clear_cache_handler))
        .route("/remove-background", post(remove_background_handler))
        .route("/remove-background/", post(remove_background_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

/// Give every request a UUID, record it on its span and echo it back
async fn request_id(request: Request, next: Next) -> Response {
    let id = Uuid::new_v4().to_string();
    let span = spans::http_request(&id, request.method().as_str(), request.uri().path());
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Background removal API is running. POST an image to /remove-background"
    }))
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.service.health();
    Json(json!({
        "status": health.status,
        "device": health.device.to_string(),
        "models_loaded": health.models_loaded,
        "gate_capacity": health.gate_capacity,
        "gate_in_flight": health.gate_in_flight,
        "uptime_secs": health.uptime_secs,
    }))
}

async fn list_models_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "success",
        "models": state.service.list_models(),
    }))
}

async fn model_metadata_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = state.service.model_metadata(&id)?;
    Ok(Json(json!({
        "status": "success",
        "model": status,
    })))
}

async fn load_model_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.service.load_model(&id).await?;
    Ok(Json(json!({ "status": "success", "model": id })))
}

async fn unload_model_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.service.unload_model(&id).await?;
    Ok(Json(json!({ "status": "success" })))
}

async fn clear_cache_handler(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let cleared = state.service.clear_accelerator_cache().await?;
    Ok(Json(json!({ "status": "success", "cleared": cleared })))
}

#[derive(Debug, Default)]
struct UploadForm {
    image: Option<Vec<u8>>,
    filename: Option<String>,
    model: Option<String>,
    enable_refinement: bool,
}

async fn read_upload(mut multipart: Multipart) -> ApiResult<UploadForm> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if let Some(content_type) = field.content_type() {
                    if !content_type.starts_with("image/")
                        && content_type != "application/octet-stream"
                    {
                        return Err(BgServeError::invalid_image("file must be an image").into());
                    }
                }
                form.filename = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(multipart_error)?;
                form.image = Some(bytes.to_vec());
            },
            "model" => {
                let text = field
                    .text()
                    .await
                    .map_err(multipart_error)?;
                form.model = Some(text);
            },
            "enable_refinement" => {
                let text = field
                    .text()
                    .await
                    .map_err(multipart_error)?;
                form.enable_refinement = parse_flag(&text).ok_or_else(|| {
                    ApiError::BadRequest(format!("enable_refinement must be a boolean, got '{text}'"))
                })?;
            },
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }
    Ok(form)
}

/// Uploads over the body limit are oversized images, not malformed requests
fn multipart_error(error: MultipartError) -> ApiError {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        BgServeError::invalid_image(error.body_text()).into()
    } else {
        ApiError::BadRequest(error.body_text())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// `processed_<stem>.png`, keeping only characters safe in a header
fn output_filename(original: Option<&str>) -> String {
    let stem = original
        .map(|name| {
            std::path::Path::new(name)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("image")
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
                .collect::<String>()
        })
        .filter(|stem| !stem.trim().is_empty())
        .unwrap_or_else(|| "image".to_string());
    format!("processed_{stem}.png")
}

async fn remove_background_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let form = read_upload(multipart).await?;
    let image = form
        .image
        .ok_or_else(|| ApiError::BadRequest("missing 'file' field".to_string()))?;

    let mut request = InferenceRequest::new(image).with_refinement(form.enable_refinement);
    request.model_id = form.model;
    let output = state.service.remove_background(request).await?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        output_filename(form.filename.as_deref())
    );
    let mut response = output.png.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&output.model_id) {
        headers.insert("x-model-id", value);
    }
    headers.insert(
        "x-processing-time-ms",
        HeaderValue::from(output.timings.total_ms),
    );
    Ok(response)
}
