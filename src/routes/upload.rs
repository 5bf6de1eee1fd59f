//! Upload Routes
//!
//! HTTP endpoints for the chunked upload protocol.
//!
//! Endpoints:
//! - POST /upload/new - Create a session, returns its upload ID
//! - PATCH /upload/chunk - Write one byte range (multipart, part `file`)
//! - POST /upload/complete - Queue verification and finalization
//! - POST /upload/poll - Completion status of a session
//! - POST /upload/abort - Discard a session

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header::CONTENT_RANGE, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{patch, post},
    Json, Router,
};
use serde::Serialize;

use crate::state::AppState;
use crate::upload::{
    ContentRange, NewUploadRequest, NewUploadResponse, PollResponse, UploadError, UploadId,
    UploadIdRequest,
};

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        // Server-side details stay in the log
        let error = if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Upload request failed");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let body = Json(ErrorResponse {
            error,
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router. Chunk bodies are capped at `max_chunk_bytes`.
pub fn router(max_chunk_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/new", post(new_upload))
        .route(
            "/chunk",
            patch(upload_chunk).layer(DefaultBodyLimit::max(max_chunk_bytes)),
        )
        .route("/complete", post(complete))
        .route("/poll", post(poll))
        .route("/abort", post(abort))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /upload/new
async fn new_upload(
    State(state): State<AppState>,
    Json(request): Json<NewUploadRequest>,
) -> Result<Json<NewUploadResponse>, UploadError> {
    let id = state.uploads().new_upload(request).await?;

    Ok(Json(NewUploadResponse {
        upload_id: id.to_string(),
    }))
}

/// PATCH /upload/chunk
///
/// Each `file` part carries the upload ID as its filename and its range in a
/// part-level `Content-Range` header. Without one, the request-level header
/// applies and only the first part is read.
async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<StatusCode, UploadError> {
    let fallback = headers.get(CONTENT_RANGE).cloned();
    let mut parts = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::InvalidInput(format!("malformed multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let id = UploadId::parse(field.file_name().unwrap_or_default())?;

        let part_range = field.headers().get(CONTENT_RANGE).cloned();
        let range = match part_range.as_ref().or(fallback.as_ref()) {
            Some(value) => ContentRange::parse(header_str(value)?)?,
            None => {
                return Err(UploadError::InvalidContentRange(
                    "missing content-range header".into(),
                ))
            }
        };

        state.uploads().write_chunk(id, range, field).await?;
        parts += 1;

        if part_range.is_none() {
            break;
        }
    }

    if parts == 0 {
        return Err(UploadError::InvalidInput("no file part in request".into()));
    }

    Ok(StatusCode::NO_CONTENT)
}

/// POST /upload/complete
async fn complete(
    State(state): State<AppState>,
    Json(request): Json<UploadIdRequest>,
) -> Result<StatusCode, UploadError> {
    let id = UploadId::parse(&request.upload_id)?;
    state.uploads().complete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /upload/poll
async fn poll(
    State(state): State<AppState>,
    Json(request): Json<UploadIdRequest>,
) -> Result<Json<PollResponse>, UploadError> {
    let id = UploadId::parse(&request.upload_id)?;
    Ok(Json(state.uploads().poll(id).await?))
}

/// POST /upload/abort
async fn abort(
    State(state): State<AppState>,
    Json(request): Json<UploadIdRequest>,
) -> Result<StatusCode, UploadError> {
    let id = UploadId::parse(&request.upload_id)?;
    state.uploads().abort(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn header_str(value: &HeaderValue) -> Result<&str, UploadError> {
    value
        .to_str()
        .map_err(|_| UploadError::InvalidContentRange("content-range is not valid ASCII".into()))
}
