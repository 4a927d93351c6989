//! Media upload handlers.

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, Path, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::services::uploads::{is_allowed, SavedFile};
use crate::AppState;
use service_core::error::AppError;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub message: String,
    pub files: Vec<SavedFile>,
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(err.body_text())
    } else {
        AppError::BadRequest(anyhow::anyhow!(err.body_text()))
    }
}

/// Store every image in the `files` fields. Other file types are skipped.
///
/// POST /upload
pub async fn upload_files(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    let mut multipart =
        multipart.map_err(|rejection| AppError::BadRequest(anyhow::anyhow!(rejection.body_text())))?;

    let mut offered = 0usize;
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("files") {
            continue;
        }
        let Some(original_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        if original_name.is_empty() {
            continue;
        }
        offered += 1;

        if !is_allowed(&original_name) {
            tracing::warn!(filename = %original_name, "Skipping upload with disallowed type");
            continue;
        }
        let bytes = field.bytes().await.map_err(multipart_error)?;
        files.push(state.uploads.save(&original_name, &bytes).await?);
    }

    if offered == 0 {
        return Err(AppError::BadRequest(anyhow::anyhow!("No files provided")));
    }
    if files.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "No valid image files uploaded"
        )));
    }

    Ok(Json(UploadResponse {
        status: "success",
        message: format!("Successfully uploaded {} files", files.len()),
        files,
    }))
}

/// GET /uploads/:filename
pub async fn get_upload(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (bytes, mime) = state.uploads.read(&filename).await?;
    Ok(([(header::CONTENT_TYPE, mime)], bytes))
}

/// DELETE /uploads/:filename
pub async fn delete_upload(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.uploads.delete(&filename).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("File {} deleted", filename),
    })))
}
