//! Asynchronous job routes.

use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audio::{decode_upload, AudioFrame};
use crate::error::ApiError;
use crate::jobs::{JobParams, JobSnapshot, JobState, JobStats};

use super::asr::{parse_merge, parse_mode, parse_strategy};
use super::AppState;

/// Submit a multipart file for asynchronous transcription
pub async fn submit(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut params = JobParams::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidInput(format!("multipart: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                let filename = field.file_name().unwrap_or("upload.wav").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::InvalidInput(format!("multipart read: {e}")))?;
                file = Some((filename, bytes.to_vec()));
            }
            "language" => {
                let value = field_text(field).await?;
                if !value.is_empty() {
                    params.language = Some(value);
                }
            }
            "strategy" => {
                let value = field_text(field).await?;
                params.strategy = parse_strategy(Some(&value))?;
            }
            "merge_strategy" => {
                let value = field_text(field).await?;
                params.merge_strategy = parse_merge(Some(&value))?;
            }
            "postprocess_mode" => {
                let value = field_text(field).await?;
                params.postprocess_mode = parse_mode(Some(&value))?;
            }
            _ => {}
        }
    }

    let (filename, bytes) =
        file.ok_or_else(|| ApiError::InvalidInput("multipart field 'file' missing".to_string()))?;

    // Decode before queueing so malformed uploads fail fast at submit time
    let samples = decode_upload(bytes, &filename)
        .await
        .map_err(|e| ApiError::InvalidInput(e.to_string()))?;
    params.filename = filename;

    let job_id = state.jobs.submit(AudioFrame::new(samples), params)?;
    Ok(Json(json!({
        "job_id": job_id,
        "status": "submitted",
    })))
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::InvalidInput(format!("multipart field: {e}")))
}

pub async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobSnapshot>, ApiError> {
    Ok(Json(state.jobs.status(job_id)?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobSnapshot>, ApiError> {
    Ok(Json(state.jobs.cancel(job_id)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = match query.status.as_deref() {
        None => None,
        Some(s) => Some(
            JobState::parse(s)
                .ok_or_else(|| ApiError::InvalidInput(format!("unknown job status '{s}'")))?,
        ),
    };
    let limit = query.limit.unwrap_or(50).min(500);
    let jobs = state.jobs.list(filter, limit);
    Ok(Json(json!({
        "count": jobs.len(),
        "jobs": jobs,
    })))
}

pub async fn stats(State(state): State<AppState>) -> Json<JobStats> {
    Json(state.jobs.stats())
}
