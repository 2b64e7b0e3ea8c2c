//! Session, one-shot transcription and dictionary routes.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::audio::{decode_wav, looks_like_wav, AudioFrame};
use crate::dictionary::DictionaryEntry;
use crate::error::ApiError;
use crate::merge::MergeStrategy;
use crate::pipeline::CancelFlag;
use crate::postprocess::{Mode, ProfileCategory};
use crate::segmenter::Strategy;
use crate::session::{SessionSnapshot, StopOptions};

use super::AppState;

/// Per-request timeout for ordinary session operations
const SESSION_OP_TIMEOUT: Duration = Duration::from_secs(30);
/// `stop` may cover minutes of audio
const STOP_TIMEOUT: Duration = Duration::from_secs(300);

async fn with_timeout<T>(
    limit: Duration,
    future: impl std::future::Future<Output = Result<T, ApiError>>,
) -> Result<T, ApiError> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| ApiError::Internal("request timed out".to_string()))?
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub app_hint: Option<String>,
}

pub async fn start(
    State(state): State<AppState>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<Value>, ApiError> {
    let app_hint = body.and_then(|Json(req)| req.app_hint);
    let session_id = state.sessions.open(app_hint)?;
    Ok(Json(json!({
        "session_id": session_id,
        "status": "started",
    })))
}

pub async fn ingest(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let ack = with_timeout(SESSION_OP_TIMEOUT, state.sessions.ingest(session_id, &body)).await?;
    Ok(Json(json!({
        "partial_transcript": ack.partial_transcript,
        "is_final": false,
        "pending_chunks": ack.pending_chunks,
    })))
}

pub async fn stop(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let outcome = with_timeout(
        STOP_TIMEOUT,
        state
            .sessions
            .stop(session_id, StopOptions::default(), None),
    )
    .await?;
    Ok(Json(json!({
        "session_id": outcome.session_id,
        "status": "stopped",
        "final_transcript": outcome.processed_transcript,
        "raw_transcript": outcome.final_transcript,
        "total_chunks": outcome.total_chunks,
        "total_segments": outcome.total_segments,
        "duration_seconds": outcome.duration_seconds,
        "postprocess_stats": outcome.postprocess_stats,
    })))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    with_timeout(SESSION_OP_TIMEOUT, state.sessions.cancel(session_id)).await?;
    Ok(Json(json!({ "status": "cancelled" })))
}

pub async fn status(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.sessions.status(session_id).await?))
}

pub async fn preview(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let partial = state.sessions.preview(session_id).await?;
    Ok(Json(json!({
        "session_id": session_id,
        "partial_transcript": partial,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct TranscribeQuery {
    pub language: Option<String>,
    pub strategy: Option<String>,
    pub merge_strategy: Option<String>,
    pub postprocess_mode: Option<String>,
}

/// One-shot transcription of an octet-stream body.
///
/// Accepts either raw canonical PCM or a WAV container, distinguished by
/// sniffing the RIFF magic.
pub async fn transcribe(
    State(state): State<AppState>,
    Query(query): Query<TranscribeQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::InvalidInput("empty audio body".to_string()));
    }

    let samples = if looks_like_wav(&body) {
        decode_wav(&body).map_err(|e| ApiError::InvalidInput(e.to_string()))?
    } else {
        AudioFrame::from_pcm_bytes(&body)
            .map_err(|e| ApiError::InvalidInput(e.to_string()))?
            .samples()
            .to_vec()
    };
    let audio = AudioFrame::new(samples);

    let strategy = parse_strategy(query.strategy.as_deref())?;
    let merge_strategy = parse_merge(query.merge_strategy.as_deref())?;
    let mode = parse_mode(query.postprocess_mode.as_deref())?
        .unwrap_or_else(|| state.postprocessor.default_mode());
    let language = query
        .language
        .unwrap_or_else(|| state.config.default_language.clone());

    debug!(
        "One-shot transcribe: {:.1}s, strategy={}",
        audio.duration_seconds(),
        strategy.as_str()
    );

    let segments = state.segmenter.segment(audio.samples(), strategy);
    let output = state
        .orchestrator
        .run(
            &audio,
            segments,
            &language,
            merge_strategy,
            &CancelFlag::new(),
            None,
        )
        .await
        .map_err(|e| match e {
            crate::pipeline::PipelineError::RecognizerFailed(m) => ApiError::RecognizerFailed(m),
            crate::pipeline::PipelineError::Cancelled => {
                ApiError::Internal("cancelled".to_string())
            }
        })?;

    let processed = state
        .postprocessor
        .process(
            &output.final_transcript,
            mode,
            ProfileCategory::General,
            &output.silence_breaks,
        )
        .await;

    Ok(Json(json!({
        "text": processed.text,
        "raw_text": output.final_transcript,
        "total_segments": output.total_segments,
        "duration_seconds": output.duration_seconds,
        "per_segment": output.per_segment,
        "merge_stats": output.merge_stats,
        "postprocess_stats": processed.stats,
    })))
}

pub async fn recognizer_status(State(state): State<AppState>) -> Json<Value> {
    let status = state.recognizer.status().await;
    Json(json!(status))
}

// -- Dictionary administration --

#[derive(Debug, Serialize)]
pub struct DictionaryList {
    pub entries: Vec<DictionaryEntry>,
    pub count: usize,
}

pub async fn dictionary_list(State(state): State<AppState>) -> Json<DictionaryList> {
    let entries = state.dictionary.list();
    Json(DictionaryList {
        count: entries.len(),
        entries,
    })
}

pub async fn dictionary_upsert(
    State(state): State<AppState>,
    Json(entry): Json<DictionaryEntry>,
) -> Result<Json<Value>, ApiError> {
    if entry.spoken.trim().is_empty() {
        return Err(ApiError::InvalidInput(
            "dictionary entry needs a spoken form".to_string(),
        ));
    }
    state.dictionary.upsert(entry);
    Ok(Json(json!({
        "status": "ok",
        "count": state.dictionary.len(),
    })))
}

pub async fn dictionary_remove(
    State(state): State<AppState>,
    Path(spoken): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.dictionary.remove(&spoken) {
        return Err(ApiError::NotFound(format!("dictionary entry '{spoken}'")));
    }
    Ok(Json(json!({
        "status": "deleted",
        "count": state.dictionary.len(),
    })))
}

// -- Enum parameter parsing --

pub fn parse_strategy(value: Option<&str>) -> Result<Strategy, ApiError> {
    match value {
        None => Ok(Strategy::Hybrid),
        Some(s) => Strategy::parse(s)
            .ok_or_else(|| ApiError::InvalidInput(format!("unknown strategy '{s}'"))),
    }
}

pub fn parse_merge(value: Option<&str>) -> Result<MergeStrategy, ApiError> {
    match value {
        None => Ok(MergeStrategy::Simple),
        Some(s) => MergeStrategy::parse(s)
            .ok_or_else(|| ApiError::InvalidInput(format!("unknown merge strategy '{s}'"))),
    }
}

pub fn parse_mode(value: Option<&str>) -> Result<Option<Mode>, ApiError> {
    match value {
        None => Ok(None),
        Some(s) => Mode::parse(s)
            .map(Some)
            .ok_or_else(|| ApiError::InvalidInput(format!("unknown postprocess mode '{s}'"))),
    }
}
