//! Upload transcription and text post-processing routes.

use axum::extract::{Multipart, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::audio::{decode_upload, AudioFrame};
use crate::error::ApiError;
use crate::merge::MergeStrategy;
use crate::pipeline::CancelFlag;
use crate::postprocess::{Mode, PostProcessSettings, ProfileCategory};
use crate::segmenter::Strategy;

use super::asr::{parse_merge, parse_mode, parse_strategy};
use super::AppState;

/// One uploaded file plus the accompanying text fields
struct UploadForm {
    files: Vec<(String, Vec<u8>)>,
    language: Option<String>,
    strategy: Option<String>,
    merge_strategy: Option<String>,
    postprocess_mode: Option<String>,
}

async fn read_multipart(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm {
        files: Vec::new(),
        language: None,
        strategy: None,
        merge_strategy: None,
        postprocess_mode: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidInput(format!("multipart: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" | "files" => {
                let filename = field.file_name().unwrap_or("upload.wav").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::InvalidInput(format!("multipart read: {e}")))?;
                form.files.push((filename, bytes.to_vec()));
            }
            "language" => form.language = read_text(field).await?,
            "strategy" => form.strategy = read_text(field).await?,
            "merge_strategy" => form.merge_strategy = read_text(field).await?,
            "postprocess_mode" => form.postprocess_mode = read_text(field).await?,
            other => {
                debug!("Ignoring unknown multipart field '{}'", other);
            }
        }
    }
    Ok(form)
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<Option<String>, ApiError> {
    let value = field
        .text()
        .await
        .map_err(|e| ApiError::InvalidInput(format!("multipart field: {e}")))?;
    Ok(if value.is_empty() { None } else { Some(value) })
}

struct TranscribedUpload {
    filename: String,
    raw_text: String,
    processed_text: String,
    total_segments: usize,
    duration_seconds: f32,
    merge_stats: crate::merge::MergeStats,
    postprocess_stats: crate::postprocess::PostProcessStats,
}

/// Shared decode -> segment -> transcribe -> post-process flow
async fn transcribe_upload(
    state: &AppState,
    filename: String,
    bytes: Vec<u8>,
    language: &str,
    strategy: Strategy,
    merge_strategy: MergeStrategy,
    mode: Mode,
) -> Result<TranscribedUpload, ApiError> {
    let samples = decode_upload(bytes, &filename)
        .await
        .map_err(|e| ApiError::InvalidInput(e.to_string()))?;
    let audio = AudioFrame::new(samples);
    debug!(
        "Upload '{}': {:.1}s decoded ({})",
        filename,
        audio.duration_seconds(),
        strategy.as_str()
    );

    let segments = state.segmenter.segment(audio.samples(), strategy);
    let output = state
        .orchestrator
        .run(
            &audio,
            segments,
            language,
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

    Ok(TranscribedUpload {
        filename,
        raw_text: output.final_transcript,
        processed_text: processed.text,
        total_segments: output.total_segments,
        duration_seconds: output.duration_seconds,
        merge_stats: output.merge_stats,
        postprocess_stats: processed.stats,
    })
}

fn upload_json(upload: &TranscribedUpload) -> Value {
    json!({
        "filename": upload.filename,
        "text": upload.processed_text,
        "raw_text": upload.raw_text,
        "total_segments": upload.total_segments,
        "duration_seconds": upload.duration_seconds,
        "merge_stats": upload.merge_stats,
        "postprocess_stats": upload.postprocess_stats,
    })
}

/// Short-file upload: transcribed as a single unit (no long-audio split)
pub async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = read_multipart(multipart).await?;
    let (filename, bytes) = form
        .files
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::InvalidInput("multipart field 'file' missing".to_string()))?;

    let mode = parse_mode(form.postprocess_mode.as_deref())?
        .unwrap_or_else(|| state.postprocessor.default_mode());
    let language = form
        .language
        .unwrap_or_else(|| state.config.default_language.clone());

    // Fixed strategy on a short clip yields exactly one segment
    let result = transcribe_upload(
        &state,
        filename,
        bytes,
        &language,
        Strategy::Fixed,
        MergeStrategy::Simple,
        mode,
    )
    .await?;
    Ok(Json(upload_json(&result)))
}

/// Long-file upload: segmented with the requested strategy
pub async fn upload_long(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = read_multipart(multipart).await?;
    let (filename, bytes) = form
        .files
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::InvalidInput("multipart field 'file' missing".to_string()))?;

    let strategy = parse_strategy(form.strategy.as_deref())?;
    let merge_strategy = parse_merge(form.merge_strategy.as_deref())?;
    let mode = parse_mode(form.postprocess_mode.as_deref())?
        .unwrap_or_else(|| state.postprocessor.default_mode());
    let language = form
        .language
        .unwrap_or_else(|| state.config.default_language.clone());

    let result = transcribe_upload(
        &state,
        filename,
        bytes,
        &language,
        strategy,
        merge_strategy,
        mode,
    )
    .await?;
    Ok(Json(upload_json(&result)))
}

/// Multi-file upload; per-file failures are isolated into the response
pub async fn batch_transcribe(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = read_multipart(multipart).await?;
    if form.files.is_empty() {
        return Err(ApiError::InvalidInput("no files in upload".to_string()));
    }

    let strategy = parse_strategy(form.strategy.as_deref())?;
    let merge_strategy = parse_merge(form.merge_strategy.as_deref())?;
    let mode = parse_mode(form.postprocess_mode.as_deref())?
        .unwrap_or_else(|| state.postprocessor.default_mode());
    let language = form
        .language
        .unwrap_or_else(|| state.config.default_language.clone());

    let total = form.files.len();
    let mut results = Vec::with_capacity(total);
    let mut succeeded = 0usize;
    for (filename, bytes) in form.files {
        let display_name = filename.clone();
        match transcribe_upload(
            &state,
            filename,
            bytes,
            &language,
            strategy,
            merge_strategy,
            mode,
        )
        .await
        {
            Ok(result) => {
                succeeded += 1;
                results.push(upload_json(&result));
            }
            Err(e) => {
                warn!("Batch file '{}' failed: {}", display_name, e);
                results.push(json!({
                    "filename": display_name,
                    "error": e.to_string(),
                    "kind": e.kind(),
                }));
            }
        }
    }

    Ok(Json(json!({
        "total": total,
        "succeeded": succeeded,
        "results": results,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TextRequest {
    pub text: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub use_llm: Option<bool>,
    #[serde(default)]
    pub app_hint: Option<String>,
}

/// Post-process already-transcribed text
pub async fn text(
    State(state): State<AppState>,
    Json(request): Json<TextRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut mode = parse_mode(request.mode.as_deref())?
        .unwrap_or_else(|| state.postprocessor.default_mode());
    if request.use_llm.unwrap_or(false) {
        mode = Mode::Advanced;
    }
    let category = ProfileCategory::from_app_hint(request.app_hint.as_deref());

    let outcome = state
        .postprocessor
        .process(&request.text, mode, category, &[])
        .await;

    Ok(Json(json!({
        "text": outcome.text,
        "original_length": request.text.len(),
        "stats": outcome.stats,
    })))
}

pub async fn get_config(State(state): State<AppState>) -> Json<PostProcessSettings> {
    Json(state.postprocessor.settings())
}

pub async fn set_config(
    State(state): State<AppState>,
    Json(settings): Json<PostProcessSettings>,
) -> Result<Json<Value>, ApiError> {
    state.postprocessor.update_settings(settings);
    Ok(Json(json!({ "status": "ok" })))
}
