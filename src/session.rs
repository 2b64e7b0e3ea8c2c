//! Streaming session lifecycle.
//!
//! A session accumulates PCM pushed by one client, then runs the pipeline on
//! stop. States move strictly forward:
//!
//! ```text
//! Started -> Receiving -> Stopping -> Stopped
//!    |           |                       |
//!    +-- cancel -+---------> Cancelled   |
//!    +---------- ttl ------> Expired  <--+
//! ```
//!
//! The sessions map is guarded by a plain mutex held only for lookups; each
//! session has its own async lock, never held across recognizer I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::{AudioFrame, SAMPLE_RATE};
use crate::config::Config;
use crate::error::ApiError;
use crate::merge::{MergeStats, MergeStrategy};
use crate::pipeline::{CancelFlag, PipelineError, PipelineOrchestrator, PipelineProgress, ProgressSender};
use crate::postprocess::{Mode, PostProcessStats, PostProcessor, ProfileCategory};
use crate::recognizer::Transcription;
use crate::segmenter::{Segmenter, Strategy};

/// Hard cap on live sessions; opening beyond this is resource exhaustion
const MAX_SESSIONS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Started,
    Receiving,
    Stopping,
    Stopped,
    Cancelled,
    Expired,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Cancelled | Self::Expired)
    }
}

struct Session {
    id: Uuid,
    state: SessionState,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    app_hint: Option<String>,
    frames: Vec<AudioFrame>,
    pending_chunks: u64,
    /// Best-effort partial transcript; shared so the pipeline can update it
    /// while the session lock is free
    partial: Arc<RwLock<String>>,
    final_transcript: Option<String>,
    cancel: CancelFlag,
}

impl Session {
    fn new(app_hint: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Started,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            last_activity_at: Utc::now(),
            app_hint,
            frames: Vec::new(),
            pending_chunks: 0,
            partial: Arc::new(RwLock::new(String::new())),
            final_transcript: None,
            cancel: CancelFlag::new(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    fn audio_samples(&self) -> usize {
        self.frames.iter().map(|f| f.len()).sum()
    }
}

/// Read-only view of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_hint: Option<String>,
    pub pending_chunks: u64,
    pub audio_seconds: f32,
    pub partial_transcript: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_transcript: Option<String>,
}

/// Acknowledgement for one ingest call
#[derive(Debug, Clone, Serialize)]
pub struct IngestAck {
    pub partial_transcript: String,
    pub pending_chunks: u64,
}

/// Parameters for finalizing a session
#[derive(Debug, Clone)]
pub struct StopOptions {
    pub strategy: Strategy,
    pub merge_strategy: MergeStrategy,
    pub postprocess_mode: Option<Mode>,
    pub language: Option<String>,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::Hybrid,
            merge_strategy: MergeStrategy::Simple,
            postprocess_mode: None,
            language: None,
        }
    }
}

/// Everything `stop` produces
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub session_id: Uuid,
    pub final_transcript: String,
    pub processed_transcript: String,
    pub total_chunks: u64,
    pub total_segments: usize,
    pub duration_seconds: f32,
    pub per_segment: Vec<Transcription>,
    pub merge_stats: MergeStats,
    pub postprocess_stats: PostProcessStats,
}

/// Owns every session and the background reaper.
pub struct SessionManager {
    sessions: Mutex<HashMap<Uuid, Arc<AsyncMutex<Session>>>>,
    config: Arc<Config>,
    segmenter: Segmenter,
    orchestrator: PipelineOrchestrator,
    postprocessor: Arc<PostProcessor>,
}

impl SessionManager {
    pub fn new(
        config: Arc<Config>,
        orchestrator: PipelineOrchestrator,
        postprocessor: Arc<PostProcessor>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            segmenter: Segmenter::new(config.segmenter.clone()),
            config,
            orchestrator,
            postprocessor,
        }
    }

    /// Allocate a new session in `Started`
    pub fn open(&self, app_hint: Option<String>) -> Result<Uuid, ApiError> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.len() >= MAX_SESSIONS {
            return Err(ApiError::ResourceExhausted(format!(
                "session limit of {MAX_SESSIONS} reached"
            )));
        }
        let session = Session::new(app_hint);
        let id = session.id;
        sessions.insert(id, Arc::new(AsyncMutex::new(session)));
        info!("Session {} opened", id);
        Ok(id)
    }

    fn get(&self, id: Uuid) -> Result<Arc<AsyncMutex<Session>>, ApiError> {
        self.sessions
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("session {id}")))
    }

    /// Append PCM bytes to a session.
    ///
    /// Returns the current partial transcript without ever waiting on
    /// recognition. The byte count must be a whole number of samples.
    pub async fn ingest(&self, id: Uuid, pcm: &[u8]) -> Result<IngestAck, ApiError> {
        let frame = AudioFrame::from_pcm_bytes(pcm)
            .map_err(|e| ApiError::InvalidInput(e.to_string()))?;

        let entry = self.get(id)?;
        let mut session = entry.lock().await;

        match session.state {
            SessionState::Started => session.state = SessionState::Receiving,
            SessionState::Receiving => {}
            other => {
                return Err(ApiError::InvalidState(format!(
                    "cannot ingest audio in state {other:?}"
                )))
            }
        }

        let cap_samples = self.config.max_session_audio_seconds as usize * SAMPLE_RATE as usize;
        if session.audio_samples() + frame.len() > cap_samples {
            // The buffer is full; force the session toward finalization
            warn!("Session {} hit the audio cap, moving to Stopping", id);
            session.state = SessionState::Stopping;
            return Err(ApiError::ResourceExhausted(format!(
                "session audio cap of {}s reached",
                self.config.max_session_audio_seconds
            )));
        }

        session.frames.push(frame);
        session.pending_chunks += 1;
        session.touch();

        let partial_transcript = session.partial.read().unwrap().clone();
        Ok(IngestAck {
            partial_transcript,
            pending_chunks: session.pending_chunks,
        })
    }

    /// Finalize a session: segment, transcribe, post-process.
    pub async fn stop(
        &self,
        id: Uuid,
        options: StopOptions,
        progress: Option<&ProgressSender>,
    ) -> Result<StopOutcome, ApiError> {
        let entry = self.get(id)?;

        // Claim the session for finalization, then release the lock before
        // any recognizer I/O
        let (audio, total_chunks, app_hint, cancel, partial) = {
            let mut session = entry.lock().await;
            match session.state {
                SessionState::Started | SessionState::Receiving | SessionState::Stopping => {}
                other => {
                    return Err(ApiError::InvalidState(format!(
                        "cannot stop session in state {other:?}"
                    )))
                }
            }
            session.state = SessionState::Stopping;
            session.touch();
            (
                AudioFrame::concat(&session.frames),
                session.pending_chunks,
                session.app_hint.clone(),
                session.cancel.clone(),
                session.partial.clone(),
            )
        };

        let language = options
            .language
            .unwrap_or_else(|| self.config.default_language.clone());
        let segments = self.segmenter.segment(audio.samples(), options.strategy);

        // Mirror pipeline progress into the shared partial transcript so
        // preview/ingest readers see it
        let (partial_tx, forward) = spawn_partial_forwarder(partial, progress.cloned());

        let result = self
            .orchestrator
            .run(
                &audio,
                segments,
                &language,
                options.merge_strategy,
                &cancel,
                Some(&partial_tx),
            )
            .await;
        drop(partial_tx);
        let _ = forward.await;

        let output = match result {
            Ok(output) => output,
            Err(PipelineError::Cancelled) => {
                return Err(ApiError::InvalidState("session cancelled".to_string()))
            }
            Err(PipelineError::RecognizerFailed(message)) => {
                // Session stays in Stopping; the client may retry stop
                return Err(ApiError::RecognizerFailed(message));
            }
        };

        let mode = options
            .postprocess_mode
            .unwrap_or_else(|| self.postprocessor.default_mode());
        let category = ProfileCategory::from_app_hint(app_hint.as_deref());
        let processed = self
            .postprocessor
            .process(
                &output.final_transcript,
                mode,
                category,
                &output.silence_breaks,
            )
            .await;

        let mut session = entry.lock().await;
        if session.state.is_terminal() {
            // Cancel or expiry won the race; drop the result
            return Err(ApiError::InvalidState(format!(
                "session already {:?}",
                session.state
            )));
        }
        session.state = SessionState::Stopped;
        session.final_transcript = Some(processed.text.clone());
        session.frames.clear();
        session.touch();
        info!(
            "Session {} stopped: {} segments, {} chars",
            id,
            output.total_segments,
            processed.text.len()
        );

        Ok(StopOutcome {
            session_id: id,
            final_transcript: output.final_transcript,
            processed_transcript: processed.text,
            total_chunks,
            total_segments: output.total_segments,
            duration_seconds: output.duration_seconds,
            per_segment: output.per_segment,
            merge_stats: output.merge_stats,
            postprocess_stats: processed.stats,
        })
    }

    /// Discard a session. Idempotent on an already-cancelled session.
    pub async fn cancel(&self, id: Uuid) -> Result<(), ApiError> {
        let entry = self.get(id)?;
        let mut session = entry.lock().await;
        match session.state {
            SessionState::Cancelled => Ok(()),
            state if state.is_terminal() => Err(ApiError::InvalidState(format!(
                "cannot cancel session in state {state:?}"
            ))),
            _ => {
                session.state = SessionState::Cancelled;
                session.cancel.cancel();
                session.frames.clear();
                session.touch();
                info!("Session {} cancelled", id);
                Ok(())
            }
        }
    }

    pub async fn status(&self, id: Uuid) -> Result<SessionSnapshot, ApiError> {
        let entry = self.get(id)?;
        let session = entry.lock().await;
        let partial_transcript = session.partial.read().unwrap().clone();
        Ok(SessionSnapshot {
            session_id: session.id,
            state: session.state,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            app_hint: session.app_hint.clone(),
            pending_chunks: session.pending_chunks,
            audio_seconds: session.audio_samples() as f32 / SAMPLE_RATE as f32,
            partial_transcript,
            final_transcript: session.final_transcript.clone(),
        })
    }

    /// Best-effort partial transcript
    pub async fn preview(&self, id: Uuid) -> Result<String, ApiError> {
        let entry = self.get(id)?;
        let session = entry.lock().await;
        let partial_transcript = session.partial.read().unwrap().clone();
        Ok(partial_transcript)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// One reaper pass: expire idle sessions, drop old terminal ones.
    pub async fn sweep_once(&self) {
        let entries: Vec<(Uuid, Arc<AsyncMutex<Session>>)> = {
            let sessions = self.sessions.lock().unwrap();
            sessions.iter().map(|(k, v)| (*k, v.clone())).collect()
        };

        let ttl = self.config.session_ttl;
        let mut remove = Vec::new();
        for (id, entry) in entries {
            let mut session = entry.lock().await;
            let idle = session.last_activity.elapsed();
            if idle < ttl {
                continue;
            }
            if session.state.is_terminal() {
                remove.push(id);
            } else {
                warn!("Session {} idle for {:?}, expiring", id, idle);
                session.state = SessionState::Expired;
                session.cancel.cancel();
                session.frames.clear();
            }
        }

        if !remove.is_empty() {
            let mut sessions = self.sessions.lock().unwrap();
            for id in &remove {
                sessions.remove(id);
            }
            debug!("Reaped {} terminal sessions", remove.len());
        }
    }

    /// Spawn the periodic reaper task
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                manager.sweep_once().await;
            }
        })
    }

    /// Cancel every live session; part of process shutdown
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<AsyncMutex<Session>>> = {
            let sessions = self.sessions.lock().unwrap();
            sessions.values().cloned().collect()
        };
        for entry in entries {
            let mut session = entry.lock().await;
            if !session.state.is_terminal() {
                session.state = SessionState::Cancelled;
                session.cancel.cancel();
                session.frames.clear();
            }
        }
    }
}

/// Forward pipeline progress into the shared partial transcript (and on to
/// an optional downstream listener)
fn spawn_partial_forwarder(
    partial: Arc<RwLock<String>>,
    downstream: Option<ProgressSender>,
) -> (ProgressSender, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<PipelineProgress>();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            *partial.write().unwrap() = event.partial_text.clone();
            if let Some(ref sender) = downstream {
                let _ = sender.send(event);
            }
        }
    });
    (tx, task)
}
