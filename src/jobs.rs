//! Asynchronous job queue for long uploads.
//!
//! Bounded-concurrency workers pull pending jobs FIFO and run the same
//! segment/transcribe/post-process pipeline the sessions use, with progress
//! written back after every segment. Job state and progress only move
//! forward; completed jobs are reaped after `job_ttl`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::AudioFrame;
use crate::config::Config;
use crate::error::ApiError;
use crate::merge::MergeStrategy;
use crate::pipeline::{CancelFlag, PipelineError, PipelineOrchestrator};
use crate::postprocess::{Mode, PostProcessor, ProfileCategory};
use crate::segmenter::{Segmenter, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Error recorded on a failed job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub kind: String,
}

/// Pipeline output stored on a completed job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub final_transcript: String,
    pub processed_transcript: String,
    pub total_segments: usize,
    pub duration_seconds: f32,
    pub per_segment: Vec<crate::recognizer::Transcription>,
    pub merge_stats: crate::merge::MergeStats,
    pub postprocess_stats: crate::postprocess::PostProcessStats,
}

/// Parameters captured at submission time
#[derive(Debug, Clone)]
pub struct JobParams {
    pub filename: String,
    pub language: Option<String>,
    pub strategy: Strategy,
    pub merge_strategy: MergeStrategy,
    pub postprocess_mode: Option<Mode>,
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            filename: String::new(),
            language: None,
            strategy: Strategy::Hybrid,
            merge_strategy: MergeStrategy::Simple,
            postprocess_mode: None,
        }
    }
}

struct Job {
    id: Uuid,
    state: JobState,
    progress: f64,
    progress_message: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    completed_instant: Option<Instant>,
    processing_seconds: Option<f64>,
    result: Option<JobResult>,
    error: Option<JobError>,
    audio: AudioFrame,
    params: JobParams,
    cancel: CancelFlag,
}

/// Wire-visible view of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub state: JobState,
    pub progress: f64,
    pub progress_message: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// Aggregate queue statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queue_depth: usize,
    pub max_concurrent: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_processing_seconds: Option<f64>,
}

struct JobsInner {
    jobs: HashMap<Uuid, Job>,
    pending: VecDeque<Uuid>,
}

/// The queue. One mutex guards the whole jobs map; it is never held across
/// recognizer I/O.
pub struct JobQueue {
    inner: Mutex<JobsInner>,
    notify: Notify,
    accepting: AtomicBool,
    shutdown: AtomicBool,
    config: Arc<Config>,
    segmenter: Segmenter,
    orchestrator: PipelineOrchestrator,
    postprocessor: Arc<PostProcessor>,
}

impl JobQueue {
    pub fn new(
        config: Arc<Config>,
        orchestrator: PipelineOrchestrator,
        postprocessor: Arc<PostProcessor>,
    ) -> Self {
        Self {
            inner: Mutex::new(JobsInner {
                jobs: HashMap::new(),
                pending: VecDeque::new(),
            }),
            notify: Notify::new(),
            accepting: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            segmenter: Segmenter::new(config.segmenter.clone()),
            config,
            orchestrator,
            postprocessor,
        }
    }

    /// Spawn the worker pool and the reaper
    pub fn start(self: &Arc<Self>) {
        for worker in 0..self.config.max_concurrent_jobs.max(1) {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                debug!("Job worker {} up", worker);
                queue.worker_loop().await;
                debug!("Job worker {} down", worker);
            });
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if queue.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                queue.sweep_once();
            }
        });
    }

    /// Queue a new job; it starts as `Pending` and is picked up FIFO.
    pub fn submit(&self, audio: AudioFrame, params: JobParams) -> Result<Uuid, ApiError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ApiError::ResourceExhausted("job queue is shut down".into()));
        }

        let job = Job {
            id: Uuid::new_v4(),
            state: JobState::Pending,
            progress: 0.0,
            progress_message: "queued".to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            completed_instant: None,
            processing_seconds: None,
            result: None,
            error: None,
            audio,
            params,
            cancel: CancelFlag::new(),
        };
        let id = job.id;

        {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.push_back(id);
            inner.jobs.insert(id, job);
        }
        info!("Job {} submitted", id);
        self.notify.notify_one();
        Ok(id)
    }

    pub fn status(&self, id: Uuid) -> Result<JobSnapshot, ApiError> {
        let inner = self.inner.lock().unwrap();
        inner
            .jobs
            .get(&id)
            .map(snapshot)
            .ok_or_else(|| ApiError::NotFound(format!("job {id}")))
    }

    /// Cancel a job. Pending jobs cancel immediately; processing jobs stop
    /// at the next segment boundary. Idempotent on cancelled jobs.
    pub fn cancel(&self, id: Uuid) -> Result<JobSnapshot, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;

        match job.state {
            JobState::Pending => {
                job.state = JobState::Cancelled;
                job.completed_at = Some(Utc::now());
                job.completed_instant = Some(Instant::now());
                job.progress_message = "cancelled".to_string();
                info!("Job {} cancelled while pending", id);
            }
            JobState::Processing => {
                // Cooperative: the worker flips the state at the next
                // segment boundary
                job.cancel.cancel();
                info!("Job {} cancel requested", id);
            }
            JobState::Cancelled => {}
            state => {
                return Err(ApiError::InvalidState(format!(
                    "cannot cancel job in state {state:?}"
                )))
            }
        }
        let snap = snapshot(job);
        // Drop the queue entry for immediate cancels
        inner.pending.retain(|p| *p != id);
        Ok(snap)
    }

    /// List jobs, newest first
    pub fn list(&self, state: Option<JobState>, limit: usize) -> Vec<JobSnapshot> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|j| state.map(|s| j.state == s).unwrap_or(true))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.into_iter().take(limit).map(snapshot).collect()
    }

    pub fn stats(&self) -> JobStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = JobStats {
            total: inner.jobs.len(),
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            queue_depth: inner.pending.len(),
            max_concurrent: self.config.max_concurrent_jobs,
            average_processing_seconds: None,
        };
        let mut durations = Vec::new();
        for job in inner.jobs.values() {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Processing => stats.processing += 1,
                JobState::Completed => {
                    stats.completed += 1;
                    if let Some(secs) = job.processing_seconds {
                        durations.push(secs);
                    }
                }
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
            }
        }
        if !durations.is_empty() {
            stats.average_processing_seconds =
                Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        stats
    }

    /// Remove terminal jobs older than `job_ttl`
    pub fn sweep_once(&self) {
        let ttl = self.config.job_ttl;
        let mut inner = self.inner.lock().unwrap();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| {
            !(job.state.is_terminal()
                && job
                    .completed_instant
                    .map(|at| at.elapsed() >= ttl)
                    .unwrap_or(false))
        });
        let removed = before - inner.jobs.len();
        if removed > 0 {
            debug!("Reaped {} expired jobs", removed);
        }
    }

    /// Stop admission, cancel pending work, wake the workers so they exit.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);

        let mut inner = self.inner.lock().unwrap();
        let pending: Vec<Uuid> = inner.pending.drain(..).collect();
        for id in pending {
            if let Some(job) = inner.jobs.get_mut(&id) {
                if job.state == JobState::Pending {
                    job.state = JobState::Cancelled;
                    job.completed_at = Some(Utc::now());
                    job.completed_instant = Some(Instant::now());
                    job.progress_message = "cancelled at shutdown".to_string();
                }
            }
        }
        for job in inner.jobs.values() {
            if job.state == JobState::Processing {
                job.cancel.cancel();
            }
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match self.claim_next() {
                Some(claim) => {
                    let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> =
                        Box::pin(self.process(claim));
                    fut.await
                }
                None => self.notify.notified().await,
            }
        }
    }

    fn claim_next(&self) -> Option<(Uuid, AudioFrame, JobParams, CancelFlag)> {
        let mut inner = self.inner.lock().unwrap();
        while let Some(id) = inner.pending.pop_front() {
            if let Some(job) = inner.jobs.get_mut(&id) {
                if job.state != JobState::Pending {
                    continue;
                }
                job.state = JobState::Processing;
                job.started_at = Some(Utc::now());
                job.progress_message = "processing".to_string();
                return Some((id, job.audio.clone(), job.params.clone(), job.cancel.clone()));
            }
        }
        None
    }

    async fn process(&self, (id, audio, params, cancel): (Uuid, AudioFrame, JobParams, CancelFlag)) {
        info!(
            "Job {} processing: {:.1}s of audio ({})",
            id,
            audio.duration_seconds(),
            params.strategy.as_str()
        );
        let started = Instant::now();
        let segments = self.segmenter.segment(audio.samples(), params.strategy);
        let language = params
            .language
            .clone()
            .unwrap_or_else(|| self.config.default_language.clone());

        // Progress sink updates the job record after each segment
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<crate::pipeline::PipelineProgress>();
        let pipeline: std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<crate::pipeline::PipelineOutput, PipelineError>> + Send + '_>,
        > = Box::pin(self.orchestrator.run(
            &audio,
            segments,
            &language,
            params.merge_strategy,
            &cancel,
            Some(&tx),
        ));
        tokio::pin!(pipeline);

        let result = loop {
            tokio::select! {
                event = rx.recv() => {
                    if let Some(event) = event {
                        self.update_progress(id, &event);
                    }
                }
                output = &mut pipeline => break output,
            }
        };
        // Drain whatever progress is left
        while let Ok(event) = rx.try_recv() {
            self.update_progress(id, &event);
        }

        match result {
            Ok(output) => {
                let mode = params
                    .postprocess_mode
                    .unwrap_or_else(|| self.postprocessor.default_mode());
                let processed = self
                    .postprocessor
                    .process(
                        &output.final_transcript,
                        mode,
                        ProfileCategory::General,
                        &output.silence_breaks,
                    )
                    .await;

                let result = JobResult {
                    final_transcript: output.final_transcript,
                    processed_transcript: processed.text,
                    total_segments: output.total_segments,
                    duration_seconds: output.duration_seconds,
                    per_segment: output.per_segment,
                    merge_stats: output.merge_stats,
                    postprocess_stats: processed.stats,
                };
                self.finish(id, JobState::Completed, Some(result), None, started);
            }
            Err(PipelineError::Cancelled) => {
                self.finish(id, JobState::Cancelled, None, None, started);
            }
            Err(PipelineError::RecognizerFailed(message)) => {
                warn!("Job {} failed: {}", id, message);
                let error = JobError {
                    message,
                    kind: "recognizer_failed".to_string(),
                };
                self.finish(id, JobState::Failed, None, Some(error), started);
            }
        }
    }

    fn update_progress(&self, id: Uuid, event: &crate::pipeline::PipelineProgress) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&id) {
            // 1.0 is reserved for Completed
            let fraction = (event.current as f64 / event.total.max(1) as f64).min(0.99);
            if fraction > job.progress {
                job.progress = fraction;
            }
            job.progress_message = event.message.clone();
        }
    }

    fn finish(
        &self,
        id: Uuid,
        state: JobState,
        result: Option<JobResult>,
        error: Option<JobError>,
        started: Instant,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return;
        };
        job.state = state;
        job.completed_at = Some(Utc::now());
        job.completed_instant = Some(Instant::now());
        job.processing_seconds = Some(started.elapsed().as_secs_f64());
        match state {
            JobState::Completed => {
                job.progress = 1.0;
                job.progress_message = "completed".to_string();
                job.result = result;
            }
            JobState::Cancelled => {
                job.progress_message = "cancelled".to_string();
            }
            JobState::Failed => {
                job.progress_message = "failed".to_string();
                job.error = error;
            }
            _ => {}
        }
        // Input audio is no longer needed
        job.audio = AudioFrame::new(Vec::new());
        info!("Job {} finished: {:?}", id, state);
    }
}

fn snapshot(job: &Job) -> JobSnapshot {
    JobSnapshot {
        job_id: job.id,
        state: job.state,
        progress: job.progress,
        progress_message: job.progress_message.clone(),
        filename: job.params.filename.clone(),
        created_at: job.created_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
        result: job.result.clone(),
        error: job.error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::PersonalDictionary;
    use crate::recognizer::testing::ScriptedRecognizer;
    use crate::recognizer::RecognizerHandle;
    use std::time::Duration;

    fn queue_with(backend: ScriptedRecognizer, mut config: Config) -> Arc<JobQueue> {
        config.max_concurrent_jobs = 2;
        let config = Arc::new(config);
        let handle = RecognizerHandle::new(
            Arc::new(backend),
            2,
            std::env::temp_dir().join("transcription-server-tests"),
        );
        let orchestrator = PipelineOrchestrator::new(handle, 1);
        let postprocessor = Arc::new(PostProcessor::new(Arc::new(PersonalDictionary::new()), None));
        let queue = Arc::new(JobQueue::new(config, orchestrator, postprocessor));
        queue.start();
        queue
    }

    fn loud_audio(seconds: f32) -> AudioFrame {
        let n = (seconds * crate::audio::SAMPLE_RATE as f32) as usize;
        AudioFrame::new(
            (0..n)
                .map(|i| if i % 2 == 0 { 8000i16 } else { -8000 })
                .collect(),
        )
    }

    async fn wait_for<F: Fn(&JobSnapshot) -> bool>(
        queue: &JobQueue,
        id: Uuid,
        predicate: F,
    ) -> JobSnapshot {
        for _ in 0..400 {
            let snap = queue.status(id).unwrap();
            if predicate(&snap) {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for job {id}");
    }

    #[tokio::test]
    async fn test_job_completes_with_result() {
        let queue = queue_with(ScriptedRecognizer::new("transcribed"), Config::default());
        let id = queue
            .submit(loud_audio(2.0), JobParams::default())
            .unwrap();

        let snap = wait_for(&queue, id, |s| s.state.is_terminal()).await;
        assert_eq!(snap.state, JobState::Completed);
        assert_eq!(snap.progress, 1.0);
        let result = snap.result.unwrap();
        assert_eq!(result.final_transcript, "transcribed");
        assert_eq!(result.processed_transcript, "transcribed");
        assert!(snap.started_at.is_some());
        assert!(snap.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_concurrency_bounded_and_fifo() {
        let backend = ScriptedRecognizer::new("x").with_delay(Duration::from_millis(150));
        let queue = queue_with(backend, Config::default());

        let ids: Vec<Uuid> = (0..5)
            .map(|_| queue.submit(loud_audio(1.0), JobParams::default()).unwrap())
            .collect();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let stats = queue.stats();
        assert!(stats.processing <= 2, "processing={}", stats.processing);
        assert_eq!(stats.total, 5);

        for id in &ids {
            let snap = wait_for(&queue, *id, |s| s.state.is_terminal()).await;
            assert_eq!(snap.state, JobState::Completed);
        }

        // FIFO: earlier submissions never start after later ones
        let starts: Vec<_> = ids
            .iter()
            .map(|id| queue.status(*id).unwrap().started_at.unwrap())
            .collect();
        for pair in starts.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let backend = ScriptedRecognizer::new("x").with_delay(Duration::from_millis(300));
        let queue = queue_with(backend, Config::default());

        // Fill both workers, then one more stays pending
        let _a = queue.submit(loud_audio(1.0), JobParams::default()).unwrap();
        let _b = queue.submit(loud_audio(1.0), JobParams::default()).unwrap();
        let c = queue.submit(loud_audio(1.0), JobParams::default()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = queue.cancel(c).unwrap();
        assert_eq!(snap.state, JobState::Cancelled);
        assert!(snap.result.is_none());

        // Idempotent
        assert_eq!(queue.cancel(c).unwrap().state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_processing_job_at_segment_boundary() {
        let backend = ScriptedRecognizer::new("piece").with_delay(Duration::from_millis(100));
        let mut config = Config::default();
        config.segmenter.chunk_duration = 1.0;
        config.segmenter.overlap = 0.0;
        let queue = queue_with(backend, config);

        let mut params = JobParams::default();
        params.strategy = Strategy::Fixed;
        // 8 one-second segments at 100ms each
        let id = queue.submit(loud_audio(8.0), params).unwrap();

        wait_for(&queue, id, |s| s.progress >= 0.3).await;
        queue.cancel(id).unwrap();

        let snap = wait_for(&queue, id, |s| s.state.is_terminal()).await;
        assert_eq!(snap.state, JobState::Cancelled);
        assert!(snap.result.is_none());
        assert!(snap.progress < 1.0);
    }

    #[tokio::test]
    async fn test_failed_job_records_error() {
        let mut backend = ScriptedRecognizer::new("never");
        for call in 0..8 {
            backend = backend.fail_call(call, "model offline");
        }
        let queue = queue_with(backend, Config::default());
        let id = queue.submit(loud_audio(2.0), JobParams::default()).unwrap();

        let snap = wait_for(&queue, id, |s| s.state.is_terminal()).await;
        assert_eq!(snap.state, JobState::Failed);
        let error = snap.error.unwrap();
        assert_eq!(error.kind, "recognizer_failed");
        assert!(error.message.contains("model offline"));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let backend = ScriptedRecognizer::new("p").with_delay(Duration::from_millis(40));
        let mut config = Config::default();
        config.segmenter.chunk_duration = 1.0;
        config.segmenter.overlap = 0.0;
        let queue = queue_with(backend, config);

        let mut params = JobParams::default();
        params.strategy = Strategy::Fixed;
        let id = queue.submit(loud_audio(6.0), params).unwrap();

        let mut observed = Vec::new();
        loop {
            let snap = queue.status(id).unwrap();
            observed.push(snap.progress);
            if snap.state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        for pair in observed.windows(2) {
            assert!(pair[1] >= pair[0], "progress went backward: {observed:?}");
        }
        assert_eq!(*observed.last().unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let queue = queue_with(ScriptedRecognizer::new("t"), Config::default());
        let a = queue.submit(loud_audio(1.0), JobParams::default()).unwrap();
        let b = queue.submit(loud_audio(1.0), JobParams::default()).unwrap();

        wait_for(&queue, a, |s| s.state.is_terminal()).await;
        wait_for(&queue, b, |s| s.state.is_terminal()).await;

        let all = queue.list(None, 50);
        assert_eq!(all.len(), 2);
        let completed = queue.list(Some(JobState::Completed), 50);
        assert_eq!(completed.len(), 2);
        let failed = queue.list(Some(JobState::Failed), 50);
        assert!(failed.is_empty());

        let stats = queue.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 2);
        assert!(stats.average_processing_seconds.is_some());
    }

    #[tokio::test]
    async fn test_reaper_removes_expired_jobs() {
        let mut config = Config::default();
        config.job_ttl = Duration::from_millis(0);
        let queue = queue_with(ScriptedRecognizer::new("t"), config);
        let id = queue.submit(loud_audio(1.0), JobParams::default()).unwrap();
        wait_for(&queue, id, |s| s.state.is_terminal()).await;

        queue.sweep_once();
        assert!(matches!(queue.status(id), Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unknown_job_not_found() {
        let queue = queue_with(ScriptedRecognizer::new("t"), Config::default());
        assert!(matches!(
            queue.status(Uuid::new_v4()),
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_and_rejects_new() {
        let backend = ScriptedRecognizer::new("x").with_delay(Duration::from_millis(200));
        let queue = queue_with(backend, Config::default());
        let _a = queue.submit(loud_audio(1.0), JobParams::default()).unwrap();
        let _b = queue.submit(loud_audio(1.0), JobParams::default()).unwrap();
        let c = queue.submit(loud_audio(1.0), JobParams::default()).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.shutdown();

        assert_eq!(queue.status(c).unwrap().state, JobState::Cancelled);
        assert!(queue
            .submit(loud_audio(1.0), JobParams::default())
            .is_err());
    }
}
