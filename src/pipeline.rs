//! Pipeline orchestration: segments in, merged transcript out.
//!
//! Runs the recognizer over an ordered segment list, isolates per-segment
//! failures, emits progress at each segment boundary and merges the results
//! in index order. Cancellation is cooperative; the flag is polled between
//! segments and in-flight recognizer calls finish but their output is
//! discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::{samples_to_f32, AudioFrame, SAMPLE_RATE};
use crate::merge::{merge, MergeStats, MergeStrategy};
use crate::recognizer::{RecognizerHandle, Transcription};
use crate::segmenter::Segment;

/// Trailing words of merged text offered to the recognizer as context
const CONTEXT_WORDS: usize = 50;

/// Shared cooperative cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress emitted after each completed segment
#[derive(Debug, Clone)]
pub struct PipelineProgress {
    pub current: usize,
    pub total: usize,
    pub message: String,
    /// Running merged transcript up to this segment
    pub partial_text: String,
    /// Text of just this segment
    pub segment_text: String,
}

pub type ProgressSender = mpsc::UnboundedSender<PipelineProgress>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("recognizer failed on every segment: {0}")]
    RecognizerFailed(String),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    pub final_transcript: String,
    pub per_segment: Vec<Transcription>,
    pub merge_stats: MergeStats,
    /// Silence positions in the merged text, for paragraph heuristics
    pub silence_breaks: Vec<usize>,
    pub total_segments: usize,
    pub duration_seconds: f32,
}

/// Orchestrates recognition over one segmented buffer.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    recognizer: RecognizerHandle,
    concurrency: usize,
}

impl PipelineOrchestrator {
    pub fn new(recognizer: RecognizerHandle, concurrency: usize) -> Self {
        Self {
            recognizer,
            concurrency: concurrency.max(1),
        }
    }

    /// Transcribe all segments of `audio` and merge the results.
    ///
    /// Segment results always come back in index order; with concurrency
    /// above one, recognition is pipelined and out-of-order completions are
    /// buffered. Failing segments contribute empty transcriptions; the whole
    /// invocation fails only when every segment does.
    pub async fn run(
        &self,
        audio: &AudioFrame,
        segments: Vec<Segment>,
        language: &str,
        merge_strategy: MergeStrategy,
        cancel: &CancelFlag,
        progress: Option<&ProgressSender>,
    ) -> Result<PipelineOutput, PipelineError> {
        let total = segments.len();
        let duration_seconds = audio.duration_seconds();
        if total == 0 {
            return Ok(PipelineOutput {
                merge_stats: MergeStats {
                    strategy: merge_strategy.as_str().to_string(),
                    ..Default::default()
                },
                duration_seconds,
                ..Default::default()
            });
        }

        info!(
            "Pipeline start: {} segments over {:.1}s of audio",
            total, duration_seconds
        );

        let results = if self.concurrency == 1 {
            self.run_sequential(audio, &segments, language, merge_strategy, cancel, progress)
                .await?
        } else {
            self.run_pipelined(audio, &segments, language, merge_strategy, cancel, progress)
                .await?
        };

        // Only a full wipe-out is a pipeline failure
        if results.iter().all(|t| t.error.is_some()) {
            let first = results
                .iter()
                .find_map(|t| t.error.clone())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(PipelineError::RecognizerFailed(first));
        }

        let failed = results.iter().filter(|t| t.error.is_some()).count();
        if failed > 0 {
            warn!("{}/{} segments failed recognition", failed, total);
        }

        let merged = merge(&segments, &results, merge_strategy);
        Ok(PipelineOutput {
            final_transcript: merged.text,
            per_segment: results,
            merge_stats: merged.stats,
            silence_breaks: merged.silence_breaks,
            total_segments: total,
            duration_seconds,
        })
    }

    /// Default path: one segment at a time, feeding the merged tail back to
    /// the recognizer as context.
    async fn run_sequential(
        &self,
        audio: &AudioFrame,
        segments: &[Segment],
        language: &str,
        merge_strategy: MergeStrategy,
        cancel: &CancelFlag,
        progress: Option<&ProgressSender>,
    ) -> Result<Vec<Transcription>, PipelineError> {
        let mut results: Vec<Transcription> = Vec::with_capacity(segments.len());
        let mut context = String::new();

        for segment in segments {
            if cancel.is_cancelled() {
                info!("Pipeline cancelled at segment {}", segment.index);
                return Err(PipelineError::Cancelled);
            }

            let context_ref = if context.is_empty() {
                None
            } else {
                Some(context.as_str())
            };
            let result = self
                .recognize_segment(audio, segment, language, context_ref)
                .await;

            if result.error.is_none() && !result.text.is_empty() {
                context.push(' ');
                context.push_str(&result.text);
                context = tail_words(&context, CONTEXT_WORDS);
            }

            results.push(result);
            emit_progress(progress, segments, &results, merge_strategy);
        }
        Ok(results)
    }

    /// Pipelined path for re-entrant recognizers: bounded concurrency with
    /// in-order emission. No rolling context; segments are independent.
    async fn run_pipelined(
        &self,
        audio: &AudioFrame,
        segments: &[Segment],
        language: &str,
        merge_strategy: MergeStrategy,
        cancel: &CancelFlag,
        progress: Option<&ProgressSender>,
    ) -> Result<Vec<Transcription>, PipelineError> {
        let futures = segments.iter().cloned().map(|segment| {
            let this = self.clone();
            let audio = audio.clone();
            let language = language.to_string();
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(this.recognize_segment(&audio, &segment, &language, None).await)
            }
        });

        let mut ordered = stream::iter(futures).buffered(self.concurrency);
        let mut results: Vec<Transcription> = Vec::with_capacity(segments.len());

        while let Some(item) = ordered.next().await {
            // Dropping the stream below discards whatever completed out of
            // order behind this point
            if cancel.is_cancelled() {
                info!("Pipeline cancelled after {} segments", results.len());
                return Err(PipelineError::Cancelled);
            }
            let Some(result) = item else {
                return Err(PipelineError::Cancelled);
            };
            results.push(result);
            emit_progress(progress, segments, &results, merge_strategy);
        }
        Ok(results)
    }

    async fn recognize_segment(
        &self,
        audio: &AudioFrame,
        segment: &Segment,
        language: &str,
        context: Option<&str>,
    ) -> Transcription {
        let samples = &audio.samples()[segment.start_sample..segment.end_sample];
        let floats = samples_to_f32(samples);

        debug!(
            "Recognizing segment {} ({:.1}s-{:.1}s)",
            segment.index,
            segment.start_sample as f32 / SAMPLE_RATE as f32,
            segment.end_sample as f32 / SAMPLE_RATE as f32
        );

        match self.recognizer.transcribe(&floats, language, context).await {
            Ok(raw) => Transcription::from_raw(segment.index, raw),
            Err(e) => {
                warn!("Segment {} failed: {}", segment.index, e);
                Transcription::failed(segment.index, e.to_string())
            }
        }
    }
}

fn emit_progress(
    progress: Option<&ProgressSender>,
    segments: &[Segment],
    results: &[Transcription],
    merge_strategy: MergeStrategy,
) {
    let Some(sender) = progress else {
        return;
    };
    let current = results.len();
    let total = segments.len();
    let partial = merge(segments, results, merge_strategy);
    let last = results.last();
    let _ = sender.send(PipelineProgress {
        current,
        total,
        message: format!("Transcribed segment {current}/{total}"),
        partial_text: partial.text,
        segment_text: last.map(|t| t.text.clone()).unwrap_or_default(),
    });
}

/// Keep the last `n` whitespace-separated words
fn tail_words(text: &str, n: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= n {
        return words.join(" ");
    }
    words[words.len() - n..].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::testing::ScriptedRecognizer;
    use crate::segmenter::{Segmenter, Strategy};
    use std::time::Duration;

    fn make_orchestrator(
        backend: ScriptedRecognizer,
        concurrency: usize,
    ) -> (Arc<ScriptedRecognizer>, PipelineOrchestrator) {
        let backend = Arc::new(backend);
        let handle = RecognizerHandle::new(
            backend.clone(),
            concurrency,
            std::env::temp_dir().join("transcription-server-tests"),
        );
        (backend.clone(), PipelineOrchestrator::new(handle, concurrency))
    }

    fn speech_frame(seconds: f32) -> AudioFrame {
        let n = (seconds * SAMPLE_RATE as f32) as usize;
        AudioFrame::new(
            (0..n)
                .map(|i| if i % 2 == 0 { 8000i16 } else { -8000 })
                .collect(),
        )
    }

    fn fixed_segments(audio: &AudioFrame) -> Vec<Segment> {
        let mut config = crate::config::SegmenterConfig::default();
        config.chunk_duration = 10.0;
        config.overlap = 0.0;
        Segmenter::new(config).segment(audio.samples(), Strategy::Fixed)
    }

    #[tokio::test]
    async fn test_happy_path_merges_in_order() {
        let (_, orchestrator) = make_orchestrator(ScriptedRecognizer::new("part"), 1);
        let audio = speech_frame(30.0);
        let segments = fixed_segments(&audio);
        assert_eq!(segments.len(), 3);

        let output = orchestrator
            .run(
                &audio,
                segments,
                "en",
                MergeStrategy::Simple,
                &CancelFlag::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(output.final_transcript, "part part part");
        assert_eq!(output.per_segment.len(), 3);
        for (i, t) in output.per_segment.iter().enumerate() {
            assert_eq!(t.segment_index, i);
        }
    }

    #[tokio::test]
    async fn test_pipelined_results_stay_ordered() {
        let backend = ScriptedRecognizer::new("chunk").with_delay(Duration::from_millis(20));
        let (_, orchestrator) = make_orchestrator(backend, 3);
        let audio = speech_frame(50.0);
        let segments = fixed_segments(&audio);
        assert_eq!(segments.len(), 5);

        let output = orchestrator
            .run(
                &audio,
                segments,
                "en",
                MergeStrategy::Simple,
                &CancelFlag::new(),
                None,
            )
            .await
            .unwrap();

        let indices: Vec<usize> = output.per_segment.iter().map(|t| t.segment_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        // Segment 1 fails both the call and its retry
        let backend = ScriptedRecognizer::new("ok")
            .fail_call(1, "inference exploded")
            .fail_call(2, "inference exploded again");
        let (_, orchestrator) = make_orchestrator(backend, 1);
        let audio = speech_frame(30.0);
        let segments = fixed_segments(&audio);

        let output = orchestrator
            .run(
                &audio,
                segments,
                "en",
                MergeStrategy::Simple,
                &CancelFlag::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(output.final_transcript, "ok ok");
        assert!(output.per_segment[1].error.is_some());
        assert!(output.per_segment[1].text.is_empty());
        assert!(output.per_segment[0].error.is_none());
        assert!(output.per_segment[2].error.is_none());
    }

    #[tokio::test]
    async fn test_all_segments_failing_fails_pipeline() {
        let mut backend = ScriptedRecognizer::new("never");
        // Every call and every retry fails
        for call in 0..12 {
            backend = backend.fail_call(call, "model gone");
        }
        let (_, orchestrator) = make_orchestrator(backend, 1);
        let audio = speech_frame(30.0);
        let segments = fixed_segments(&audio);

        let err = orchestrator
            .run(
                &audio,
                segments,
                "en",
                MergeStrategy::Simple,
                &CancelFlag::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RecognizerFailed(_)));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let (backend, orchestrator) = make_orchestrator(ScriptedRecognizer::new("x"), 1);
        let audio = speech_frame(30.0);
        let segments = fixed_segments(&audio);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = orchestrator
            .run(&audio, segments, "en", MergeStrategy::Simple, &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_complete() {
        let (_, orchestrator) = make_orchestrator(ScriptedRecognizer::new("word"), 1);
        let audio = speech_frame(40.0);
        let segments = fixed_segments(&audio);
        let (tx, mut rx) = mpsc::unbounded_channel();

        orchestrator
            .run(
                &audio,
                segments,
                "en",
                MergeStrategy::Simple,
                &CancelFlag::new(),
                Some(&tx),
            )
            .await
            .unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 4);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.current, i + 1);
            assert_eq!(event.total, 4);
            assert_eq!(event.segment_text, "word");
        }
        // Partial transcript grows with each segment
        assert_eq!(events[0].partial_text, "word");
        assert_eq!(events[3].partial_text, "word word word word");
    }

    #[tokio::test]
    async fn test_empty_segment_list() {
        let (_, orchestrator) = make_orchestrator(ScriptedRecognizer::new("x"), 1);
        let audio = AudioFrame::new(Vec::new());
        let output = orchestrator
            .run(
                &audio,
                Vec::new(),
                "en",
                MergeStrategy::Simple,
                &CancelFlag::new(),
                None,
            )
            .await
            .unwrap();
        assert!(output.final_transcript.is_empty());
        assert_eq!(output.total_segments, 0);
    }

    #[test]
    fn test_tail_words() {
        assert_eq!(tail_words("a b c d", 2), "c d");
        assert_eq!(tail_words("a b", 5), "a b");
        assert_eq!(tail_words("", 5), "");
    }
}
