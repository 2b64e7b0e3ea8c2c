//! Long-audio segmentation.
//!
//! Splits one accumulated PCM buffer into an ordered list of segments for
//! the recognizer. Three strategies:
//!
//! - `fixed`: constant-length chunks with a configurable overlap
//! - `vad`: energy-envelope voice activity detection; segments are the
//!   speech regions between sufficiently long silences
//! - `hybrid`: VAD first, then any region longer than `max_chunk_duration`
//!   is re-split at energy minima within the target length band
//!
//! The segmenter never touches sample data beyond reading it; segments are
//! index ranges over the caller's buffer.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audio::SAMPLE_RATE;
use crate::config::SegmenterConfig;

/// Envelope frame length: 25 ms at 16 kHz
const FRAME_SAMPLES: usize = 400;
/// Envelope hop: 10 ms at 16 kHz
const HOP_SAMPLES: usize = 160;

/// Segmentation strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Fixed,
    Vad,
    Hybrid,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(Self::Fixed),
            "vad" => Some(Self::Vad),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Vad => "vad",
            Self::Hybrid => "hybrid",
        }
    }
}

/// A contiguous slice `[start_sample, end_sample)` over one audio buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Dense 0-based position in emission order
    pub index: usize,
    pub start_sample: usize,
    pub end_sample: usize,
    /// Samples shared with the previous segment; non-zero only when the
    /// strategy explicitly produced overlap
    pub overlap_with_prev: usize,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.end_sample.saturating_sub(self.start_sample)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duration_seconds(&self) -> f32 {
        self.len() as f32 / SAMPLE_RATE as f32
    }
}

/// Splits audio buffers according to a [`SegmenterConfig`]
#[derive(Debug, Clone)]
pub struct Segmenter {
    config: SegmenterConfig,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    /// Segment a buffer with the given strategy.
    ///
    /// Output indices are dense 0..N-1 and ordered by start sample. An empty
    /// buffer yields no segments.
    pub fn segment(&self, samples: &[i16], strategy: Strategy) -> Vec<Segment> {
        if samples.is_empty() {
            return Vec::new();
        }

        let mut segments = match strategy {
            Strategy::Fixed => self.fixed(samples.len()),
            Strategy::Vad => self.vad_regions(samples),
            Strategy::Hybrid => self.hybrid(samples),
        };

        for (i, segment) in segments.iter_mut().enumerate() {
            segment.index = i;
        }

        debug!(
            "Segmented {:.1}s of audio into {} segments ({})",
            samples.len() as f32 / SAMPLE_RATE as f32,
            segments.len(),
            strategy.as_str()
        );
        segments
    }

    fn chunk_samples(&self) -> usize {
        (self.config.chunk_duration * SAMPLE_RATE as f32) as usize
    }

    fn overlap_samples(&self) -> usize {
        (self.config.overlap * SAMPLE_RATE as f32) as usize
    }

    /// Fixed-length chunking with overlap. The last chunk takes whatever
    /// remains; an input shorter than one chunk is a single segment.
    fn fixed(&self, len: usize) -> Vec<Segment> {
        let chunk = self.chunk_samples().max(1);
        let overlap = self.overlap_samples().min(chunk.saturating_sub(1));

        let mut segments = Vec::new();
        let mut start = 0usize;
        loop {
            let end = (start + chunk).min(len);
            segments.push(Segment {
                index: 0,
                start_sample: start,
                end_sample: end,
                overlap_with_prev: if start == 0 { 0 } else { overlap },
            });
            if end == len {
                break;
            }
            start = end - overlap;
        }
        segments
    }

    /// RMS energy envelope over 25 ms frames at a 10 ms hop, as a fraction
    /// of full scale. Frame `i` starts at sample `i * HOP_SAMPLES`.
    fn energy_envelope(samples: &[i16]) -> Vec<f32> {
        if samples.len() < FRAME_SAMPLES {
            return vec![rms(samples)];
        }
        let n_frames = (samples.len() - FRAME_SAMPLES) / HOP_SAMPLES + 1;
        (0..n_frames)
            .map(|i| {
                let start = i * HOP_SAMPLES;
                rms(&samples[start..start + FRAME_SAMPLES])
            })
            .collect()
    }

    /// Voice activity detection: return the speech regions between silences.
    fn vad_regions(&self, samples: &[i16]) -> Vec<Segment> {
        let envelope = Self::energy_envelope(samples);
        let min_silence_samples =
            (self.config.min_silence_duration * SAMPLE_RATE as f32) as usize;
        let pad_samples = self.config.pad_ms as usize * SAMPLE_RATE as usize / 1000;

        // Collect silence regions as sample ranges
        let mut silences: Vec<(usize, usize)> = Vec::new();
        let mut run_start: Option<usize> = None;
        for (i, &energy) in envelope.iter().enumerate() {
            if energy < self.config.silence_threshold {
                run_start.get_or_insert(i);
            } else if let Some(first) = run_start.take() {
                push_silence(&mut silences, first, i - 1, samples.len(), min_silence_samples);
            }
        }
        if let Some(first) = run_start {
            push_silence(
                &mut silences,
                first,
                envelope.len() - 1,
                samples.len(),
                min_silence_samples,
            );
        }

        // Speech regions are the complement of the silences
        let mut regions: Vec<(usize, usize)> = Vec::new();
        let mut cursor = 0usize;
        for &(sil_start, sil_end) in &silences {
            if sil_start > cursor {
                regions.push((cursor, sil_start));
            }
            cursor = sil_end;
        }
        if cursor < samples.len() {
            regions.push((cursor, samples.len()));
        }

        // All silence: hand the whole buffer to the recognizer as one piece
        if regions.is_empty() {
            return vec![Segment {
                index: 0,
                start_sample: 0,
                end_sample: samples.len(),
                overlap_with_prev: 0,
            }];
        }

        regions
            .into_iter()
            .map(|(start, end)| Segment {
                index: 0,
                start_sample: start.saturating_sub(pad_samples),
                end_sample: (end + pad_samples).min(samples.len()),
                overlap_with_prev: 0,
            })
            .collect()
    }

    /// VAD, then re-split any region longer than `max_chunk_duration` at
    /// energy minima within the `[min_seg, max_seg]` band.
    fn hybrid(&self, samples: &[i16]) -> Vec<Segment> {
        let max_chunk = (self.config.max_chunk_duration * SAMPLE_RATE as f32) as usize;
        let envelope = Self::energy_envelope(samples);

        let mut out = Vec::new();
        for region in self.vad_regions(samples) {
            if region.len() <= max_chunk {
                out.push(region);
            } else {
                self.resplit(&envelope, &region, max_chunk, &mut out);
            }
        }
        out
    }

    /// Cut one long region into pieces no longer than `max_chunk`.
    ///
    /// Cut candidates are hop-aligned envelope frames inside the target
    /// band from the current start; the quietest frame wins, and among
    /// equal minima the later one wins (a cut at trailing silence beats an
    /// earlier equally-quiet one).
    fn resplit(
        &self,
        envelope: &[f32],
        region: &Segment,
        max_chunk: usize,
        out: &mut Vec<Segment>,
    ) {
        let min_seg = (self.config.min_seg * SAMPLE_RATE as f32) as usize;
        let max_seg = ((self.config.max_seg * SAMPLE_RATE as f32) as usize).min(max_chunk);
        let overlap = self.overlap_samples();

        let mut start = region.start_sample;
        let mut first = true;
        // The overlap-sized tolerance keeps a region just past the limit
        // from shedding a sliver tail segment.
        while region.end_sample - start > max_chunk + overlap {
            let window_lo = start + min_seg.min(max_seg);
            let window_hi = (start + max_seg).min(region.end_sample - 1);

            let cut = best_cut(envelope, window_lo, window_hi)
                .unwrap_or_else(|| (start + max_chunk).min(region.end_sample - 1));

            out.push(Segment {
                index: 0,
                start_sample: start,
                end_sample: cut,
                overlap_with_prev: if first { region.overlap_with_prev } else { overlap },
            });
            first = false;
            // Keep a little shared context across the cut
            start = cut.saturating_sub(overlap).max(start + 1);
        }
        out.push(Segment {
            index: 0,
            start_sample: start,
            end_sample: region.end_sample,
            overlap_with_prev: if first { region.overlap_with_prev } else { overlap },
        });
    }
}

/// RMS of a sample slice as a fraction of full scale
fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    ((sum_sq / samples.len() as f64) as f32).sqrt()
}

/// Record a quiet frame run `[first_frame, last_frame]` as a silence region
/// if it spans at least `min_silence_samples`.
fn push_silence(
    silences: &mut Vec<(usize, usize)>,
    first_frame: usize,
    last_frame: usize,
    buffer_len: usize,
    min_silence_samples: usize,
) {
    let start = first_frame * HOP_SAMPLES;
    let end = (last_frame * HOP_SAMPLES + FRAME_SAMPLES).min(buffer_len);
    if end - start >= min_silence_samples {
        silences.push((start, end));
    }
}

/// Quietest hop-aligned cut point in `[lo, hi]`, later wins ties.
fn best_cut(envelope: &[f32], lo: usize, hi: usize) -> Option<usize> {
    if lo > hi {
        return None;
    }
    let first_frame = lo.div_ceil(HOP_SAMPLES);
    let last_frame = (hi / HOP_SAMPLES).min(envelope.len().saturating_sub(1));
    if first_frame > last_frame {
        return None;
    }

    let mut best_frame = first_frame;
    let mut best_energy = envelope[first_frame];
    for frame in first_frame..=last_frame {
        if envelope[frame] <= best_energy {
            best_energy = envelope[frame];
            best_frame = frame;
        }
    }
    Some(best_frame * HOP_SAMPLES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert, prop_assert_eq, proptest};

    fn segmenter() -> Segmenter {
        Segmenter::new(SegmenterConfig::default())
    }

    /// Seconds of speech-shaped signal (mixed sines, well above threshold)
    fn speech(seconds: f32) -> Vec<i16> {
        let n = (seconds * SAMPLE_RATE as f32) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                let v = (2.0 * std::f32::consts::PI * 220.0 * t).sin() * 0.4
                    + (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.3;
                (v * 32767.0) as i16
            })
            .collect()
    }

    fn silence(seconds: f32) -> Vec<i16> {
        vec![0i16; (seconds * SAMPLE_RATE as f32) as usize]
    }

    fn assert_dense_ordered(segments: &[Segment]) {
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.index, i);
            if i > 0 {
                assert!(segments[i - 1].start_sample <= segment.start_sample);
            }
        }
    }

    #[test]
    fn test_empty_buffer_yields_nothing() {
        assert!(segmenter().segment(&[], Strategy::Hybrid).is_empty());
    }

    #[test]
    fn test_fixed_short_input_single_segment() {
        let samples = speech(5.0);
        let segments = segmenter().segment(&samples, Strategy::Fixed);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_sample, 0);
        assert_eq!(segments[0].end_sample, samples.len());
    }

    #[test]
    fn test_fixed_overlap_layout() {
        // 70s at chunk=30, overlap=2: [0,30), [28,58), [56,70)
        let samples = speech(70.0);
        let segments = segmenter().segment(&samples, Strategy::Fixed);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].start_sample, 0);
        assert_eq!(segments[0].end_sample, 30 * SAMPLE_RATE as usize);
        assert_eq!(segments[1].start_sample, 28 * SAMPLE_RATE as usize);
        assert_eq!(segments[1].overlap_with_prev, 2 * SAMPLE_RATE as usize);
        assert_eq!(segments[2].end_sample, samples.len());
        assert_dense_ordered(&segments);
    }

    #[test]
    fn test_fixed_zero_overlap_reconstructs_buffer() {
        let mut config = SegmenterConfig::default();
        config.overlap = 0.0;
        let samples = speech(95.0);
        let segments = Segmenter::new(config).segment(&samples, Strategy::Fixed);

        let mut rebuilt = Vec::new();
        for segment in &segments {
            rebuilt.extend_from_slice(&samples[segment.start_sample..segment.end_sample]);
        }
        assert_eq!(rebuilt, samples);
    }

    #[test]
    fn test_vad_splits_at_silence() {
        let mut samples = speech(4.0);
        samples.extend(silence(1.0));
        samples.extend(speech(4.0));

        let segments = segmenter().segment(&samples, Strategy::Vad);
        assert_eq!(segments.len(), 2);
        assert_dense_ordered(&segments);

        // The break must land inside the silent second
        let sil_start = 4 * SAMPLE_RATE as usize;
        let sil_end = 5 * SAMPLE_RATE as usize;
        assert!(segments[0].end_sample > sil_start - 4000);
        assert!(segments[0].end_sample < sil_end + 4000);
        assert!(segments[1].start_sample >= sil_start - 4000);
    }

    #[test]
    fn test_vad_ignores_short_silence() {
        // 200ms dip is below the 500ms minimum
        let mut samples = speech(3.0);
        samples.extend(silence(0.2));
        samples.extend(speech(3.0));

        let segments = segmenter().segment(&samples, Strategy::Vad);
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn test_vad_all_silence_single_segment() {
        let samples = silence(8.0);
        let segments = segmenter().segment(&samples, Strategy::Vad);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_sample, 0);
        assert_eq!(segments[0].end_sample, samples.len());
    }

    #[test]
    fn test_vad_padding_applied() {
        let mut samples = silence(2.0);
        samples.extend(speech(3.0));
        samples.extend(silence(2.0));

        let segments = segmenter().segment(&samples, Strategy::Vad);
        assert_eq!(segments.len(), 1);
        let pad = 100 * crate::audio::SAMPLES_PER_MS;
        let speech_start = 2 * SAMPLE_RATE as usize;
        // Segment should start close to speech onset minus padding
        assert!(segments[0].start_sample <= speech_start);
        assert!(segments[0].start_sample + pad + FRAME_SAMPLES >= speech_start);
    }

    #[test]
    fn test_hybrid_keeps_short_vad_segments() {
        let mut samples = speech(10.0);
        samples.extend(silence(1.0));
        samples.extend(speech(10.0));

        let segments = segmenter().segment(&samples, Strategy::Hybrid);
        assert_eq!(segments.len(), 2);
        assert_dense_ordered(&segments);
    }

    #[test]
    fn test_hybrid_resplits_long_region() {
        // 45s of continuous speech at max_chunk=20 must be re-split
        let samples = speech(45.0);
        let segments = segmenter().segment(&samples, Strategy::Hybrid);
        assert!(segments.len() >= 2, "expected re-split, got {segments:?}");
        assert_dense_ordered(&segments);
        for segment in &segments {
            // max_chunk plus the overlap tolerance
            assert!(
                segment.duration_seconds() <= 22.5,
                "segment too long: {:.1}s",
                segment.duration_seconds()
            );
        }
        // Interior pieces record the overlap carried across each cut
        assert!(segments[1].overlap_with_prev > 0);
    }

    #[test]
    fn test_hybrid_long_audio_scenario() {
        // 30s speech | 1s silence | 30s speech | 1s silence | 58s speech,
        // with max_chunk tuned to 30s: expect exactly 4 segments with breaks
        // inside both silences and one fixed split inside the trailing run.
        let mut config = SegmenterConfig::default();
        config.max_chunk_duration = 30.0;
        config.max_seg = 30.0;

        // Constant-envelope signal so the energy-minimum search degenerates
        // to the fixed cut (every candidate ties, later wins)
        let flat = |seconds: f32| -> Vec<i16> {
            (0..(seconds * SAMPLE_RATE as f32) as usize)
                .map(|i| if i % 2 == 0 { 13107 } else { -13107 })
                .collect()
        };

        let mut samples = flat(30.0);
        samples.extend(silence(1.0));
        samples.extend(flat(30.0));
        samples.extend(silence(1.0));
        samples.extend(flat(58.0));

        let segments = Segmenter::new(config).segment(&samples, Strategy::Hybrid);
        assert_eq!(segments.len(), 4, "{segments:?}");
        assert_dense_ordered(&segments);

        let sil1 = (30 * SAMPLE_RATE as usize, 31 * SAMPLE_RATE as usize);
        let sil2 = (61 * SAMPLE_RATE as usize, 62 * SAMPLE_RATE as usize);
        let slack = 4000;
        assert!(segments[0].end_sample >= sil1.0 - slack && segments[0].end_sample <= sil1.1 + slack);
        assert!(segments[1].end_sample >= sil2.0 - slack && segments[1].end_sample <= sil2.1 + slack);
        // The trailing 58s run splits once
        assert!(segments[2].end_sample < segments[3].start_sample + segments[3].overlap_with_prev + slack);
        assert_eq!(segments[3].end_sample, samples.len());
    }

    #[test]
    fn test_best_cut_prefers_later_on_ties() {
        let envelope = vec![0.5f32; 100];
        // All frames equal: the last candidate in range wins
        let cut = best_cut(&envelope, 0, 50 * HOP_SAMPLES).unwrap();
        assert_eq!(cut, 50 * HOP_SAMPLES);
    }

    #[test]
    fn test_best_cut_finds_minimum() {
        let mut envelope = vec![0.5f32; 100];
        envelope[30] = 0.01;
        let cut = best_cut(&envelope, 0, 99 * HOP_SAMPLES).unwrap();
        assert_eq!(cut, 30 * HOP_SAMPLES);
    }

    #[test]
    fn test_rms_of_silence_is_zero() {
        assert!(rms(&vec![0i16; 400]) < 1e-6);
    }

    #[test]
    fn test_rms_of_full_scale() {
        let loud = vec![i16::MAX; 400];
        assert!((rms(&loud) - 1.0).abs() < 0.01);
    }

    proptest! {
        #[test]
        fn prop_indices_dense_and_ordered(seconds in 1u32..90, strategy in 0usize..3) {
            let strategy = [Strategy::Fixed, Strategy::Vad, Strategy::Hybrid][strategy];
            let samples = speech(seconds as f32);
            let segments = segmenter().segment(&samples, strategy);
            prop_assert!(!segments.is_empty());
            for (i, segment) in segments.iter().enumerate() {
                prop_assert_eq!(segment.index, i);
                prop_assert!(segment.start_sample < segment.end_sample);
                prop_assert!(segment.end_sample <= samples.len());
                if i > 0 {
                    prop_assert!(segments[i - 1].start_sample <= segment.start_sample);
                }
            }
        }

        #[test]
        fn prop_fixed_zero_overlap_partitions(len in 1usize..400_000) {
            let mut config = SegmenterConfig::default();
            config.overlap = 0.0;
            let samples = vec![100i16; len];
            let segments = Segmenter::new(config).segment(&samples, Strategy::Fixed);
            let mut cursor = 0usize;
            for segment in &segments {
                prop_assert_eq!(segment.start_sample, cursor);
                cursor = segment.end_sample;
            }
            prop_assert_eq!(cursor, len);
        }
    }
}
