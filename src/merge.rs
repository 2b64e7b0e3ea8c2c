//! Merging per-segment transcriptions into one transcript.
//!
//! `simple` concatenates, `overlap` deduplicates the shared audio window
//! between consecutive segments at word granularity, `smart` additionally
//! turns long inter-segment silences into sentence/paragraph boundaries.

use serde::{Deserialize, Serialize};

use crate::audio::SAMPLE_RATE;
use crate::recognizer::Transcription;
use crate::segmenter::Segment;

/// Inter-segment silence that produces a paragraph break, in samples
const SILENCE_BREAK_SAMPLES: usize = (0.8 * SAMPLE_RATE as f32) as usize;

/// Spoken-word rate estimate used to bound the overlap search window when
/// the recognizer gives no word timings
const WORDS_PER_SECOND: f32 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    Simple,
    Overlap,
    Smart,
}

impl MergeStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(Self::Simple),
            "overlap" => Some(Self::Overlap),
            "smart" => Some(Self::Smart),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Overlap => "overlap",
            Self::Smart => "smart",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeStats {
    pub strategy: String,
    pub segments_merged: usize,
    pub overlap_words_dropped: usize,
    pub paragraph_breaks: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutput {
    pub text: String,
    /// Byte offsets into `text` where a long silence sits between segments;
    /// consumed by the post-processor's paragraph heuristics. Empty for
    /// `smart`, which materializes the breaks itself.
    pub silence_breaks: Vec<usize>,
    pub stats: MergeStats,
}

/// Merge transcriptions (ordered by segment index) into one transcript.
pub fn merge(
    segments: &[Segment],
    transcriptions: &[Transcription],
    strategy: MergeStrategy,
) -> MergeOutput {
    // Keep only segments that produced text, with their audio spans
    let mut parts: Vec<(Segment, String)> = transcriptions
        .iter()
        .filter(|t| !t.text.trim().is_empty())
        .filter_map(|t| {
            segments
                .get(t.segment_index)
                .map(|s| (s.clone(), t.text.trim().to_string()))
        })
        .collect();

    let mut stats = MergeStats {
        strategy: strategy.as_str().to_string(),
        segments_merged: parts.len(),
        ..Default::default()
    };

    if matches!(strategy, MergeStrategy::Overlap | MergeStrategy::Smart) {
        stats.overlap_words_dropped = dedup_overlaps(&mut parts);
        parts.retain(|(_, text)| !text.is_empty());
        stats.segments_merged = parts.len();
    }

    let mut text = String::new();
    let mut silence_breaks = Vec::new();
    let mut prev_end: Option<usize> = None;

    for (segment, part) in &parts {
        let long_gap = prev_end
            .map(|end| segment.start_sample.saturating_sub(end) >= SILENCE_BREAK_SAMPLES)
            .unwrap_or(false);

        if !text.is_empty() {
            if long_gap && strategy == MergeStrategy::Smart {
                // Close the sentence and open a paragraph
                if text.ends_with(|c: char| c.is_alphanumeric()) {
                    text.push('.');
                }
                text.push_str("\n\n");
                stats.paragraph_breaks += 1;
            } else {
                text.push(' ');
                if long_gap {
                    silence_breaks.push(text.len());
                }
            }
        }
        text.push_str(part);
        prev_end = Some(segment.end_sample);
    }

    let text = squeeze_spaces(&text);

    MergeOutput {
        text,
        silence_breaks,
        stats,
    }
}

/// Collapse runs of spaces without touching newlines
fn squeeze_spaces(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_space = false;
    for c in text.chars() {
        if c == ' ' {
            if !prev_space {
                out.push(c);
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    out.trim_matches(' ').to_string()
}

/// Word comparison form: lowercase, edge punctuation stripped
fn word_key(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

/// For each consecutive pair with recorded overlap, find the longest common
/// suffix-of-A / prefix-of-B at word granularity and keep it once. Returns
/// the total number of duplicate words dropped.
fn dedup_overlaps(parts: &mut [(Segment, String)]) -> usize {
    let mut dropped = 0usize;
    for i in 1..parts.len() {
        let overlap = parts[i].0.overlap_with_prev;
        if overlap == 0 {
            continue;
        }
        // Only the words that can sit within +-1s of the boundary
        let window_secs = overlap as f32 / SAMPLE_RATE as f32 + 1.0;
        let max_words = (window_secs * WORDS_PER_SECOND).ceil() as usize;

        let (head, tail) = parts.split_at_mut(i);
        let a = &mut head[i - 1].1;
        let b = &mut tail[0].1;

        let a_words: Vec<&str> = a.split_whitespace().collect();
        let b_words: Vec<&str> = b.split_whitespace().collect();
        let limit = max_words.min(a_words.len()).min(b_words.len());

        let mut common = 0usize;
        for k in (1..=limit).rev() {
            let suffix = &a_words[a_words.len() - k..];
            let prefix = &b_words[..k];
            if suffix
                .iter()
                .zip(prefix.iter())
                .all(|(x, y)| word_key(x) == word_key(y) && !word_key(x).is_empty())
            {
                common = k;
                break;
            }
        }
        if common == 0 {
            continue;
        }

        // Keep whichever rendition preserves more characters
        let a_suffix_len: usize = a_words[a_words.len() - common..]
            .iter()
            .map(|w| w.len())
            .sum();
        let b_prefix_len: usize = b_words[..common].iter().map(|w| w.len()).sum();

        if b_prefix_len > a_suffix_len {
            *a = a_words[..a_words.len() - common].join(" ");
        } else {
            *b = b_words[common..].join(" ");
        }
        dropped += common;
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(index: usize, start_secs: f32, end_secs: f32, overlap_secs: f32) -> Segment {
        Segment {
            index,
            start_sample: (start_secs * SAMPLE_RATE as f32) as usize,
            end_sample: (end_secs * SAMPLE_RATE as f32) as usize,
            overlap_with_prev: (overlap_secs * SAMPLE_RATE as f32) as usize,
        }
    }

    fn tx(index: usize, text: &str) -> Transcription {
        Transcription {
            segment_index: index,
            text: text.to_string(),
            language: None,
            speaker: None,
            words: None,
            error: None,
        }
    }

    #[test]
    fn test_simple_concatenation() {
        let segments = vec![seg(0, 0.0, 10.0, 0.0), seg(1, 10.0, 20.0, 0.0)];
        let transcriptions = vec![tx(0, "hello there"), tx(1, "general kenobi")];
        let output = merge(&segments, &transcriptions, MergeStrategy::Simple);
        assert_eq!(output.text, "hello there general kenobi");
        assert_eq!(output.stats.segments_merged, 2);
    }

    #[test]
    fn test_simple_skips_empty_segments() {
        let segments = vec![
            seg(0, 0.0, 10.0, 0.0),
            seg(1, 10.0, 20.0, 0.0),
            seg(2, 20.0, 30.0, 0.0),
        ];
        let transcriptions = vec![tx(0, "first"), tx(1, "  "), tx(2, "third")];
        let output = merge(&segments, &transcriptions, MergeStrategy::Simple);
        assert_eq!(output.text, "first third");
        assert_eq!(output.stats.segments_merged, 2);
    }

    #[test]
    fn test_simple_squeezes_whitespace() {
        let segments = vec![seg(0, 0.0, 10.0, 0.0)];
        let transcriptions = vec![tx(0, "  padded   text  ")];
        let output = merge(&segments, &transcriptions, MergeStrategy::Simple);
        assert_eq!(output.text, "padded text");
    }

    #[test]
    fn test_overlap_dedups_shared_words() {
        let segments = vec![seg(0, 0.0, 30.0, 0.0), seg(1, 28.0, 58.0, 2.0)];
        let transcriptions = vec![
            tx(0, "we decided to ship the feature"),
            tx(1, "ship the feature next quarter"),
        ];
        let output = merge(&segments, &transcriptions, MergeStrategy::Overlap);
        assert_eq!(output.text, "we decided to ship the feature next quarter");
        assert_eq!(output.stats.overlap_words_dropped, 3);
    }

    #[test]
    fn test_overlap_prefers_longer_rendition() {
        let segments = vec![seg(0, 0.0, 30.0, 0.0), seg(1, 28.0, 58.0, 2.0)];
        // B's rendition of the shared words carries punctuation: keep it
        let transcriptions = vec![
            tx(0, "meet me at the cafe"),
            tx(1, "at the cafe! it opens early"),
        ];
        let output = merge(&segments, &transcriptions, MergeStrategy::Overlap);
        assert_eq!(output.text, "meet me at the cafe! it opens early");
    }

    #[test]
    fn test_overlap_without_recorded_overlap_is_plain_concat() {
        let segments = vec![seg(0, 0.0, 10.0, 0.0), seg(1, 10.0, 20.0, 0.0)];
        let transcriptions = vec![tx(0, "repeat after me"), tx(1, "repeat after me")];
        let output = merge(&segments, &transcriptions, MergeStrategy::Overlap);
        assert_eq!(output.text, "repeat after me repeat after me");
        assert_eq!(output.stats.overlap_words_dropped, 0);
    }

    #[test]
    fn test_overlap_respects_word_window() {
        let segments = vec![seg(0, 0.0, 30.0, 0.0), seg(1, 28.0, 58.0, 2.0)];
        // Nine shared words exceed what fits in a 3s window at 3 words/s
        let long_echo = "one two three four five six seven eight nine";
        let transcriptions = vec![
            tx(0, &format!("intro {long_echo}")),
            tx(1, &format!("{long_echo} outro")),
        ];
        let output = merge(&segments, &transcriptions, MergeStrategy::Overlap);
        assert!(output.stats.overlap_words_dropped <= 9);
        assert!(output.text.starts_with("intro one"));
        assert!(output.text.ends_with("outro"));
    }

    #[test]
    fn test_smart_inserts_paragraph_at_long_silence() {
        // 2s gap between segments
        let segments = vec![seg(0, 0.0, 10.0, 0.0), seg(1, 12.0, 20.0, 0.0)];
        let transcriptions = vec![tx(0, "that wraps up the intro"), tx(1, "next topic")];
        let output = merge(&segments, &transcriptions, MergeStrategy::Smart);
        assert_eq!(output.text, "that wraps up the intro.\n\nnext topic");
        assert_eq!(output.stats.paragraph_breaks, 1);
        assert!(output.silence_breaks.is_empty());
    }

    #[test]
    fn test_smart_short_gap_no_break() {
        let segments = vec![seg(0, 0.0, 10.0, 0.0), seg(1, 10.5, 20.0, 0.0)];
        let transcriptions = vec![tx(0, "first"), tx(1, "second")];
        let output = merge(&segments, &transcriptions, MergeStrategy::Smart);
        assert_eq!(output.text, "first second");
        assert_eq!(output.stats.paragraph_breaks, 0);
    }

    #[test]
    fn test_simple_records_silence_breaks() {
        let segments = vec![seg(0, 0.0, 10.0, 0.0), seg(1, 12.0, 20.0, 0.0)];
        let transcriptions = vec![tx(0, "before the pause"), tx(1, "after the pause")];
        let output = merge(&segments, &transcriptions, MergeStrategy::Simple);
        assert_eq!(output.silence_breaks.len(), 1);
        let offset = output.silence_breaks[0];
        assert_eq!(&output.text[offset..], "after the pause");
    }

    #[test]
    fn test_all_empty_yields_empty_transcript() {
        let segments = vec![seg(0, 0.0, 10.0, 0.0)];
        let transcriptions = vec![tx(0, "")];
        let output = merge(&segments, &transcriptions, MergeStrategy::Simple);
        assert!(output.text.is_empty());
        assert_eq!(output.stats.segments_merged, 0);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(MergeStrategy::parse("overlap"), Some(MergeStrategy::Overlap));
        assert_eq!(MergeStrategy::parse("fancy"), None);
    }
}
