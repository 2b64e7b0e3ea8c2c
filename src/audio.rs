//! Audio ingestion and format handling.
//!
//! Everything downstream of this module works on canonical PCM: 16-bit
//! signed samples, 16 kHz, mono. This module owns the conversions to get
//! there — raw octet-stream framing, WAV decode via hound, and an ffmpeg
//! fallback for compressed uploads.

use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;

use rubato::{FftFixedIn, Resampler};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Canonical sample rate for the whole service
pub const SAMPLE_RATE: u32 = 16_000;

/// Samples per millisecond at the canonical rate
pub const SAMPLES_PER_MS: usize = 16;

/// File extensions accepted on upload endpoints
pub const ACCEPTED_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a", "flac", "ogg", "aac"];

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("PCM byte count {0} is not a whole number of 16-bit samples")]
    OddByteCount(usize),

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("audio decode failed: {0}")]
    DecodeFailed(String),
}

/// An immutable block of canonical PCM.
///
/// Cheap to clone; the sample storage is shared.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    /// Build a frame from little-endian PCM bytes.
    ///
    /// Fails when the byte count is not a multiple of 2; a split sample can
    /// only mean a framing bug on the client side.
    pub fn from_pcm_bytes(bytes: &[u8]) -> Result<Self, AudioError> {
        if bytes.len() % 2 != 0 {
            return Err(AudioError::OddByteCount(bytes.len()));
        }
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self::new(samples))
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_seconds(&self) -> f32 {
        self.samples.len() as f32 / SAMPLE_RATE as f32
    }

    /// Concatenate an ordered sequence of frames into one new frame
    pub fn concat(frames: &[AudioFrame]) -> AudioFrame {
        let total: usize = frames.iter().map(|f| f.len()).sum();
        let mut samples = Vec::with_capacity(total);
        for frame in frames {
            samples.extend_from_slice(&frame.samples);
        }
        AudioFrame::new(samples)
    }
}

/// Convert canonical PCM to normalized f32 in [-1.0, 1.0]
pub fn samples_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Convert normalized f32 back to i16 with clamping
pub fn f32_to_samples(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// True when the buffer starts with a RIFF/WAVE header
pub fn looks_like_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Encode canonical PCM as an in-memory WAV file
pub fn encode_wav(samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        // Writing i16 into an in-memory cursor cannot fail
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .expect("WAV header write to memory buffer");
        for &sample in samples {
            writer.write_sample(sample).expect("WAV sample write");
        }
        writer.finalize().expect("WAV finalize");
    }
    cursor.into_inner()
}

/// Decode a WAV file to canonical PCM.
///
/// Accepts any channel count, bit depth and sample rate hound understands;
/// mixes down to mono and resamples to 16 kHz as needed.
pub fn decode_wav(bytes: &[u8]) -> Result<Vec<i16>, AudioError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| AudioError::DecodeFailed(e.to_string()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AudioError::DecodeFailed(e.to_string()))?,
        hound::SampleFormat::Int => {
            let full_scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AudioError::DecodeFailed(e.to_string()))?
        }
    };

    // Mix down to mono by averaging channels
    let mono: Vec<f32> = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    let resampled = if spec.sample_rate == SAMPLE_RATE {
        mono
    } else {
        resample(&mono, spec.sample_rate)?
    };

    Ok(f32_to_samples(&resampled))
}

/// Resample mono f32 audio to the canonical rate
fn resample(input: &[f32], src_rate: u32) -> Result<Vec<f32>, AudioError> {
    if input.is_empty() {
        return Ok(Vec::new());
    }

    const CHUNK: usize = 1024;
    let mut resampler = FftFixedIn::<f32>::new(
        src_rate as usize,
        SAMPLE_RATE as usize,
        CHUNK,
        2,
        1,
    )
    .map_err(|e| AudioError::DecodeFailed(format!("resampler init: {e}")))?;

    let expected = (input.len() as f64 * SAMPLE_RATE as f64 / src_rate as f64).round() as usize;
    let mut output = Vec::with_capacity(expected + CHUNK);
    let mut out_buffer = resampler.output_buffer_allocate(true);
    let mut in_buffer = vec![vec![0.0f32; CHUNK]];

    // One extra zero chunk flushes the FFT latency tail
    let chunks = input.len().div_ceil(CHUNK) + 1;
    for i in 0..chunks {
        let start = i * CHUNK;
        in_buffer[0].fill(0.0);
        if start < input.len() {
            let end = (start + CHUNK).min(input.len());
            in_buffer[0][..end - start].copy_from_slice(&input[start..end]);
        }
        let (_, produced) = resampler
            .process_into_buffer(&in_buffer, &mut out_buffer, None)
            .map_err(|e| AudioError::DecodeFailed(format!("resampling: {e}")))?;
        output.extend_from_slice(&out_buffer[0][..produced]);
    }

    output.truncate(expected);
    debug!(
        "Resampled {} samples at {} Hz to {} samples at {} Hz",
        input.len(),
        src_rate,
        output.len(),
        SAMPLE_RATE
    );
    Ok(output)
}

/// Check an uploaded filename against the accepted extension list
pub fn extension_accepted(filename: &str) -> bool {
    filename
        .rsplit('.')
        .next()
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            ACCEPTED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Decode an uploaded file to canonical PCM.
///
/// WAV goes through hound directly; everything else is piped through ffmpeg
/// to s16le 16 kHz mono.
pub async fn decode_upload(bytes: Vec<u8>, filename: &str) -> Result<Vec<i16>, AudioError> {
    if !extension_accepted(filename) {
        return Err(AudioError::UnsupportedFormat(filename.to_string()));
    }

    if looks_like_wav(&bytes) {
        return tokio::task::spawn_blocking(move || decode_wav(&bytes))
            .await
            .map_err(|e| AudioError::DecodeFailed(format!("decode task: {e}")))?;
    }

    decode_with_ffmpeg(&bytes).await
}

/// Pipe compressed audio through ffmpeg and read back canonical PCM
async fn decode_with_ffmpeg(bytes: &[u8]) -> Result<Vec<i16>, AudioError> {
    let mut child = tokio::process::Command::new("ffmpeg")
        .args([
            "-i", "pipe:0", "-f", "s16le", "-ar", "16000", "-ac", "1", "-loglevel", "error",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| AudioError::DecodeFailed(format!("ffmpeg unavailable: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| AudioError::DecodeFailed("ffmpeg stdin unavailable".to_string()))?;
    let owned = bytes.to_vec();
    tokio::spawn(async move {
        let _ = stdin.write_all(&owned).await;
        let _ = stdin.shutdown().await;
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| AudioError::DecodeFailed(format!("ffmpeg: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("ffmpeg decode failed: {}", stderr.trim());
        return Err(AudioError::DecodeFailed(stderr.trim().to_string()));
    }

    Ok(output
        .stdout
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}
