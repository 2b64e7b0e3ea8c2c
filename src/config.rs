//! Server configuration.
//!
//! The service receives a fully-populated [`Config`] at boot; nothing below
//! the binary entry point reads the environment or any file. `from_env`
//! exists for the standalone binary and layers `TRANSCRIBE_*` variables over
//! the defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default fixed-window quotas, per endpoint class, per minute
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub session_control: u32,
    pub audio_ingest: u32,
    pub session_read: u32,
    pub transcribe: u32,
    pub upload: u32,
    pub upload_long: u32,
    pub batch: u32,
    pub text: u32,
    pub postprocess_config: u32,
    pub job_submit: u32,
    pub job_poll: u32,
    pub job_control: u32,
    pub dictionary: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            session_control: 20,
            audio_ingest: 300,
            session_read: 60,
            transcribe: 10,
            upload: 10,
            upload_long: 5,
            batch: 3,
            text: 30,
            postprocess_config: 60,
            job_submit: 10,
            job_poll: 300,
            job_control: 60,
            dictionary: 60,
        }
    }
}

/// Segmentation defaults (seconds unless noted)
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Fixed-strategy chunk length
    pub chunk_duration: f32,
    /// Overlap between consecutive fixed chunks
    pub overlap: f32,
    /// RMS threshold (fraction of full scale) below which a frame is silence
    pub silence_threshold: f32,
    /// Minimum run of quiet frames to count as a silence region
    pub min_silence_duration: f32,
    /// Padding added around detected speech regions, in milliseconds
    pub pad_ms: u32,
    /// Hybrid: VAD segments longer than this are re-split
    pub max_chunk_duration: f32,
    /// Hybrid: preferred segment length band for energy-minimum cuts
    pub min_seg: f32,
    pub max_seg: f32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            chunk_duration: 30.0,
            overlap: 2.0,
            silence_threshold: 0.01,
            min_silence_duration: 0.5,
            pad_ms: 100,
            // The recognizer context window tops out near 30s of audio, so
            // re-split well below it.
            max_chunk_duration: 20.0,
            min_seg: 8.0,
            max_seg: 20.0,
        }
    }
}

/// Enhancer provider selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnhancerProvider {
    OpenAi,
    Gemini,
    Ollama,
    None,
}

impl EnhancerProvider {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAi),
            "gemini" => Some(Self::Gemini),
            "ollama" => Some(Self::Ollama),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Enhancer (cloud LLM) settings
#[derive(Debug, Clone)]
pub struct EnhancerConfig {
    pub provider: EnhancerProvider,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl Default for EnhancerConfig {
    fn default() -> Self {
        Self {
            provider: EnhancerProvider::None,
            base_url: String::new(),
            api_key: None,
            model: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Recognizer backend settings
#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    /// Base URL of the OpenAI-compatible transcription server
    pub server_url: String,
    pub model: String,
    /// Whether the backend tolerates concurrent inference requests
    pub reentrant: bool,
    /// Width of the inference semaphore when `reentrant` is true
    pub concurrency: usize,
    /// When true, a failed warm-up is fatal at boot (exit code 3)
    pub required: bool,
    pub timeout: Duration,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8001".to_string(),
            model: "large-v3-turbo".to_string(),
            reentrant: false,
            concurrency: 2,
            required: false,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Top-level configuration, handed to the server whole
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// When set, non-health requests must carry this key in `X-API-Key`
    pub api_key: Option<String>,

    /// Idle sessions past this age are expired and reaped
    pub session_ttl: Duration,
    /// Per-session accumulated audio cap, in seconds
    pub max_session_audio_seconds: u32,

    /// Completed jobs past this age are deleted
    pub job_ttl: Duration,
    pub max_concurrent_jobs: usize,

    /// Segment recognition concurrency inside one pipeline invocation
    pub pipeline_concurrency: usize,

    /// Default language hint when a request carries none
    pub default_language: String,

    pub segmenter: SegmenterConfig,
    pub recognizer: RecognizerConfig,
    pub enhancer: EnhancerConfig,
    pub rate_limits: RateLimits,

    /// WebSocket idle timeout
    pub ws_idle_timeout: Duration,

    /// Root for models/tmp/logs; nothing else is written
    pub runtime_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: ([127, 0, 0, 1], 8765).into(),
            api_key: None,
            session_ttl: Duration::from_secs(600),
            max_session_audio_seconds: 600,
            job_ttl: Duration::from_secs(24 * 3600),
            max_concurrent_jobs: 3,
            pipeline_concurrency: 1,
            default_language: "auto".to_string(),
            segmenter: SegmenterConfig::default(),
            recognizer: RecognizerConfig::default(),
            enhancer: EnhancerConfig::default(),
            rate_limits: RateLimits::default(),
            ws_idle_timeout: Duration::from_secs(300),
            runtime_dir: PathBuf::from("runtime"),
        }
    }
}

impl Config {
    /// Layer `TRANSCRIBE_*` environment variables over the defaults.
    ///
    /// Returns an error string naming the offending variable for any value
    /// that fails to parse; the binary maps that to exit code 1.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Some(v) = read_env("TRANSCRIBE_BIND") {
            config.bind_addr = v
                .parse()
                .map_err(|e| format!("TRANSCRIBE_BIND ({v}): {e}"))?;
        }
        if let Some(v) = read_env("TRANSCRIBE_API_KEY") {
            config.api_key = Some(v);
        }
        if let Some(v) = read_env("TRANSCRIBE_SESSION_TTL_SECS") {
            config.session_ttl = Duration::from_secs(parse_num(&v, "TRANSCRIBE_SESSION_TTL_SECS")?);
        }
        if let Some(v) = read_env("TRANSCRIBE_MAX_SESSION_AUDIO_SECS") {
            config.max_session_audio_seconds =
                parse_num(&v, "TRANSCRIBE_MAX_SESSION_AUDIO_SECS")?;
        }
        if let Some(v) = read_env("TRANSCRIBE_JOB_TTL_SECS") {
            config.job_ttl = Duration::from_secs(parse_num(&v, "TRANSCRIBE_JOB_TTL_SECS")?);
        }
        if let Some(v) = read_env("TRANSCRIBE_MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = parse_num(&v, "TRANSCRIBE_MAX_CONCURRENT_JOBS")?;
        }
        if let Some(v) = read_env("TRANSCRIBE_PIPELINE_CONCURRENCY") {
            config.pipeline_concurrency = parse_num(&v, "TRANSCRIBE_PIPELINE_CONCURRENCY")?;
        }
        if let Some(v) = read_env("TRANSCRIBE_LANGUAGE") {
            config.default_language = v;
        }
        if let Some(v) = read_env("TRANSCRIBE_MAX_CHUNK_SECS") {
            config.segmenter.max_chunk_duration = parse_num(&v, "TRANSCRIBE_MAX_CHUNK_SECS")?;
        }
        if let Some(v) = read_env("TRANSCRIBE_WHISPER_URL") {
            config.recognizer.server_url = v;
        }
        if let Some(v) = read_env("TRANSCRIBE_WHISPER_MODEL") {
            config.recognizer.model = v;
        }
        if let Some(v) = read_env("TRANSCRIBE_WHISPER_REQUIRED") {
            config.recognizer.required = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = read_env("TRANSCRIBE_ENHANCER") {
            config.enhancer.provider = EnhancerProvider::parse(&v)
                .ok_or_else(|| format!("TRANSCRIBE_ENHANCER: unknown provider '{v}'"))?;
        }
        if let Some(v) = read_env("TRANSCRIBE_ENHANCER_URL") {
            config.enhancer.base_url = v;
        }
        if let Some(v) = read_env("TRANSCRIBE_ENHANCER_KEY") {
            config.enhancer.api_key = Some(v);
        }
        if let Some(v) = read_env("TRANSCRIBE_ENHANCER_MODEL") {
            config.enhancer.model = v;
        }
        if let Some(v) = read_env("TRANSCRIBE_RUNTIME_DIR") {
            config.runtime_dir = PathBuf::from(v);
        }

        Ok(config)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.runtime_dir.join("tmp")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.runtime_dir.join("logs")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.runtime_dir.join("models")
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_num<T: std::str::FromStr>(v: &str, name: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    v.parse::<T>().map_err(|e| format!("{name} ({v}): {e}"))
}
