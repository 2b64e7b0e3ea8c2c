//! Fixed-window rate limiting, keyed by endpoint class and client address.
//!
//! Health endpoints and WebSocket upgrades never pass through here; every
//! other route group is wrapped with a class-tagged middleware layer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::config::RateLimits;
use crate::error::ApiError;

use super::AppState;

const WINDOW: Duration = Duration::from_secs(60);

/// Endpoint classes with independent quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateClass {
    SessionControl,
    AudioIngest,
    SessionRead,
    Transcribe,
    Upload,
    UploadLong,
    Batch,
    Text,
    PostProcessConfig,
    JobSubmit,
    JobPoll,
    JobControl,
    Dictionary,
}

pub fn quota_for(limits: &RateLimits, class: RateClass) -> u32 {
    match class {
        RateClass::SessionControl => limits.session_control,
        RateClass::AudioIngest => limits.audio_ingest,
        RateClass::SessionRead => limits.session_read,
        RateClass::Transcribe => limits.transcribe,
        RateClass::Upload => limits.upload,
        RateClass::UploadLong => limits.upload_long,
        RateClass::Batch => limits.batch,
        RateClass::Text => limits.text,
        RateClass::PostProcessConfig => limits.postprocess_config,
        RateClass::JobSubmit => limits.job_submit,
        RateClass::JobPoll => limits.job_poll,
        RateClass::JobControl => limits.job_control,
        RateClass::Dictionary => limits.dictionary,
    }
}

struct Window {
    start: Instant,
    count: u32,
}

/// Process-wide counters. Explicit `new()`; windows reset lazily.
pub struct FixedWindowLimiter {
    windows: Mutex<HashMap<(RateClass, String), Window>>,
}

impl FixedWindowLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one request. On rejection, returns the seconds until
    /// the current window rolls over.
    pub fn check(&self, class: RateClass, source: &str, quota: u32) -> Result<(), u64> {
        let mut windows = self.windows.lock().unwrap();
        let window = windows
            .entry((class, source.to_string()))
            .or_insert_with(|| Window {
                start: Instant::now(),
                count: 0,
            });

        if window.start.elapsed() >= WINDOW {
            window.start = Instant::now();
            window.count = 0;
        }

        if window.count >= quota {
            let retry_after = WINDOW
                .saturating_sub(window.start.elapsed())
                .as_secs()
                .clamp(1, WINDOW.as_secs());
            return Err(retry_after);
        }

        window.count += 1;
        Ok(())
    }

    /// Drop windows that have long since rolled over
    pub fn sweep(&self) {
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|_, w| w.start.elapsed() < WINDOW * 2);
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Middleware: enforce the quota of the route group's class.
pub async fn enforce(
    State((state, class)): State<(AppState, RateClass)>,
    request: Request,
    next: Next,
) -> Response {
    let source = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "local".to_string());

    let quota = quota_for(&state.config.rate_limits, class);
    match state.limiter.check(class, &source, quota) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => ApiError::RateLimited { retry_after }.into_response(),
    }
}
