//! HTTP/WebSocket surface.
//!
//! Thin handlers over the managers; every route group carries its own
//! fixed-window rate-limit class, and the whole surface sits behind the
//! optional API-key gate.

mod asr;
pub mod auth;
mod jobs;
mod postprocess;
pub mod rate_limit;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use crate::config::Config;
use crate::dictionary::PersonalDictionary;
use crate::enhancer::{build_enhancer, Enhancer};
use crate::jobs::JobQueue;
use crate::pipeline::PipelineOrchestrator;
use crate::postprocess::PostProcessor;
use crate::recognizer::{HttpRecognizer, Recognizer, RecognizerError, RecognizerHandle};
use crate::segmenter::Segmenter;
use crate::session::SessionManager;

use rate_limit::{FixedWindowLimiter, RateClass};

/// Uploads beyond this are rejected outright (10 min of PCM is ~19 MB;
/// compressed formats far less)
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Everything the handlers share
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub jobs: Arc<JobQueue>,
    pub postprocessor: Arc<PostProcessor>,
    pub dictionary: Arc<PersonalDictionary>,
    pub recognizer: RecognizerHandle,
    pub orchestrator: PipelineOrchestrator,
    pub segmenter: Segmenter,
    pub limiter: Arc<FixedWindowLimiter>,
}

impl AppState {
    /// Wire the whole service around the given capabilities.
    pub fn build(
        config: Config,
        backend: Arc<dyn Recognizer>,
        enhancer: Option<Arc<dyn Enhancer>>,
    ) -> Self {
        let config = Arc::new(config);
        let recognizer = RecognizerHandle::new(
            backend,
            config.recognizer.concurrency,
            config.tmp_dir(),
        );
        let orchestrator =
            PipelineOrchestrator::new(recognizer.clone(), config.pipeline_concurrency);
        let dictionary = Arc::new(PersonalDictionary::new());
        let postprocessor = Arc::new(PostProcessor::new(dictionary.clone(), enhancer));
        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            orchestrator.clone(),
            postprocessor.clone(),
        ));
        let jobs = Arc::new(JobQueue::new(
            config.clone(),
            orchestrator.clone(),
            postprocessor.clone(),
        ));

        Self {
            segmenter: Segmenter::new(config.segmenter.clone()),
            sessions,
            jobs,
            postprocessor,
            dictionary,
            recognizer,
            orchestrator,
            limiter: Arc::new(FixedWindowLimiter::new()),
            config,
        }
    }

    /// Build against the configured HTTP recognizer backend.
    pub fn bootstrap(config: Config) -> Result<Self, RecognizerError> {
        let backend = Arc::new(HttpRecognizer::new(&config.recognizer)?);
        let enhancer = build_enhancer(&config.enhancer);
        Ok(Self::build(config, backend, enhancer))
    }

    /// Spawn the reapers, job workers and recognizer warm-up.
    pub fn start_background(&self) {
        self.sessions.spawn_reaper();
        self.jobs.start();
        self.recognizer.warm_up();

        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(120));
            loop {
                tick.tick().await;
                limiter.sweep();
            }
        });
    }

    /// Flush and stop: cancel sessions, drain the job queue.
    pub async fn shutdown(&self) {
        info!("Shutting down: cancelling sessions and pending jobs");
        self.sessions.shutdown().await;
        self.jobs.shutdown();
    }
}

/// Assemble the full router.
pub fn router(state: AppState) -> Router {
    let limit = |class: RateClass| {
        middleware::from_fn_with_state((state.clone(), class), rate_limit::enforce)
    };

    Router::new()
        // Liveness; exempt from rate limiting and auth
        .route("/health", get(health))
        .route("/version", get(version))
        // Streaming sessions
        .route(
            "/api/asr/start",
            post(asr::start).route_layer(limit(RateClass::SessionControl)),
        )
        .route(
            "/api/asr/audio/:session_id",
            post(asr::ingest).route_layer(limit(RateClass::AudioIngest)),
        )
        .route(
            "/api/asr/stop/:session_id",
            post(asr::stop).route_layer(limit(RateClass::SessionControl)),
        )
        .route(
            "/api/asr/cancel/:session_id",
            post(asr::cancel).route_layer(limit(RateClass::SessionControl)),
        )
        .route(
            "/api/asr/status/:session_id",
            get(asr::status).route_layer(limit(RateClass::SessionRead)),
        )
        .route(
            "/api/asr/preview/:session_id",
            get(asr::preview).route_layer(limit(RateClass::SessionRead)),
        )
        .route(
            "/api/asr/transcribe",
            post(asr::transcribe).route_layer(limit(RateClass::Transcribe)),
        )
        .route(
            "/api/asr/recognizer",
            get(asr::recognizer_status).route_layer(limit(RateClass::SessionRead)),
        )
        // Dictionary administration
        .route(
            "/api/asr/dictionary",
            get(asr::dictionary_list)
                .post(asr::dictionary_upsert)
                .route_layer(limit(RateClass::Dictionary)),
        )
        .route(
            "/api/asr/dictionary/:spoken",
            delete(asr::dictionary_remove).route_layer(limit(RateClass::Dictionary)),
        )
        // Upload + text post-processing
        .route(
            "/api/postprocess/upload",
            post(postprocess::upload).route_layer(limit(RateClass::Upload)),
        )
        .route(
            "/api/postprocess/upload-long",
            post(postprocess::upload_long).route_layer(limit(RateClass::UploadLong)),
        )
        .route(
            "/api/postprocess/batch-transcribe",
            post(postprocess::batch_transcribe).route_layer(limit(RateClass::Batch)),
        )
        .route(
            "/api/postprocess/text",
            post(postprocess::text).route_layer(limit(RateClass::Text)),
        )
        .route(
            "/api/postprocess/config",
            get(postprocess::get_config)
                .post(postprocess::set_config)
                .route_layer(limit(RateClass::PostProcessConfig)),
        )
        // Jobs
        .route(
            "/api/jobs/submit",
            post(jobs::submit).route_layer(limit(RateClass::JobSubmit)),
        )
        .route(
            "/api/jobs/stats",
            get(jobs::stats).route_layer(limit(RateClass::JobPoll)),
        )
        .route(
            "/api/jobs/",
            get(jobs::list).route_layer(limit(RateClass::JobControl)),
        )
        .route(
            "/api/jobs/:job_id",
            get(jobs::status).route_layer(limit(RateClass::JobPoll)),
        )
        .route(
            "/api/jobs/:job_id/cancel",
            post(jobs::cancel).route_layer(limit(RateClass::JobControl)),
        )
        // Interactive streaming; exempt from rate limiting
        .route("/api/asr/stream-progress", get(ws::stream_progress))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        // Ten minutes of PCM far exceeds axum's built-in 2 MB cap
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve until the shutdown future resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn version(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "recognizer_model": state.config.recognizer.model,
        "enhancer": match state.config.enhancer.provider {
            crate::config::EnhancerProvider::OpenAi => "openai",
            crate::config::EnhancerProvider::Gemini => "gemini",
            crate::config::EnhancerProvider::Ollama => "ollama",
            crate::config::EnhancerProvider::None => "none",
        },
    }))
}
