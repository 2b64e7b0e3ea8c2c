//! Standalone server binary.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 bind error,
//! 3 recognizer init failure (only when the backend is marked required).

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use transcription_server::config::Config;
use transcription_server::server::{serve, AppState};

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    for dir in [config.tmp_dir(), config.logs_dir(), config.models_dir()] {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            eprintln!("cannot create runtime directory {}: {e}", dir.display());
            return ExitCode::from(1);
        }
    }

    // Log to stderr and to a daily-rotated file under runtime/logs/
    let file_appender =
        tracing_appender::rolling::daily(config.logs_dir(), "transcription-server.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    info!(
        "Transcription server {} starting",
        env!("CARGO_PKG_VERSION")
    );

    let bind_addr = config.bind_addr;
    let recognizer_required = config.recognizer.required;

    let state = match AppState::bootstrap(config) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("recognizer setup failed: {}", e);
            return ExitCode::from(3);
        }
    };

    if recognizer_required {
        if let Err(e) = state.recognizer.ensure_init().await {
            error!("recognizer init failed: {}", e);
            return ExitCode::from(3);
        }
    }

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind {}: {}", bind_addr, e);
            return ExitCode::from(2);
        }
    };
    info!("Listening on {}", bind_addr);

    state.start_background();

    let result = serve(listener, (*state).clone(), wait_for_signal()).await;

    state.shutdown().await;

    match result {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("server error: {}", e);
            ExitCode::from(1)
        }
    }
}

/// Resolve on SIGINT or SIGTERM
async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
