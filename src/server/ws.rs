//! Interactive streaming over WebSocket.
//!
//! Text frames carry JSON actions (`start`, `process`, `stop`); binary
//! frames carry raw PCM. The server answers with typed JSON events, ending
//! a processing run with exactly one `complete` or `error`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::merge::MergeStrategy;
use crate::postprocess::Mode;
use crate::segmenter::Strategy;
use crate::session::StopOptions;

use super::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClientAction {
    Start,
    Process {
        strategy: Option<String>,
        merge_strategy: Option<String>,
        apply_postprocess: Option<bool>,
    },
    Stop,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerEvent {
    Started {
        session_id: Uuid,
        timestamp: String,
    },
    Ready {
        session_id: Uuid,
        message: String,
    },
    ChunkReceived {
        chunk_number: u64,
        session_id: Uuid,
    },
    Progress {
        current_segment: usize,
        total_segments: usize,
        progress_percent: f64,
        message: String,
        session_id: Uuid,
    },
    SegmentComplete {
        current_segment: usize,
        total_segments: usize,
        transcript_part: String,
        session_id: Uuid,
    },
    Complete {
        session_id: Uuid,
        final_transcript: String,
        processed_transcript: String,
        total_segments: usize,
        duration: f32,
        strategy: String,
        merge_strategy: String,
    },
    Error {
        message: String,
        session_id: Option<Uuid>,
    },
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode WS event: {}", e);
            false
        }
    }
}

pub async fn stream_progress(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut session_id: Option<Uuid> = None;
    let mut chunk_number: u64 = 0;

    loop {
        let received =
            match tokio::time::timeout(state.config.ws_idle_timeout, socket.recv()).await {
                Err(_) => {
                    info!("WS idle timeout");
                    let _ = send_event(
                        &mut socket,
                        &ServerEvent::Error {
                            message: "idle timeout".to_string(),
                            session_id,
                        },
                    )
                    .await;
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!("WS receive error: {}", e);
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

        match received {
            Message::Text(text) => {
                let action: ClientAction = match serde_json::from_str(&text) {
                    Ok(action) => action,
                    Err(e) => {
                        if !send_event(
                            &mut socket,
                            &ServerEvent::Error {
                                message: format!("bad action frame: {e}"),
                                session_id,
                            },
                        )
                        .await
                        {
                            break;
                        }
                        continue;
                    }
                };

                match action {
                    ClientAction::Start => match state.sessions.open(None) {
                        Ok(id) => {
                            session_id = Some(id);
                            chunk_number = 0;
                            info!("WS session {} started", id);
                            if !send_event(
                                &mut socket,
                                &ServerEvent::Started {
                                    session_id: id,
                                    timestamp: chrono::Utc::now().to_rfc3339(),
                                },
                            )
                            .await
                            {
                                break;
                            }
                            if !send_event(
                                &mut socket,
                                &ServerEvent::Ready {
                                    session_id: id,
                                    message: "send binary PCM frames, then 'process'".to_string(),
                                },
                            )
                            .await
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = send_event(
                                &mut socket,
                                &ServerEvent::Error {
                                    message: e.to_string(),
                                    session_id: None,
                                },
                            )
                            .await;
                            break;
                        }
                    },

                    ClientAction::Process {
                        strategy,
                        merge_strategy,
                        apply_postprocess,
                    } => {
                        let Some(id) = session_id else {
                            if !send_event(
                                &mut socket,
                                &ServerEvent::Error {
                                    message: "no session; send 'start' first".to_string(),
                                    session_id: None,
                                },
                            )
                            .await
                            {
                                break;
                            }
                            continue;
                        };

                        let strategy = match Strategy::parse(
                            strategy.as_deref().unwrap_or("hybrid"),
                        ) {
                            Some(s) => s,
                            None => {
                                let _ = send_event(
                                    &mut socket,
                                    &ServerEvent::Error {
                                        message: "unknown strategy".to_string(),
                                        session_id: Some(id),
                                    },
                                )
                                .await;
                                continue;
                            }
                        };
                        let merge = match MergeStrategy::parse(
                            merge_strategy.as_deref().unwrap_or("simple"),
                        ) {
                            Some(m) => m,
                            None => {
                                let _ = send_event(
                                    &mut socket,
                                    &ServerEvent::Error {
                                        message: "unknown merge strategy".to_string(),
                                        session_id: Some(id),
                                    },
                                )
                                .await;
                                continue;
                            }
                        };

                        if !process_session(
                            &mut socket,
                            &state,
                            id,
                            strategy,
                            merge,
                            apply_postprocess.unwrap_or(true),
                        )
                        .await
                        {
                            break;
                        }
                    }

                    ClientAction::Stop => {
                        if let Some(id) = session_id {
                            // Discard anything not yet processed
                            if let Ok(status) = state.sessions.status(id).await {
                                if !status.state.is_terminal() {
                                    let _ = state.sessions.cancel(id).await;
                                }
                            }
                            info!("WS session {} closed by client", id);
                        }
                        break;
                    }
                }
            }

            Message::Binary(data) => {
                let Some(id) = session_id else {
                    if !send_event(
                        &mut socket,
                        &ServerEvent::Error {
                            message: "no session; send 'start' first".to_string(),
                            session_id: None,
                        },
                    )
                    .await
                    {
                        break;
                    }
                    continue;
                };
                match state.sessions.ingest(id, &data).await {
                    Ok(_) => {
                        chunk_number += 1;
                        if !send_event(
                            &mut socket,
                            &ServerEvent::ChunkReceived {
                                chunk_number,
                                session_id: id,
                            },
                        )
                        .await
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let fatal = matches!(e, ApiError::NotFound(_));
                        if !send_event(
                            &mut socket,
                            &ServerEvent::Error {
                                message: e.to_string(),
                                session_id: Some(id),
                            },
                        )
                        .await
                            || fatal
                        {
                            break;
                        }
                    }
                }
            }

            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                if let Some(id) = session_id {
                    if let Ok(status) = state.sessions.status(id).await {
                        if !status.state.is_terminal() {
                            let _ = state.sessions.cancel(id).await;
                        }
                    }
                }
                break;
            }
        }
    }
}

/// Run the finalize pipeline, streaming progress. Returns false when the
/// socket died and the connection should be torn down.
async fn process_session(
    socket: &mut WebSocket,
    state: &AppState,
    id: Uuid,
    strategy: Strategy,
    merge: MergeStrategy,
    apply_postprocess: bool,
) -> bool {
    let options = StopOptions {
        strategy,
        merge_strategy: merge,
        postprocess_mode: if apply_postprocess {
            None
        } else {
            Some(Mode::None)
        },
        language: None,
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let stop = state.sessions.stop(id, options, Some(&tx));
    tokio::pin!(stop);

    let outcome = loop {
        tokio::select! {
            event = rx.recv() => {
                if let Some(event) = event {
                    let percent = event.current as f64 / event.total.max(1) as f64 * 100.0;
                    if !send_event(socket, &ServerEvent::Progress {
                        current_segment: event.current,
                        total_segments: event.total,
                        progress_percent: percent,
                        message: event.message.clone(),
                        session_id: id,
                    }).await {
                        return false;
                    }
                    if !send_event(socket, &ServerEvent::SegmentComplete {
                        current_segment: event.current,
                        total_segments: event.total,
                        transcript_part: event.segment_text.clone(),
                        session_id: id,
                    }).await {
                        return false;
                    }
                }
            }
            result = &mut stop => break result,
        }
    };

    // Flush any progress that raced with completion
    while let Ok(event) = rx.try_recv() {
        let percent = event.current as f64 / event.total.max(1) as f64 * 100.0;
        if !send_event(socket, &ServerEvent::Progress {
            current_segment: event.current,
            total_segments: event.total,
            progress_percent: percent,
            message: event.message.clone(),
            session_id: id,
        })
        .await
        {
            return false;
        }
        if !send_event(socket, &ServerEvent::SegmentComplete {
            current_segment: event.current,
            total_segments: event.total,
            transcript_part: event.segment_text.clone(),
            session_id: id,
        })
        .await
        {
            return false;
        }
    }

    match outcome {
        Ok(outcome) => send_event(
            socket,
            &ServerEvent::Complete {
                session_id: id,
                final_transcript: outcome.final_transcript,
                processed_transcript: outcome.processed_transcript,
                total_segments: outcome.total_segments,
                duration: outcome.duration_seconds,
                strategy: strategy.as_str().to_string(),
                merge_strategy: merge.as_str().to_string(),
            },
        )
        .await,
        Err(e) => {
            warn!("WS processing failed for {}: {}", id, e);
            let _ = send_event(
                socket,
                &ServerEvent::Error {
                    message: e.to_string(),
                    session_id: Some(id),
                },
            )
            .await;
            false
        }
    }
}
