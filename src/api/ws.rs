//! WebSocket handler for interactive sessions at `/sandboxes/{id}/stream`.
//!
//! One reader loop per session; every outgoing frame goes through a
//! per-session lock so streamed output and control replies never interleave.
//! Executions run as concurrent tasks with their cancel handles registered
//! under the execution id.

use std::sync::Arc;

use axum::Extension;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::AppState;
use crate::execproxy::{EXIT_CODE_CANCELLED, StreamCallback, StreamKind};
use crate::service::{AuthContext, ExecuteRequestBody};
use crate::session::{ClientMessage, ServerMessage, SessionHandle, now_millis};

type Writer = Arc<Mutex<SplitSink<WebSocket, Message>>>;

pub async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    upgrade: WebSocketUpgrade,
) -> Response {
    match state.service.open_session(&auth, &id).await {
        Ok(handle) => upgrade.on_upgrade(move |socket| run_session(socket, state, auth, handle)),
        Err(e) => e.into_response(),
    }
}

async fn run_session(
    socket: WebSocket,
    state: AppState,
    auth: AuthContext,
    handle: Arc<SessionHandle>,
) {
    let (sink, mut reader) = socket.split();
    let writer: Writer = Arc::new(Mutex::new(sink));

    debug!(session = %handle.id, sandbox = %handle.sandbox_id, "session opened");

    while let Some(frame) = reader.next().await {
        let message = match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => message,
                Err(_) => ClientMessage::Unknown,
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        match message {
            ClientMessage::Execute {
                execution_id,
                execution_type,
                content,
                timeout,
            } => {
                let execution_id =
                    execution_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                let Some(cancel) = handle.register_execution(&execution_id).await else {
                    // Duplicate delivery of a live execution id: one run.
                    continue;
                };

                send(&writer, &ServerMessage::ExecutionStart {
                    execution_id: execution_id.clone(),
                    timestamp: now_millis(),
                })
                .await;

                let body = ExecuteRequestBody {
                    execution_type: execution_type.unwrap_or_else(|| "code".to_string()),
                    content,
                    timeout,
                };
                tokio::spawn(run_execution(
                    state.clone(),
                    auth.clone(),
                    handle.clone(),
                    writer.clone(),
                    execution_id,
                    body,
                    cancel,
                ));
            }
            ClientMessage::Cancel { execution_id } => {
                if handle.cancel_execution(&execution_id).await {
                    send(&writer, &ServerMessage::ExecutionCancelled {
                        execution_id,
                        timestamp: now_millis(),
                    })
                    .await;
                } else {
                    send(&writer, &ServerMessage::Error {
                        code: "unknown_execution".to_string(),
                        message: format!("no live execution {execution_id:?}"),
                        timestamp: now_millis(),
                    })
                    .await;
                }
            }
            ClientMessage::Ping => {
                send(&writer, &ServerMessage::Pong {
                    timestamp: now_millis(),
                })
                .await;
            }
            ClientMessage::Unknown => {
                send(&writer, &ServerMessage::Error {
                    code: "unknown_message_type".to_string(),
                    message: "unrecognized message type".to_string(),
                    timestamp: now_millis(),
                })
                .await;
            }
        }
    }

    // Reader gone: cancel outstanding executions and drop all state.
    if let Err(e) = state.service.sessions.close(&handle.id).await {
        warn!(session = %handle.id, error = %e, "session close failed");
    }
    debug!(session = %handle.id, "session closed");
}

#[allow(clippy::too_many_arguments)]
async fn run_execution(
    state: AppState,
    auth: AuthContext,
    handle: Arc<SessionHandle>,
    writer: Writer,
    execution_id: String,
    body: ExecuteRequestBody,
    cancel: tokio_util::sync::CancellationToken,
) {
    // Stream callbacks are synchronous; output lines cross to the socket
    // writer through a channel so the exec read loop never blocks on it.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<(StreamKind, String)>();
    let callback: StreamCallback = Arc::new(move |kind, line| {
        let _ = line_tx.send((kind, line));
    });

    let forwarder = {
        let writer = writer.clone();
        let execution_id = execution_id.clone();
        tokio::spawn(async move {
            while let Some((kind, content)) = line_rx.recv().await {
                send(&writer, &ServerMessage::Output {
                    execution_id: execution_id.clone(),
                    stream: kind.as_str().to_string(),
                    content,
                    timestamp: now_millis(),
                })
                .await;
            }
        })
    };

    let result = state
        .service
        .execute_streaming(
            &auth,
            &handle.sandbox_id,
            body,
            Some(callback),
            cancel.clone(),
        )
        .await;

    // Callback sender dropped with execute_streaming's request; drain the
    // remaining lines before emitting the terminal frame.
    let _ = forwarder.await;

    match result {
        Ok(result) => {
            if result.exit_code == EXIT_CODE_CANCELLED || cancel.is_cancelled() {
                // The cancel handler already emitted execution_cancelled.
            } else {
                send(&writer, &ServerMessage::ExecutionComplete {
                    execution_id: execution_id.clone(),
                    exit_code: result.exit_code,
                    timestamp: now_millis(),
                })
                .await;
            }
        }
        Err(e) => {
            send(&writer, &ServerMessage::Error {
                code: e.code().to_string(),
                message: e.to_string(),
                timestamp: now_millis(),
            })
            .await;
        }
    }

    handle.finish_execution(&execution_id).await;
}

async fn send(writer: &Writer, message: &ServerMessage) {
    let Ok(payload) = serde_json::to_string(message) else {
        return;
    };
    let mut sink = writer.lock().await;
    if let Err(e) = sink.send(Message::Text(payload.into())).await {
        debug!(error = %e, "websocket send failed");
    }
}
