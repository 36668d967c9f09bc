/// Transport Layer - WebSocket Gateway
///
/// Room/event contract over one bidirectional socket per client:
/// - `execute` requests run as their own task; the result goes back to the
///   requesting connection only
/// - `terminal:join` subscribes the connection to a project's room;
///   terminal events fan out to every subscriber of that room
/// - closing the socket leaves every joined room, which tears the
///   project's session down when this was the last subscriber
use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use runbox_common::types::{ClientEvent, ServerEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::terminal::{RoomEvent, TerminalRegistry};

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub terminals: TerminalRegistry,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/status", get(health_check))
}

/// GET /status - Health check endpoint
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /ws - Upgrade to the event socket
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    // All outbound traffic funnels through one channel so execution tasks
    // and terminal forwarders never contend for the sink.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(64);
    let send_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // project id -> forwarder task pumping room events into this socket
    let mut joined: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let event = match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed frame");
                continue;
            }
        };

        match event {
            ClientEvent::Execute {
                project_id,
                language,
                code,
                input,
            } => {
                debug!(
                    project_id = %project_id,
                    language = %language,
                    source_size = code.len(),
                    "Execution requested"
                );
                let state = Arc::clone(&state);
                let out = out_tx.clone();
                tokio::spawn(async move {
                    let outcome = state.dispatcher.execute(&language, &code, &input).await;
                    let event = if outcome.is_success() {
                        ServerEvent::ExecutionResult {
                            result: outcome.stdout,
                        }
                    } else {
                        ServerEvent::ExecutionError {
                            error: outcome.diagnostic,
                        }
                    };
                    let _ = out.send(event).await;
                });
            }

            ClientEvent::TerminalJoin { project_id } => {
                if room_entry_active(&joined, &project_id) {
                    continue;
                }
                // a finished forwarder means the session closed (shell
                // exited); this join starts over with a fresh one
                joined.remove(&project_id);
                match state.terminals.join(&project_id) {
                    Ok(receiver) => {
                        let handle =
                            tokio::spawn(forward_room_events(receiver, out_tx.clone()));
                        joined.insert(project_id, handle);
                    }
                    Err(e) => {
                        // session stays Absent; a later join can retry
                        warn!(project_id = %project_id, error = %e, "Failed to start terminal session");
                        let _ = out_tx
                            .send(ServerEvent::TerminalData {
                                data: format!("failed to start terminal: {e}\r\n"),
                            })
                            .await;
                    }
                }
            }

            ClientEvent::TerminalWrite { project_id, data } => {
                if let Err(e) = state.terminals.write(&project_id, &data) {
                    debug!(project_id = %project_id, error = %e, "Dropped terminal write");
                }
            }

            ClientEvent::TerminalRun {
                project_id,
                command,
            } => {
                // completion reaches the whole room as terminal:command-done,
                // so the per-command waiter is not needed here
                match state.terminals.run_command(&project_id, &command) {
                    Ok(_waiter) => {
                        debug!(project_id = %project_id, "Command issued to terminal")
                    }
                    Err(e) => {
                        debug!(project_id = %project_id, error = %e, "Rejected terminal command");
                        let _ = out_tx
                            .send(ServerEvent::TerminalData {
                                data: format!("{e}\r\n"),
                            })
                            .await;
                    }
                }
            }

            ClientEvent::CodeChange { project_id, delta } => {
                if let Err(e) = state.terminals.broadcast_code_change(&project_id, delta) {
                    debug!(project_id = %project_id, error = %e, "Dropped code change");
                }
            }
        }
    }

    // Connection gone: leave every joined room.
    for (project_id, handle) in joined {
        handle.abort();
        state.terminals.leave(&project_id);
    }
    send_task.abort();
    info!("Client disconnected");
}

/// A room entry is live only while its forwarder still runs. A finished
/// forwarder means the session closed underneath the connection, so the
/// entry must not block a rejoin.
fn room_entry_active(joined: &HashMap<String, JoinHandle<()>>, project_id: &str) -> bool {
    joined
        .get(project_id)
        .map(|handle| !handle.is_finished())
        .unwrap_or(false)
}

/// Pump one project's room events into a connection's outbound queue,
/// preserving the order the shell produced them.
async fn forward_room_events(
    mut receiver: tokio::sync::broadcast::Receiver<RoomEvent>,
    out: mpsc::Sender<ServerEvent>,
) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match receiver.recv().await {
            Ok(RoomEvent::Data(data)) => {
                if out.send(ServerEvent::TerminalData { data }).await.is_err() {
                    break;
                }
            }
            Ok(RoomEvent::CommandDone) => {
                if out.send(ServerEvent::TerminalCommandDone).await.is_err() {
                    break;
                }
            }
            Ok(RoomEvent::CodeChange(delta)) => {
                if out.send(ServerEvent::CodeChange { delta }).await.is_err() {
                    break;
                }
            }
            Ok(RoomEvent::Closed) => {
                let _ = out.send(ServerEvent::TerminalClosed).await;
                break;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Terminal subscriber lagged, dropping output");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_room_entry_does_not_block_rejoin() {
        let mut joined: HashMap<String, JoinHandle<()>> = HashMap::new();

        // forwarder that already ran to completion (session closed)
        let finished = tokio::spawn(async {});
        while !finished.is_finished() {
            tokio::task::yield_now().await;
        }
        joined.insert("p1".to_string(), finished);
        assert!(!room_entry_active(&joined, "p1"));

        // forwarder still pumping events
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        joined.insert(
            "p2".to_string(),
            tokio::spawn(async move {
                let _ = rx.await;
            }),
        );
        assert!(room_entry_active(&joined, "p2"));
        assert!(!room_entry_active(&joined, "never-joined"));
        let _ = tx.send(());
    }
}
