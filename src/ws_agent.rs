use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::handlers::AppState;
use crate::protocol::{AgentCommand, AgentMessage};

/// WebSocket upgrade for an agent connection. The durable session id rides
/// in the path; the connection itself gets a transient id from the registry.
pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, session_id, state))
}

async fn handle_agent_socket(socket: WebSocket, session_id: String, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Commands for this agent flow through the registry handle; a dedicated
    // task forwards them onto the socket. The registry owns the only
    // sender, so dropping the handle (supersession or a monitor sever)
    // really ends the task, which closes the connection.
    let (tx, mut rx) = mpsc::unbounded_channel::<AgentCommand>();
    let conn_id = state.registry.connect(&session_id, tx);
    debug!(session = %session_id, %conn_id, "agent connected");

    let forward_session = session_id.clone();
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&command) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
        debug!(session = %forward_session, "agent command forwarder ended");
    });

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(msg) => msg,
            Err(err) => {
                error!(session = %session_id, %err, "agent websocket error");
                break;
            }
        };

        match msg {
            // Binary frames are the raw payload fast path.
            Message::Binary(payload) => {
                state.registry.submit_frame(&session_id, payload);
            }
            Message::Text(text) => match serde_json::from_str::<AgentMessage>(&text) {
                Ok(AgentMessage::Heartbeat) => {
                    state.registry.heartbeat(&session_id);
                }
                Ok(AgentMessage::Frame { payload }) => match STANDARD.decode(&payload) {
                    Ok(bytes) => state.registry.submit_frame(&session_id, bytes),
                    Err(err) => {
                        warn!(session = %session_id, %err, "dropping frame with invalid base64 payload");
                    }
                },
                Err(err) => {
                    warn!(session = %session_id, %err, "dropping unparseable agent message");
                }
            },
            Message::Close(_) => {
                debug!(session = %session_id, "agent sent close");
                break;
            }
            // Ping/pong handled by the transport.
            _ => {}
        }
    }

    state.registry.disconnect(conn_id).await;
    debug!(session = %session_id, %conn_id, "agent socket closed");
}
