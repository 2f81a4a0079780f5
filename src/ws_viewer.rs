use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::frames;
use crate::handlers::AppState;
use crate::protocol::InputEvent;

/// How long one loop iteration waits for a pending viewer message.
const INPUT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Pause that bounds the push cadence. The bridge is a sampler of the
/// latest decoded image, independent of the agent's frame rate.
const PUSH_CADENCE: Duration = Duration::from_millis(30);

/// WebSocket upgrade for a viewer. Any number of viewers may bind to the
/// same session; each gets its own bridge loop.
pub async fn viewer_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_viewer_socket(socket, session_id, state))
}

/// Duplex bridge loop: push the freshest frame, drain one input event,
/// sleep, repeat. Holds no session state of its own; the cache and queues
/// belong to the registry and outlive the bridge.
async fn handle_viewer_socket(socket: WebSocket, session_id: String, state: AppState) {
    info!(session = %session_id, "viewer attached");
    let (mut sender, mut receiver) = socket.split();

    loop {
        if let Some(image) = state.registry.latest_frame(&session_id) {
            match frames::encode_jpeg(&image) {
                Ok(bytes) => {
                    if sender.send(Message::Binary(bytes)).await.is_err() {
                        debug!(session = %session_id, "viewer send failed, ending bridge");
                        break;
                    }
                }
                Err(err) => {
                    warn!(session = %session_id, %err, "failed to encode frame for viewer");
                }
            }
        }

        match timeout(INPUT_POLL_TIMEOUT, receiver.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<InputEvent>(&text) {
                    Ok(event) => {
                        if !state.registry.forward_input(&session_id, event) {
                            debug!(session = %session_id, "input dropped, no live agent for session");
                        }
                    }
                    Err(err) => {
                        warn!(session = %session_id, %err, "dropping malformed viewer input");
                    }
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                info!(session = %session_id, "viewer disconnected");
                break;
            }
            Ok(Some(Ok(_))) => {
                // Binary/ping/pong from viewers carries no meaning here.
            }
            Ok(Some(Err(err))) => {
                warn!(session = %session_id, %err, "viewer transport error, ending bridge");
                break;
            }
            Err(_) => {
                // No pending input this iteration.
            }
        }

        tokio::time::sleep(PUSH_CADENCE).await;
    }
}
