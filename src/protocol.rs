use serde::{Deserialize, Serialize};

/// Messages sent from an agent to the relay over its WebSocket.
///
/// Frame payloads arrive either as binary WebSocket messages (raw compressed
/// bytes) or as a `frame` text message carrying base64, for agents whose
/// transport only speaks text frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Keepalive; answered with `heartbeat_ack`.
    Heartbeat,
    /// A compressed screen capture, base64-encoded.
    Frame { payload: String },
}

/// Messages pushed from the relay to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Acknowledges a heartbeat with the relay's wall-clock time.
    HeartbeatAck { timestamp: i64 },
    /// Begin a streaming session.
    Start {
        session_id: String,
        key: Option<String>,
    },
    /// Begin liveness checking without touching frame state.
    BeginLivenessCheck { session_id: String },
    /// Disconnect on purpose.
    Stop { reason: String },
    /// An input event captured by a viewer, to be replayed by the agent.
    Input { event: InputEvent },
}

/// Input events a viewer may send. Anything else is dropped by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    MouseMove {
        x: f64,
        y: f64,
    },
    MouseClick {
        x: f64,
        y: f64,
        button: String,
        pressed: bool,
    },
    Keyboard {
        key: String,
        pressed: bool,
    },
}
