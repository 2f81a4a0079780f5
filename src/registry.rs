//! In-memory session state for the relay.
//!
//! A **session** pairs one unattended agent with zero or more viewers,
//! addressed by a durable session id the agent supplies at connect time.
//! The registry owns every per-session mutable datum: the live connection
//! handle, the operator intent flag, the liveness timestamp, the bounded
//! frame ingest queue, and the decoded-image cache slot. All state is
//! rebuilt from reconnections after a restart; nothing here persists.

use dashmap::DashMap;
use image::DynamicImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frames::FrameQueue;
use crate::protocol::{AgentCommand, InputEvent};
use crate::storage::{DirectoryStore, SessionStatus};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("session {0} has no live agent connection")]
    NotConnected(String),
    #[error("session id is required")]
    MissingSessionId,
    #[error("session {0} not found in directory store")]
    RecordNotFound(String),
    #[error("no endpoint recorded for session {0}")]
    EndpointUnknown(String),
    #[error("directory store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Operator-declared expectation of whether a session's disconnect is
/// planned. Transitions happen only through the control surface and
/// disconnect cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIntent {
    Unset,
    ActiveRequested,
    StopRequested,
}

/// Outcome of a stop request; both are success as far as the caller goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A live agent was told to disconnect.
    SignalSent,
    /// No live agent; only the directory record was updated.
    NotConnected,
}

/// The live channel to one agent connection. The `conn_id` disambiguates
/// superseded handles: a disconnect for a stale `conn_id` is a no-op.
struct AgentHandle {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<AgentCommand>,
}

struct SessionEntry {
    handle: Option<AgentHandle>,
    intent: SessionIntent,
    last_heartbeat: Instant,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            handle: None,
            intent: SessionIntent::Unset,
            last_heartbeat: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthSnapshot {
    /// Sessions with a live agent handle.
    pub connected: usize,
    /// Sessions with an intent set.
    pub active: usize,
    /// Sessions tracked at all.
    pub tracked: usize,
}

pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    queues: DashMap<String, FrameQueue>,
    cache: DashMap<String, Arc<DynamicImage>>,
    store: DirectoryStore,
}

impl SessionRegistry {
    pub fn new(store: DirectoryStore) -> Self {
        Self {
            sessions: DashMap::new(),
            queues: DashMap::new(),
            cache: DashMap::new(),
            store,
        }
    }

    /// Register an agent connection, superseding any previous handle for
    /// the same session. Idempotent; no error path. Returns the transient
    /// connection id the socket task hands back on disconnect.
    pub fn connect(&self, session_id: &str, tx: mpsc::UnboundedSender<AgentCommand>) -> Uuid {
        let conn_id = Uuid::new_v4();
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionEntry::new);
        if entry.handle.is_some() {
            // Dropping the old sender ends the previous socket's command
            // forwarder, which closes that connection.
            info!(session = %session_id, "superseding existing agent connection");
        }
        entry.handle = Some(AgentHandle { conn_id, tx });
        entry.last_heartbeat = Instant::now();
        conn_id
    }

    /// Resolve a closed connection back to its session and reconcile it.
    /// Stale ids (superseded or already-severed handles) are ignored.
    pub async fn disconnect(&self, conn_id: Uuid) {
        let session_id = self.sessions.iter().find_map(|entry| match &entry.handle {
            Some(handle) if handle.conn_id == conn_id => Some(entry.key().clone()),
            _ => None,
        });
        match session_id {
            Some(session_id) => self.reconcile(&session_id).await,
            None => debug!(%conn_id, "disconnect for untracked connection, ignoring"),
        }
    }

    /// Record a heartbeat and acknowledge it through the session's live
    /// handle, if any. The registry holds the only sender for a connection,
    /// so the ack travels the same channel a sever or supersession closes;
    /// a heartbeat from a severed transport gets no ack.
    pub fn heartbeat(&self, session_id: &str) -> i64 {
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionEntry::new);
        entry.last_heartbeat = Instant::now();
        let timestamp = chrono::Utc::now().timestamp();
        if let Some(handle) = entry.handle.as_ref() {
            let _ = handle.tx.send(AgentCommand::HeartbeatAck { timestamp });
        }
        timestamp
    }

    /// Enqueue a raw frame payload. Frame traffic doubles as liveness, so
    /// the heartbeat timestamp is refreshed first.
    pub fn submit_frame(&self, session_id: &str, payload: Vec<u8>) {
        {
            let mut entry = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(SessionEntry::new);
            entry.last_heartbeat = Instant::now();
        }
        let queue = self
            .queues
            .entry(session_id.to_string())
            .or_insert_with(FrameQueue::new);
        if queue.push(payload) {
            debug!(session = %session_id, "frame queue full, dropped oldest entry");
        }
    }

    /// Start a streaming session: requires a live handle, marks the session
    /// as intentionally active, pushes `start` to the agent, and records
    /// Running in the directory store (best effort).
    pub async fn request_start(
        &self,
        session_id: &str,
        key: Option<String>,
    ) -> Result<(), RelayError> {
        self.push_command(
            session_id,
            SessionIntent::ActiveRequested,
            AgentCommand::Start {
                session_id: session_id.to_string(),
                key,
            },
        )?;
        if let Err(err) = self
            .store
            .update_status(session_id, SessionStatus::Running, true)
            .await
        {
            warn!(session = %session_id, %err, "directory store write failed for start");
        }
        Ok(())
    }

    /// Begin liveness checking on the agent without touching frame state.
    pub fn request_monitor_start(&self, session_id: &str) -> Result<(), RelayError> {
        self.push_command(
            session_id,
            SessionIntent::ActiveRequested,
            AgentCommand::BeginLivenessCheck {
                session_id: session_id.to_string(),
            },
        )
    }

    /// Stop a session. With a live handle the agent is told to disconnect
    /// and the later close is classified as expected; without one only the
    /// directory record is updated. Never waits for the agent to comply,
    /// so a racing reconnect can overwrite the Stopped status afterwards.
    pub async fn request_stop(&self, session_id: &str) -> StopOutcome {
        let mut connected = false;
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            match entry.handle.as_ref() {
                Some(handle) => {
                    let _ = handle.tx.send(AgentCommand::Stop {
                        reason: "stop_requested".to_string(),
                    });
                    connected = true;
                }
                None => {}
            }
            entry.intent = if connected {
                SessionIntent::StopRequested
            } else {
                SessionIntent::Unset
            };
        }
        if let Err(err) = self
            .store
            .update_status(session_id, SessionStatus::Stopped, false)
            .await
        {
            warn!(session = %session_id, %err, "directory store write failed for stop");
        }
        if connected {
            info!(session = %session_id, "stop signal sent to agent");
            StopOutcome::SignalSent
        } else {
            debug!(session = %session_id, "stop requested for unconnected session");
            StopOutcome::NotConnected
        }
    }

    /// Forward a viewer input event to the agent bound to `session_id`.
    /// Delivery is point-to-point; events are never broadcast. Returns
    /// false when no live handle exists.
    pub fn forward_input(&self, session_id: &str, event: InputEvent) -> bool {
        let Some(entry) = self.sessions.get(session_id) else {
            return false;
        };
        match &entry.handle {
            Some(handle) => handle.tx.send(AgentCommand::Input { event }).is_ok(),
            None => false,
        }
    }

    /// Pure read of connection/intent counts.
    pub fn health(&self) -> HealthSnapshot {
        let mut connected = 0;
        let mut active = 0;
        for entry in self.sessions.iter() {
            if entry.handle.is_some() {
                connected += 1;
            }
            if entry.intent != SessionIntent::Unset {
                active += 1;
            }
        }
        HealthSnapshot {
            connected,
            active,
            tracked: self.sessions.len(),
        }
    }

    /// Sever the agent handle (dropping the sender closes the socket's
    /// command forwarder) and reconcile. Used by the heartbeat monitor to
    /// reclaim sessions whose transport never signalled closure.
    pub async fn sever(&self, session_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.handle.take();
        }
        self.reconcile(session_id).await;
    }

    /// Elapsed time since each tracked session's last heartbeat, measured
    /// against the supplied instant.
    pub fn heartbeat_lags(&self, now: Instant) -> Vec<(String, Duration)> {
        self.sessions
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    now.saturating_duration_since(entry.last_heartbeat),
                )
            })
            .collect()
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|entry| entry.handle.is_some())
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn intent(&self, session_id: &str) -> Option<SessionIntent> {
        self.sessions.get(session_id).map(|entry| entry.intent)
    }

    // Decode-pipeline surface.

    /// Session ids with at least one queued frame.
    pub fn queued_sessions(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|queue| !queue.is_empty())
            .map(|queue| queue.key().clone())
            .collect()
    }

    pub fn pop_frame(&self, session_id: &str) -> Option<Vec<u8>> {
        self.queues.get(session_id).and_then(|queue| queue.pop())
    }

    pub fn queued_frames(&self, session_id: &str) -> usize {
        self.queues
            .get(session_id)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    /// Publish a decoded frame; last write wins.
    pub fn store_decoded(&self, session_id: &str, image: DynamicImage) {
        self.cache.insert(session_id.to_string(), Arc::new(image));
    }

    /// Snapshot of the most recent successfully decoded frame, if any.
    pub fn latest_frame(&self, session_id: &str) -> Option<Arc<DynamicImage>> {
        self.cache
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    /// Disconnect reconciliation: classify the loss from the recorded
    /// intent, write the terminal status to the directory store (best
    /// effort), then delete every trace of the session. In-memory cleanup
    /// is unconditional; a failed store write never leaks state.
    async fn reconcile(&self, session_id: &str) {
        let Some((_, entry)) = self.sessions.remove(session_id) else {
            return;
        };
        let status = if entry.intent == SessionIntent::StopRequested {
            info!(session = %session_id, "agent disconnected after stop request");
            SessionStatus::Stopped
        } else {
            warn!(session = %session_id, "unexpected agent disconnect");
            SessionStatus::Disconnected
        };
        if let Err(err) = self.store.update_status(session_id, status, false).await {
            warn!(session = %session_id, %err, "directory store write failed during reconciliation");
        }
        self.queues.remove(session_id);
        self.cache.remove(session_id);
        debug!(session = %session_id, "session reconciled");
    }

    fn push_command(
        &self,
        session_id: &str,
        intent: SessionIntent,
        command: AgentCommand,
    ) -> Result<(), RelayError> {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return Err(RelayError::NotConnected(session_id.to_string()));
        };
        match entry.handle.as_ref() {
            Some(handle) => {
                if handle.tx.send(command).is_err() {
                    // Receiver already gone; the disconnect path will run.
                    warn!(session = %session_id, "agent channel closed while pushing command");
                }
            }
            None => return Err(RelayError::NotConnected(session_id.to_string())),
        }
        entry.intent = intent;
        Ok(())
    }
}
