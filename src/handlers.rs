use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::registry::{RelayError, SessionRegistry, StopOutcome};
use crate::storage::DirectoryStore;

/// Shared state for the HTTP and WebSocket surfaces.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub store: DirectoryStore,
}

#[derive(Debug, Deserialize)]
pub struct SessionActionRequest {
    pub session_id: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartMonitorResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct RequestSessionResponse {
    pub endpoint_hint: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StopSessionResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connected: usize,
    pub active: usize,
    pub tracked: usize,
}

/// Only missing-id validation and `NotConnected`-style failures surface to
/// control-plane callers; everything else is a server fault.
fn error_status(err: &RelayError) -> StatusCode {
    match err {
        RelayError::MissingSessionId => StatusCode::BAD_REQUEST,
        RelayError::NotConnected(_)
        | RelayError::RecordNotFound(_)
        | RelayError::EndpointUnknown(_) => StatusCode::NOT_FOUND,
        RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn required_session_id(payload: &SessionActionRequest) -> Result<String, RelayError> {
    payload
        .session_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .ok_or(RelayError::MissingSessionId)
}

/// POST /sessions/monitor - tell a connected agent to begin liveness checks.
pub async fn start_monitor(
    State(state): State<AppState>,
    Json(payload): Json<SessionActionRequest>,
) -> Result<Json<StartMonitorResponse>, StatusCode> {
    let result = (|| -> Result<String, RelayError> {
        let session_id = required_session_id(&payload)?;
        state.registry.request_monitor_start(&session_id)?;
        Ok(session_id)
    })();

    match result {
        Ok(session_id) => {
            debug!(session = %session_id, "monitor start pushed to agent");
            Ok(Json(StartMonitorResponse {
                status: "success",
                message: "agent notified to start monitoring",
                session_id,
            }))
        }
        Err(err) => {
            warn!(%err, "monitor start rejected");
            Err(error_status(&err))
        }
    }
}

/// POST /sessions/request - start a streaming session for a connected agent.
/// Resolves the agent's directory record first; its stored local IP is
/// returned as the endpoint hint.
pub async fn request_session(
    State(state): State<AppState>,
    Json(payload): Json<SessionActionRequest>,
) -> Result<Json<RequestSessionResponse>, StatusCode> {
    match try_request_session(&state, payload).await {
        Ok(response) => Ok(Json(response)),
        Err(err) => {
            match &err {
                RelayError::Store(inner) => error!(%inner, "directory store lookup failed"),
                other => warn!(err = %other, "session start rejected"),
            }
            Err(error_status(&err))
        }
    }
}

async fn try_request_session(
    state: &AppState,
    payload: SessionActionRequest,
) -> Result<RequestSessionResponse, RelayError> {
    let session_id = required_session_id(&payload)?;
    debug!(session = %session_id, "session start requested");

    let record = state
        .store
        .find(&session_id)
        .await?
        .ok_or_else(|| RelayError::RecordNotFound(session_id.clone()))?;
    let endpoint_hint = record
        .local_ip
        .ok_or_else(|| RelayError::EndpointUnknown(session_id.clone()))?;

    state.registry.request_start(&session_id, payload.key).await?;
    debug!(session = %session_id, "session started");
    Ok(RequestSessionResponse {
        endpoint_hint,
        status: "started",
    })
}

/// POST /sessions/stop - stop a session. Always succeeds when an id is
/// supplied: the directory record is marked Stopped whether or not an
/// agent is connected, and a connected agent is told to disconnect.
pub async fn stop_session(
    State(state): State<AppState>,
    Json(payload): Json<SessionActionRequest>,
) -> Result<Json<StopSessionResponse>, StatusCode> {
    let session_id = required_session_id(&payload).map_err(|err| {
        warn!(%err, "stop rejected");
        error_status(&err)
    })?;
    debug!(session = %session_id, "session stop requested");

    let status = match state.registry.request_stop(&session_id).await {
        StopOutcome::SignalSent => "disconnect signal sent",
        StopOutcome::NotConnected => "agent not connected, directory updated",
    };
    Ok(Json(StopSessionResponse { status }))
}

/// GET /health - connection/session counters. Pure read.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.registry.health();
    Json(HealthResponse {
        status: "healthy",
        connected: snapshot.connected,
        active: snapshot.active,
        tracked: snapshot.tracked,
    })
}
