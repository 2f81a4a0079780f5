use anyhow::{anyhow, Result};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle status persisted for a session in the directory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Stopped,
    Disconnected,
}

impl SessionStatus {
    /// Capitalized spellings are shared with the backend that reads these
    /// records, so they are part of the contract.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "Running",
            SessionStatus::Stopped => "Stopped",
            SessionStatus::Disconnected => "Disconnected",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "Running" => Some(SessionStatus::Running),
            "Stopped" => Some(SessionStatus::Stopped),
            "Disconnected" => Some(SessionStatus::Disconnected),
            _ => None,
        }
    }
}

/// Durable record for a session, keyed by its id. The relay reads the
/// endpoint hint at session-start time and writes status transitions;
/// everything else about the record belongs to the registration side.
#[derive(Debug, Clone)]
pub struct DirectoryRecord {
    pub session_id: String,
    pub status: SessionStatus,
    pub connection: bool,
    pub local_ip: Option<String>,
    pub updated_at: i64,
}

impl DirectoryRecord {
    pub fn new(session_id: String, local_ip: Option<String>) -> Self {
        Self {
            session_id,
            status: SessionStatus::Stopped,
            connection: false,
            local_ip,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Hash-field encoding for the Redis backend. `local_ip` is omitted
    /// when absent rather than stored as a sentinel.
    fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("session_id", self.session_id.clone()),
            ("status", self.status.as_str().to_string()),
            ("connection", self.connection.to_string()),
            ("updated_at", self.updated_at.to_string()),
        ];
        if let Some(ip) = &self.local_ip {
            fields.push(("local_ip", ip.clone()));
        }
        fields
    }
}

fn record_from_hash(mut fields: HashMap<String, String>) -> Result<DirectoryRecord> {
    let mut take = |key: &str| {
        fields
            .remove(key)
            .ok_or_else(|| anyhow!("directory record missing field {}", key))
    };
    let session_id = take("session_id")?;
    let status = take("status")?;
    let connection = take("connection")?.parse()?;
    let updated_at = take("updated_at")?.parse()?;
    Ok(DirectoryRecord {
        session_id,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown session status {}", status))?,
        connection,
        local_ip: fields.remove("local_ip"),
        updated_at,
    })
}

/// Directory store client. Redis in production; an in-memory map for tests,
/// which also keeps the relay runnable without external services.
#[derive(Clone)]
pub struct DirectoryStore {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Redis(ConnectionManager),
    Memory(Arc<DashMap<String, DirectoryRecord>>),
}

fn record_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

impl DirectoryStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            backend: Backend::Redis(redis),
        })
    }

    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(DashMap::new())),
        }
    }

    pub async fn find(&self, session_id: &str) -> Result<Option<DirectoryRecord>> {
        match &self.backend {
            Backend::Redis(redis) => {
                let mut conn = redis.clone();
                let fields: HashMap<String, String> =
                    conn.hgetall(record_key(session_id)).await?;
                if fields.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(record_from_hash(fields)?))
                }
            }
            Backend::Memory(map) => Ok(map.get(session_id).map(|r| r.value().clone())),
        }
    }

    pub async fn register(&self, record: DirectoryRecord) -> Result<()> {
        match &self.backend {
            Backend::Redis(redis) => {
                let mut conn = redis.clone();
                conn.hset_multiple::<_, _, _, ()>(
                    record_key(&record.session_id),
                    &record.to_fields(),
                )
                .await?;
                Ok(())
            }
            Backend::Memory(map) => {
                map.insert(record.session_id.clone(), record);
                Ok(())
            }
        }
    }

    /// Write a status transition onto an existing record. Unknown ids are a
    /// no-op: the relay never creates directory records on its own. The
    /// write is a single HSET of only relay-owned fields, so it cannot
    /// clobber fields a concurrent registration-side writer touches.
    pub async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        connection: bool,
    ) -> Result<()> {
        match &self.backend {
            Backend::Redis(redis) => {
                let mut conn = redis.clone();
                let key = record_key(session_id);
                let exists: bool = conn.exists(&key).await?;
                if !exists {
                    tracing::debug!(session = %session_id, "status update for unknown directory record");
                    return Ok(());
                }
                conn.hset_multiple::<_, _, _, ()>(
                    &key,
                    &[
                        ("status", status.as_str().to_string()),
                        ("connection", connection.to_string()),
                        ("updated_at", chrono::Utc::now().timestamp().to_string()),
                    ],
                )
                .await?;
                Ok(())
            }
            Backend::Memory(map) => {
                if let Some(mut record) = map.get_mut(session_id) {
                    record.status = status;
                    record.connection = connection;
                    record.updated_at = chrono::Utc::now().timestamp();
                } else {
                    tracing::debug!(session = %session_id, "status update for unknown directory record");
                }
                Ok(())
            }
        }
    }
}
