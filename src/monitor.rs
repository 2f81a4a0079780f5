use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::registry::SessionRegistry;

/// How often the monitor sweeps tracked sessions.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Heartbeat silence that earns a warning.
pub const WARN_AFTER: Duration = Duration::from_secs(45);

/// Heartbeat silence after which the connection is considered dead and the
/// handle is severed, even if the transport never signalled closure.
pub const DEAD_AFTER: Duration = Duration::from_secs(90);

/// Periodic sweep that reclaims sessions whose agent has gone silent.
pub async fn run_heartbeat_monitor(registry: Arc<SessionRegistry>) {
    debug!("connection health monitor started");
    let mut ticker = interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        sweep(&registry, Instant::now()).await;
    }
}

/// One sweep, measured against the supplied instant. Sessions past
/// [`DEAD_AFTER`] are severed and reconciled through the same path as a
/// transport-level disconnect; sessions past [`WARN_AFTER`] only get a
/// warning. Returns the ids that were severed.
pub async fn sweep(registry: &SessionRegistry, now: Instant) -> Vec<String> {
    let mut dead = Vec::new();
    for (session_id, lag) in registry.heartbeat_lags(now) {
        if lag > DEAD_AFTER {
            warn!(
                session = %session_id,
                silent_secs = lag.as_secs(),
                "agent appears dead, severing connection"
            );
            dead.push(session_id);
        } else if lag > WARN_AFTER {
            warn!(
                session = %session_id,
                silent_secs = lag.as_secs(),
                "no heartbeat from agent"
            );
        }
    }
    for session_id in &dead {
        registry.sever(session_id).await;
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DirectoryRecord, DirectoryStore, SessionStatus};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn silent_session_is_severed_and_reconciled() {
        let store = DirectoryStore::memory();
        store
            .register(DirectoryRecord::new("s1".to_string(), None))
            .await
            .unwrap();
        let registry = SessionRegistry::new(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.connect("s1", tx);

        let severed = sweep(&registry, Instant::now() + Duration::from_secs(91)).await;
        assert_eq!(severed, vec!["s1".to_string()]);
        assert_eq!(registry.health().tracked, 0);
        // Sender dropped with the severed handle.
        assert!(rx.recv().await.is_none());

        // No stop was requested, so the reclaim counts as unexpected.
        let record = store.find("s1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Disconnected);
        assert!(!record.connection);
    }

    #[tokio::test]
    async fn fresh_session_is_left_alone() {
        let registry = SessionRegistry::new(DirectoryStore::memory());
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.connect("s1", tx);

        let severed = sweep(&registry, Instant::now() + Duration::from_secs(44)).await;
        assert!(severed.is_empty());
        assert!(registry.is_connected("s1"));
    }

    #[tokio::test]
    async fn warn_range_session_is_not_severed() {
        let registry = SessionRegistry::new(DirectoryStore::memory());
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.connect("s1", tx);

        let severed = sweep(&registry, Instant::now() + Duration::from_secs(60)).await;
        assert!(severed.is_empty());
        assert!(registry.is_connected("s1"));
    }

    #[tokio::test]
    async fn heartbeat_refresh_resets_the_clock() {
        let registry = SessionRegistry::new(DirectoryStore::memory());
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.connect("s1", tx);

        registry.heartbeat("s1");
        let severed = sweep(&registry, Instant::now() + Duration::from_secs(10)).await;
        assert!(severed.is_empty());
        assert!(registry.is_connected("s1"));
    }
}
