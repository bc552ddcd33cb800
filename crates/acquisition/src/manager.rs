use crate::{ConnectionState, ServerSession, SessionDefaults, StateChange};
use chrono::{DateTime, Utc};
use ingress::SampleQueue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use telemetry::ServerConfig;
use tokio_util::sync::CancellationToken;

/// Outcome of a `connect_all` fan-out. Partial success is the expected
/// shape: an individual endpoint failure never cancels the others.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectSummary {
    pub attempted: usize,
    pub connected: usize,
    pub failed: usize,
}

/// Per-server runtime counters for status snapshots.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerRuntime {
    pub id: String,
    pub name: String,
    pub state: ConnectionState,
    pub samples_received: u64,
    pub last_sample_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Owns the map of server id to session, fans connects and disconnects out
/// across them, and forwards their state-change events to subscribers.
pub struct ServerManager {
    queue: Arc<SampleQueue>,
    defaults: SessionDefaults,
    sessions: Mutex<HashMap<String, Arc<ServerSession>>>,
    events: tokio::sync::broadcast::Sender<StateChange>,
    cancel: CancellationToken,
}

impl ServerManager {
    pub fn new(queue: Arc<SampleQueue>, defaults: SessionDefaults, cancel: CancellationToken) -> Self {
        let (events, _) = tokio::sync::broadcast::channel(64);
        Self {
            queue,
            defaults,
            sessions: Mutex::new(HashMap::new()),
            events,
            cancel,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Ensures a session exists for every enabled config and connects them
    /// concurrently. Individual failures are logged and counted, not
    /// propagated.
    pub async fn connect_all(&self, configs: &[ServerConfig]) -> ConnectSummary {
        let sessions: Vec<Arc<ServerSession>> = configs
            .iter()
            .filter(|config| config.enabled)
            .map(|config| self.ensure_session(config))
            .collect();

        let mut summary = ConnectSummary {
            attempted: sessions.len(),
            ..Default::default()
        };

        let connects = sessions.iter().map(|session| {
            let session = session.clone();
            async move {
                if session.state() == ConnectionState::Connected {
                    return (session, Ok(()));
                }
                let result = session.connect().await;
                (session, result)
            }
        });

        for (session, result) in futures::future::join_all(connects).await {
            match result {
                Ok(()) => summary.connected += 1,
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(
                        server_id = %session.server_id(),
                        ?err,
                        "server connect failed"
                    );
                }
            }
        }
        tracing::info!(
            attempted = summary.attempted,
            connected = summary.connected,
            failed = summary.failed,
            "server connect fan-out finished"
        );
        summary
    }

    /// Idempotent create-and-connect. Adding an already-Connected id is a
    /// no-op.
    pub async fn add_server(&self, config: &ServerConfig) {
        if !config.enabled {
            return;
        }
        let session = self.ensure_session(config);
        if session.state() == ConnectionState::Connected {
            return;
        }
        if let Err(err) = session.connect().await {
            tracing::warn!(server_id = %config.id, ?err, "server connect failed");
        }
    }

    /// Tears the session down and drops the entry. Unknown ids are a no-op.
    pub async fn remove_server(&self, id: &str) {
        let session = self.sessions.lock().unwrap().remove(id);
        if let Some(session) = session {
            session.shutdown().await;
            tracing::info!(server_id = %id, "server removed");
        }
    }

    /// Fan-out disconnect across every session; awaits all of them.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().unwrap().values().cloned().collect();
        futures::future::join_all(sessions.iter().map(|session| session.disconnect())).await;
    }

    /// Disconnects everything and drops all entries.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        self.sessions.lock().unwrap().clear();
    }

    /// The worst state across children: Error > Reconnecting > Connecting >
    /// Disconnected > Connected.
    pub fn aggregate_state(&self) -> ConnectionState {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .values()
            .map(|session| session.state())
            .max_by_key(|state| state.severity())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    /// A copy of every server's runtime counters, sorted by id.
    pub fn runtimes(&self) -> Vec<ServerRuntime> {
        let sessions = self.sessions.lock().unwrap();
        let mut runtimes: Vec<_> = sessions
            .iter()
            .map(|(id, session)| ServerRuntime {
                id: id.clone(),
                name: session.server_name().to_string(),
                state: session.state(),
                samples_received: session.samples_received(),
                last_sample_time: session.last_sample_time(),
                last_error: session.last_error(),
            })
            .collect();
        runtimes.sort_by(|a, b| a.id.cmp(&b.id));
        runtimes
    }

    /// Reconciles the running session set against a fresh config snapshot:
    /// removed ids are torn down, sessions whose endpoint changed are
    /// recycled, changed subscription lists are re-applied, and anything new
    /// is connected.
    pub async fn apply(&self, configs: &[ServerConfig]) -> ConnectSummary {
        let desired: HashMap<&str, &ServerConfig> = configs
            .iter()
            .filter(|config| config.enabled)
            .map(|config| (config.id.as_str(), config))
            .collect();

        for id in self.server_ids() {
            let session = self.sessions.lock().unwrap().get(&id).cloned();
            let Some(session) = session else { continue };
            match desired.get(id.as_str()) {
                None => self.remove_server(&id).await,
                Some(config) if config.endpoint_url != session.endpoint_url() => {
                    tracing::info!(server_id = %id, "endpoint changed; recycling session");
                    self.remove_server(&id).await;
                }
                Some(config) => {
                    if session.subscription_defs() != config.subscriptions {
                        if let Err(err) =
                            session.subscribe(config.subscriptions.clone()).await
                        {
                            tracing::warn!(server_id = %id, ?err, "failed to re-apply subscriptions");
                        }
                    }
                }
            }
        }

        self.connect_all(configs).await
    }

    fn ensure_session(&self, config: &ServerConfig) -> Arc<ServerSession> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(config.id.clone())
            .or_insert_with(|| {
                ServerSession::new(
                    config.clone(),
                    self.defaults,
                    self.queue.clone(),
                    self.events.clone(),
                    self.cancel.child_token(),
                )
            })
            .clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(id: &str) -> ServerConfig {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "endpointUrl": format!("opc.tcp://{id}:4840"),
        }))
        .unwrap()
    }

    fn manager() -> ServerManager {
        ServerManager::new(
            Arc::new(SampleQueue::new(16)),
            SessionDefaults {
                session_timeout_ms: 60_000,
                keepalive_interval_ms: 10_000,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn ensure_session_is_idempotent() {
        let manager = manager();
        let first = manager.ensure_session(&config("plc-1"));
        let second = manager.ensure_session(&config("plc-1"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.server_ids(), vec!["plc-1".to_string()]);
    }

    #[tokio::test]
    async fn aggregate_state_reports_the_worst_child() {
        let manager = manager();
        assert_eq!(manager.aggregate_state(), ConnectionState::Disconnected);

        manager.ensure_session(&config("plc-1"));
        manager.ensure_session(&config("plc-2"));
        // Freshly created sessions are Disconnected.
        assert_eq!(manager.aggregate_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn remove_server_drops_the_entry() {
        let manager = manager();
        manager.ensure_session(&config("plc-1"));
        manager.remove_server("plc-1").await;
        assert!(manager.server_ids().is_empty());
        // Removing again is a no-op.
        manager.remove_server("plc-1").await;
    }

    #[test]
    fn severity_ordering_matches_the_contract() {
        let mut states = vec![
            ConnectionState::Connected,
            ConnectionState::Error,
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Disconnected,
        ];
        states.sort_by_key(|state| state.severity());
        assert_eq!(
            states,
            vec![
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Reconnecting,
                ConnectionState::Error,
            ]
        );
    }
}
