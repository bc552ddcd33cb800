mod convert;
mod manager;
mod session;

pub use manager::{ConnectSummary, ServerManager, ServerRuntime};
pub use session::ServerSession;

/// Connection state of a single server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// Priority for aggregation: the UI-visible global state reflects the
    /// most concerning session.
    fn severity(self) -> u8 {
        match self {
            ConnectionState::Error => 4,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Connecting => 2,
            ConnectionState::Disconnected => 1,
            ConnectionState::Connected => 0,
        }
    }
}

/// Broadcast whenever a session's connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub server_id: String,
    pub old: ConnectionState,
    pub new: ConnectionState,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to build the OPC UA client")]
    ClientBuild,
    #[error("OPC UA call failed: {0:?}")]
    Session(opcua::types::StatusCode),
    #[error("invalid node id {0:?}")]
    InvalidNodeId(String),
    #[error("connect task failed to complete")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Agent-wide session defaults, overridable per server config.
#[derive(Debug, Clone, Copy)]
pub struct SessionDefaults {
    pub session_timeout_ms: u32,
    pub keepalive_interval_ms: u32,
}
