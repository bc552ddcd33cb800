use crate::convert::{data_type_name, variant_value};
use crate::{ConnectionState, Error, Result, SessionDefaults, StateChange};
use chrono::{DateTime, TimeZone, Utc};
use exponential_backoff::Backoff;
use ingress::SampleQueue;
use opcua::client::prelude::*;
use opcua::sync::RwLock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry::{quality_label, Sample, SampleValue, ServerConfig, SubscriptionDef};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Reconnect backoff: doubling from 5s to a 60s ceiling, unbounded attempts
/// until cancelled.
const RECONNECT_MIN: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// A live connection to the endpoint: the opcua client/session pair, the
/// running message pump, and the server-side subscription id (when any
/// definitions are enabled).
struct Connection {
    #[allow(dead_code)] // owns the PKI state backing the session
    client: Client,
    session: Arc<RwLock<Session>>,
    stop: tokio::sync::oneshot::Sender<SessionCommand>,
    subscription_id: Option<u32>,
}

/// State shared with the opcua callback threads. Everything the
/// notification handler touches lives here, behind short guards or atomics:
/// the handler performs exactly one non-blocking queue publish per value and
/// no other I/O.
struct Shared {
    server_id: String,
    server_name: String,
    endpoint_url: String,
    queue: Arc<SampleQueue>,
    subscriptions: Mutex<SubscriptionTable>,
    state: Mutex<ConnectionState>,
    last_error: Mutex<Option<String>>,
    samples_received: AtomicU64,
    last_sample_unix_ms: AtomicI64,
    events: broadcast::Sender<StateChange>,
    reconnect: mpsc::UnboundedSender<String>,
    /// Set during deliberate teardown so close callbacks from our own
    /// disconnect do not trigger a reconnect.
    detached: AtomicBool,
}

#[derive(Default)]
struct SubscriptionTable {
    defs: Vec<SubscriptionDef>,
    by_node: HashMap<String, usize>,
}

impl SubscriptionTable {
    fn replace(&mut self, defs: Vec<SubscriptionDef>) {
        self.by_node = defs
            .iter()
            .enumerate()
            .map(|(index, def)| (def.node_id.clone(), index))
            .collect();
        self.defs = defs;
    }

    /// Display name and browse path for a node, falling back to the node id
    /// itself on a lookup miss.
    fn identify(&self, node_id: &str) -> (String, String) {
        match self.by_node.get(node_id).map(|index| &self.defs[*index]) {
            Some(def) => {
                let display = if def.display_name.is_empty() {
                    node_id.to_string()
                } else {
                    def.display_name.clone()
                };
                let path = if def.browse_path.is_empty() {
                    display.clone()
                } else {
                    def.browse_path.clone()
                };
                (display, path)
            }
            None => (node_id.to_string(), node_id.to_string()),
        }
    }
}

impl Shared {
    fn set_state(&self, new: ConnectionState) {
        let old = {
            let mut state = self.state.lock().unwrap();
            let old = *state;
            *state = new;
            old
        };
        if old != new {
            tracing::info!(server_id = %self.server_id, ?old, ?new, "session state changed");
            let _ = self.events.send(StateChange {
                server_id: self.server_id.clone(),
                old,
                new,
            });
        }
    }

    fn record_error(&self, error: &Error) {
        *self.last_error.lock().unwrap() = Some(error.to_string());
    }

    fn signal_reconnect(&self, reason: &str) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        let _ = self.reconnect.send(reason.to_string());
    }

    /// The notification handler. Runs on an opcua callback thread.
    fn on_data_change(&self, items: &[&MonitoredItem]) {
        let received_at = Utc::now();
        for item in items {
            let node_id = item.item_to_monitor().node_id.to_string();
            let sample = self.build_sample(&node_id, item.last_value(), received_at);
            self.queue.publish(sample);
            self.samples_received.fetch_add(1, Ordering::Relaxed);
            self.last_sample_unix_ms
                .store(received_at.timestamp_millis(), Ordering::Relaxed);
        }
    }

    fn build_sample(&self, node_id: &str, value: &DataValue, received_at: DateTime<Utc>) -> Sample {
        let (display_name, browse_path) = {
            // Short guard: subscribe/reconnect replace the table, the
            // handler only reads it.
            let table = self.subscriptions.lock().unwrap();
            table.identify(node_id)
        };
        let status_code = value.status.unwrap_or(StatusCode::Good).bits();
        let (sample_value, data_type) = match value.value.as_ref() {
            Some(variant) => (variant_value(variant), data_type_name(variant)),
            None => (SampleValue::Null, "Null".to_string()),
        };
        Sample {
            server_id: self.server_id.clone(),
            server_name: self.server_name.clone(),
            timestamp_utc: received_at,
            node_id: node_id.to_string(),
            display_name,
            browse_path,
            data_type,
            value: sample_value,
            status_code,
            quality: quality_label(status_code).to_string(),
            source_timestamp: value.source_timestamp.as_ref().map(|ts| ts.as_chrono()),
            server_timestamp: value.server_timestamp.as_ref().map(|ts| ts.as_chrono()),
        }
    }
}

/// Owns the OPC UA session to a single endpoint: connect/disconnect, the
/// subscription under it, and the reconnect loop that keeps it alive.
pub struct ServerSession {
    config: ServerConfig,
    defaults: SessionDefaults,
    shared: Arc<Shared>,
    connection: tokio::sync::Mutex<Option<Connection>>,
    cancel: CancellationToken,
}

impl ServerSession {
    pub fn new(
        config: ServerConfig,
        defaults: SessionDefaults,
        queue: Arc<SampleQueue>,
        events: broadcast::Sender<StateChange>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            server_id: config.id.clone(),
            server_name: config.name().to_string(),
            endpoint_url: config.endpoint_url.clone(),
            queue,
            subscriptions: Mutex::new(SubscriptionTable::default()),
            state: Mutex::new(ConnectionState::Disconnected),
            last_error: Mutex::new(None),
            samples_received: AtomicU64::new(0),
            last_sample_unix_ms: AtomicI64::new(0),
            events,
            reconnect: reconnect_tx,
            detached: AtomicBool::new(true),
        });
        shared
            .subscriptions
            .lock()
            .unwrap()
            .replace(config.subscriptions.clone());

        let session = Arc::new(Self {
            config,
            defaults,
            shared,
            connection: tokio::sync::Mutex::new(None),
            cancel,
        });
        tokio::spawn(Self::reconnect_loop(session.clone(), reconnect_rx));
        session
    }

    pub fn server_id(&self) -> &str {
        &self.config.id
    }

    pub fn server_name(&self) -> &str {
        &self.shared.server_name
    }

    pub fn endpoint_url(&self) -> &str {
        &self.config.endpoint_url
    }

    /// A copy of the currently stored subscription definitions.
    pub fn subscription_defs(&self) -> Vec<SubscriptionDef> {
        self.shared.subscriptions.lock().unwrap().defs.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn samples_received(&self) -> u64 {
        self.shared.samples_received.load(Ordering::Relaxed)
    }

    pub fn last_sample_time(&self) -> Option<DateTime<Utc>> {
        match self.shared.last_sample_unix_ms.load(Ordering::Relaxed) {
            0 => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().unwrap().clone()
    }

    /// Establishes the session and its subscription. On failure the session
    /// lands in Error; the caller may retry by calling connect again.
    pub async fn connect(&self) -> Result<()> {
        self.shared.set_state(ConnectionState::Connecting);
        match self.establish().await {
            Ok(()) => {
                self.shared.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                self.shared.record_error(&err);
                self.shared.set_state(ConnectionState::Error);
                Err(err)
            }
        }
    }

    /// Tears down the subscription and session.
    pub async fn disconnect(&self) {
        self.teardown().await;
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Disconnects and retires the session for good: its reconnect loop
    /// exits and no further connect is expected.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.disconnect().await;
    }

    /// Replaces the stored subscription list atomically and, when connected,
    /// rebuilds the server-side subscription from it.
    pub async fn subscribe(&self, defs: Vec<SubscriptionDef>) -> Result<()> {
        self.shared.subscriptions.lock().unwrap().replace(defs);
        let mut connection = self.connection.lock().await;
        let Some(conn) = connection.as_mut() else {
            return Ok(()); // Applied on next connect.
        };

        let session = conn.session.clone();
        let old_id = conn.subscription_id.take();
        let shared = self.shared.clone();
        let keepalive = self.keepalive_interval_ms();
        conn.subscription_id = tokio::task::spawn_blocking(move || {
            if let Some(id) = old_id {
                let _ = session.read().delete_subscription(id);
            }
            create_subscription_blocking(&session, &shared, keepalive)
        })
        .await??;
        Ok(())
    }

    fn session_timeout_ms(&self) -> u32 {
        self.config
            .session_timeout_ms
            .unwrap_or(self.defaults.session_timeout_ms)
    }

    fn keepalive_interval_ms(&self) -> u32 {
        self.config
            .keepalive_interval_ms
            .unwrap_or(self.defaults.keepalive_interval_ms)
    }

    async fn establish(&self) -> Result<()> {
        // Tear down any previous connection first: the configured endpoint
        // URL on this session is the sole source of truth for where to
        // reconnect.
        self.teardown().await;

        let shared = self.shared.clone();
        let endpoint_url = self.config.endpoint_url.clone();
        let session_timeout = self.session_timeout_ms();
        let keepalive = self.keepalive_interval_ms();

        let connection =
            tokio::task::spawn_blocking(move || {
                establish_blocking(shared, endpoint_url, session_timeout, keepalive)
            })
            .await??;

        *self.connection.lock().await = Some(connection);
        self.shared.detached.store(false, Ordering::Release);
        Ok(())
    }

    async fn teardown(&self) {
        self.shared.detached.store(true, Ordering::Release);
        let Some(conn) = self.connection.lock().await.take() else {
            return;
        };
        let _ = tokio::task::spawn_blocking(move || {
            let _ = conn.stop.send(SessionCommand::Stop);
            conn.session.write().disconnect();
        })
        .await;
    }

    /// Runs for the session's lifetime: each keepalive or close signal
    /// starts a reconnect cycle that retries with doubling backoff until it
    /// succeeds or the session is cancelled.
    async fn reconnect_loop(session: Arc<Self>, mut signals: mpsc::UnboundedReceiver<String>) {
        let cancel = session.cancel.clone();
        loop {
            let reason = tokio::select! {
                () = cancel.cancelled() => return,
                reason = signals.recv() => match reason {
                    Some(reason) => reason,
                    None => return,
                },
            };
            // Collapse signals that piled up while we were not looking.
            while signals.try_recv().is_ok() {}

            tracing::warn!(
                server_id = %session.config.id,
                reason,
                "session lost; entering reconnect"
            );
            session.shared.set_state(ConnectionState::Reconnecting);

            let backoff = reconnect_backoff();
            let mut attempt = 0u32;
            loop {
                if cancel.is_cancelled() {
                    session.teardown().await;
                    session.shared.set_state(ConnectionState::Disconnected);
                    return;
                }
                attempt += 1;
                match session.establish().await {
                    Ok(()) => {
                        tracing::info!(server_id = %session.config.id, attempt, "reconnected");
                        session.shared.set_state(ConnectionState::Connected);
                        break;
                    }
                    Err(err) => {
                        session.shared.record_error(&err);
                        let delay = backoff.next(attempt).unwrap_or(RECONNECT_MAX);
                        tracing::warn!(
                            server_id = %session.config.id,
                            ?err,
                            attempt,
                            retry_in = ?delay,
                            "reconnect attempt failed"
                        );
                        tokio::select! {
                            () = cancel.cancelled() => (),
                            () = tokio::time::sleep(delay) => (),
                        }
                    }
                }
            }
        }
    }
}

fn reconnect_backoff() -> Backoff {
    let mut backoff = Backoff::new(u32::MAX, RECONNECT_MIN, Some(RECONNECT_MAX));
    backoff.set_factor(2);
    backoff.set_jitter(0.0);
    backoff
}

/// Builds the opcua client, connects and activates the session, wires the
/// liveness callbacks, and creates the subscription. Runs on a blocking
/// thread: the opcua stack is synchronous.
fn establish_blocking(
    shared: Arc<Shared>,
    endpoint_url: String,
    session_timeout_ms: u32,
    keepalive_interval_ms: u32,
) -> Result<Connection> {
    let mut client = ClientBuilder::new()
        .application_name("Fieldgate Acquisition Agent")
        .application_uri("urn:fieldgate:agent")
        .product_uri("urn:fieldgate:agent")
        .pki_dir("./pki")
        .create_sample_keypair(true)
        .trust_server_certs(true)
        .session_timeout(session_timeout_ms)
        // Reconnects are owned by the session's own loop.
        .session_retry_limit(0)
        .client()
        .ok_or(Error::ClientBuild)?;

    let endpoint: EndpointDescription = (
        endpoint_url.as_str(),
        SecurityPolicy::None.to_str(),
        MessageSecurityMode::None,
        UserTokenPolicy::anonymous(),
    )
        .into();

    let session = client
        .connect_to_endpoint(endpoint, IdentityToken::Anonymous)
        .map_err(Error::Session)?;

    {
        let mut guard = session.write();
        let on_status = shared.clone();
        guard.set_connection_status_callback(ConnectionStatusCallback::new(move |connected| {
            if !connected {
                on_status.signal_reconnect("transport connection lost");
            }
        }));
        let on_closed = shared.clone();
        guard.set_session_closed_callback(SessionClosedCallback::new(move |status| {
            // Bad status covers invalid-session, closed-connection, and
            // communication-error keepalive outcomes; a deliberate local
            // disconnect arrives as Good and is ignored.
            if status.is_bad() {
                on_closed.signal_reconnect(&format!("session closed: {status:?}"));
            }
        }));
    }

    let subscription_id = create_subscription_blocking(&session, &shared, keepalive_interval_ms)?;
    let stop = Session::run_async(session.clone());

    Ok(Connection {
        client,
        session,
        stop,
        subscription_id,
    })
}

/// Creates the subscription and its monitored items from the stored
/// definitions. The requested publishing interval is the minimum across the
/// enabled definitions; the keepalive count is derived from the configured
/// keepalive interval.
fn create_subscription_blocking(
    session: &Arc<RwLock<Session>>,
    shared: &Arc<Shared>,
    keepalive_interval_ms: u32,
) -> Result<Option<u32>> {
    let defs: Vec<SubscriptionDef> = {
        let table = shared.subscriptions.lock().unwrap();
        table.defs.iter().filter(|def| def.enabled).cloned().collect()
    };
    if defs.is_empty() {
        return Ok(None);
    }

    let publishing_interval_ms = defs
        .iter()
        .map(|def| def.publishing_interval_ms)
        .min()
        .unwrap_or(1_000)
        .max(1);
    let keep_alive_count =
        (u64::from(keepalive_interval_ms) / u64::from(publishing_interval_ms)).max(1) as u32;

    let session = session.read();
    let handler = shared.clone();
    let subscription_id = session
        .create_subscription(
            f64::from(publishing_interval_ms),
            keep_alive_count * 3, // lifetime must outlast several keepalives
            keep_alive_count,
            0,
            0,
            true,
            DataChangeCallback::new(move |items| handler.on_data_change(&items)),
        )
        .map_err(Error::Session)?;

    let mut requests = Vec::with_capacity(defs.len());
    for (index, def) in defs.iter().enumerate() {
        let node_id = NodeId::from_str(&def.node_id)
            .map_err(|_| Error::InvalidNodeId(def.node_id.clone()))?;
        requests.push(MonitoredItemCreateRequest {
            item_to_monitor: ReadValueId {
                node_id,
                attribute_id: AttributeId::Value as u32,
                index_range: UAString::null(),
                data_encoding: QualifiedName::null(),
            },
            monitoring_mode: MonitoringMode::Reporting,
            requested_parameters: MonitoringParameters {
                client_handle: index as u32 + 1,
                sampling_interval: f64::from(def.sampling_interval_ms),
                filter: ExtensionObject::null(),
                queue_size: def.queue_size,
                discard_oldest: def.discard_oldest,
            },
        });
    }

    let results = session
        .create_monitored_items(subscription_id, TimestampsToReturn::Both, &requests)
        .map_err(Error::Session)?;
    for (def, result) in defs.iter().zip(&results) {
        if result.status_code.is_bad() {
            tracing::warn!(
                server_id = %shared.server_id,
                node_id = %def.node_id,
                status = ?result.status_code,
                "monitored item was rejected by the server"
            );
        }
    }
    tracing::info!(
        server_id = %shared.server_id,
        endpoint = %shared.endpoint_url,
        items = defs.len(),
        publishing_interval_ms,
        "subscription created"
    );

    Ok(Some(subscription_id))
}

#[cfg(test)]
mod test {
    use super::*;

    fn shared() -> (Arc<Shared>, broadcast::Receiver<StateChange>) {
        let (events, events_rx) = broadcast::channel(16);
        let (reconnect, _reconnect_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            server_id: "plc-1".to_string(),
            server_name: "Line 1 PLC".to_string(),
            endpoint_url: "opc.tcp://plc-1:4840".to_string(),
            queue: Arc::new(SampleQueue::new(16)),
            subscriptions: Mutex::new(SubscriptionTable::default()),
            state: Mutex::new(ConnectionState::Disconnected),
            last_error: Mutex::new(None),
            samples_received: AtomicU64::new(0),
            last_sample_unix_ms: AtomicI64::new(0),
            events,
            reconnect,
            detached: AtomicBool::new(false),
        });
        (shared, events_rx)
    }

    fn def(node_id: &str, display: &str, path: &str) -> SubscriptionDef {
        serde_json::from_value(serde_json::json!({
            "nodeId": node_id,
            "displayName": display,
            "browsePath": path,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn state_changes_emit_events_once() {
        let (shared, mut events) = shared();
        shared.set_state(ConnectionState::Connecting);
        shared.set_state(ConnectionState::Connecting);
        shared.set_state(ConnectionState::Connected);

        let first = events.recv().await.unwrap();
        assert_eq!(first.old, ConnectionState::Disconnected);
        assert_eq!(first.new, ConnectionState::Connecting);
        let second = events.recv().await.unwrap();
        assert_eq!(second.new, ConnectionState::Connected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn samples_carry_identity_and_browse_path() {
        let (shared, _events) = shared();
        shared.subscriptions.lock().unwrap().replace(vec![def(
            "ns=2;s=Line1.Temperature",
            "Temperature",
            "Plant/Line1/Temperature",
        )]);

        let mut value = DataValue::default();
        value.value = Some(Variant::Double(21.5));
        value.status = Some(StatusCode::Good);

        let sample = shared.build_sample("ns=2;s=Line1.Temperature", &value, Utc::now());
        assert_eq!(sample.server_id, "plc-1");
        assert_eq!(sample.server_name, "Line 1 PLC");
        assert_eq!(sample.display_name, "Temperature");
        assert_eq!(sample.browse_path, "Plant/Line1/Temperature");
        assert_eq!(sample.data_type, "Double");
        assert_eq!(sample.value, SampleValue::Float(21.5));
        assert_eq!(sample.quality, "Good");

        // Unknown nodes fall back to the node id for both identifiers.
        let sample = shared.build_sample("ns=2;s=Unknown", &value, Utc::now());
        assert_eq!(sample.display_name, "ns=2;s=Unknown");
        assert_eq!(sample.browse_path, "ns=2;s=Unknown");
    }

    #[tokio::test]
    async fn missing_value_is_an_explicit_null() {
        let (shared, _events) = shared();
        let value = DataValue::default();
        let sample = shared.build_sample("ns=2;s=X", &value, Utc::now());
        assert_eq!(sample.value, SampleValue::Null);
        assert_eq!(sample.data_type, "Null");
        assert_eq!(sample.status_code, 0);
    }

    #[tokio::test]
    async fn detached_sessions_swallow_reconnect_signals() {
        let (events, _events_rx) = broadcast::channel(16);
        let (reconnect, mut reconnect_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            server_id: "plc-1".to_string(),
            server_name: "PLC".to_string(),
            endpoint_url: "opc.tcp://plc-1:4840".to_string(),
            queue: Arc::new(SampleQueue::new(4)),
            subscriptions: Mutex::new(SubscriptionTable::default()),
            state: Mutex::new(ConnectionState::Connected),
            last_error: Mutex::new(None),
            samples_received: AtomicU64::new(0),
            last_sample_unix_ms: AtomicI64::new(0),
            events,
            reconnect,
            detached: AtomicBool::new(true),
        });

        shared.signal_reconnect("ignored during teardown");
        assert!(reconnect_rx.try_recv().is_err());

        shared.detached.store(false, Ordering::Release);
        shared.signal_reconnect("session closed");
        assert_eq!(reconnect_rx.try_recv().unwrap(), "session closed");
    }

    #[test]
    fn backoff_grows_from_the_floor_to_the_ceiling() {
        let backoff = reconnect_backoff();
        let first = backoff.next(1).unwrap();
        let second = backoff.next(2).unwrap();
        let tenth = backoff.next(10).unwrap();
        assert!(first >= RECONNECT_MIN);
        assert!(second >= first);
        assert!(tenth <= RECONNECT_MAX);
    }
}
