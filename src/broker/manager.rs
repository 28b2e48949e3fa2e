use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use super::relay::{relay, ANNOUNCE_PAYLOAD};
use super::{
    BrokerSession, ConnectionState, ConnectionStatus, Connector, RumqttcConnector, SessionEvent,
    SessionRequest,
};
use crate::certs::{self, CertificateBundle};
use crate::config::{BridgeConfig, BrokerConfig};
use crate::error::BridgeError;
use crate::topic;

/// Owner of the broker session, the connection status record and the active
/// client id.
///
/// Cloning yields another handle to the same manager. All state sits behind a
/// single mutex shared by control-surface calls and network-loop events.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    broker: BrokerConfig,
    certificates: CertificateBundle,
    connector: Box<dyn Connector>,
    disconnect_timeout: Duration,
    state: Mutex<ManagerState>,
}

#[derive(Default)]
struct ManagerState {
    status: ConnectionStatus,
    active_client_id: Option<String>,
    session: Option<LiveSession>,
    generation: u64,
}

struct LiveSession {
    generation: u64,
    handle: Box<dyn BrokerSession>,
}

/// Point-in-time view of the manager, read under the lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: ConnectionStatus,
    pub connected: bool,
    pub active_client_id: Option<String>,
    /// Resolved topic, only when a client id is active.
    pub publish_topic: Option<String>,
}

/// Every status change goes through [`transition`].
enum Transition {
    Begin,
    Acknowledged,
    Fail(BridgeError),
    Lost,
}

fn transition(status: &mut ConnectionStatus, change: Transition) {
    let previous = status.state();
    match change {
        Transition::Begin => *status = ConnectionStatus::new(ConnectionState::Connecting),
        Transition::Acknowledged => *status = ConnectionStatus::new(ConnectionState::Connected),
        Transition::Lost => *status = ConnectionStatus::new(ConnectionState::Disconnected),
        Transition::Fail(err) => {
            log::warn!("broker connection {} -> error ({}): {}", previous, err.kind(), err);
            *status = ConnectionStatus::failed(err.to_string());
            return;
        }
    }
    log::info!("broker connection {} -> {}", previous, status.state());
}

impl ConnectionManager {
    pub fn new(
        broker: BrokerConfig,
        certificates: CertificateBundle,
        connector: Box<dyn Connector>,
        disconnect_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                broker,
                certificates,
                connector,
                disconnect_timeout,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// Manager backed by the rumqttc connector.
    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self::new(
            cfg.broker.clone(),
            cfg.certificates.clone(),
            Box::new(RumqttcConnector),
            cfg.disconnect_timeout,
        )
    }

    pub fn broker(&self) -> &BrokerConfig {
        &self.shared.broker
    }

    pub fn certificates(&self) -> &CertificateBundle {
        &self.shared.certificates
    }

    /// Start (or restart) the broker connection.
    ///
    /// On success the state is `connecting`; the outcome of the handshake arrives
    /// later as a [`SessionEvent`]. Any existing session is discarded first.
    ///
    /// The lock is only held to claim a generation and to install the new session;
    /// certificate checks, TLS loading and the loop thread spawn happen outside it.
    pub fn connect(&self) -> Result<ConnectionStatus, BridgeError> {
        let shared = &self.shared;
        let missing = certs::check(&shared.certificates);

        let mut state = shared.lock();
        let previous = state.session.take();
        state.generation += 1;
        let generation = state.generation;

        if !missing.is_empty() {
            let err = BridgeError::Configuration(missing);
            transition(&mut state.status, Transition::Fail(err.clone()));
            drop(state);
            if let Some(old) = previous {
                shared.close_session(old);
            }
            return Err(err);
        }
        // Connecting must be visible before the loop thread can report back.
        transition(&mut state.status, Transition::Begin);
        drop(state);

        if let Some(old) = previous {
            shared.close_session(old);
        }

        log::info!(
            "Connecting to MQTT broker at {}:{}",
            shared.broker.host,
            shared.broker.port
        );
        let request = SessionRequest {
            broker: &shared.broker,
            certificates: &shared.certificates,
        };
        let events = SessionEvents {
            target: Arc::downgrade(&self.shared),
            generation,
        };
        let opened = shared.connector.open(&request, events).map_err(|e| {
            BridgeError::Unexpected(format!("Failed to initialize MQTT client: {:#}", e))
        });

        let mut state = shared.lock();
        if state.generation != generation {
            // A later connect or disconnect took over while this session was opening.
            let status = state.status.clone();
            drop(state);
            log::info!("MQTT session {} superseded before it was installed", generation);
            return match opened {
                Ok(handle) => {
                    shared.close_session(LiveSession { generation, handle });
                    Ok(status)
                }
                Err(err) => Err(err),
            };
        }

        match opened {
            Ok(handle) => {
                state.session = Some(LiveSession { generation, handle });
                log::info!("MQTT client initialized (session {})", generation);
                if state.status.is_connected() {
                    // The broker answered before the session was installed.
                    shared.announce(&state);
                }
                Ok(state.status.clone())
            }
            Err(err) => {
                transition(&mut state.status, Transition::Fail(err.clone()));
                Err(err)
            }
        }
    }

    /// Tear down the session, if any. Always ends `disconnected` with no error.
    pub fn disconnect(&self) -> ConnectionStatus {
        let shared = &self.shared;
        let mut state = shared.lock();
        let previous = state.session.take();
        state.generation += 1;
        transition(&mut state.status, Transition::Lost);
        let status = state.status.clone();
        drop(state);

        match previous {
            Some(old) => {
                shared.close_session(old);
                log::info!("MQTT client cleaned up");
            }
            None => log::debug!("disconnect requested without a live session"),
        }
        status
    }

    /// Relay `payload` to the topic of the active client.
    pub fn publish(&self, payload: &Value) -> Result<(), BridgeError> {
        let state = self.shared.lock();
        let topic = topic::resolve(
            &self.shared.broker.base_topic,
            state.active_client_id.as_deref(),
        );
        relay(
            state.status.state(),
            state.session.as_ref().map(|s| s.handle.as_ref()),
            &topic,
            payload,
        )
    }

    /// Select the tenant namespace for subsequent publishes. Last write wins.
    pub fn set_active_client_id(&self, client_id: impl Into<String>) -> String {
        let client_id = client_id.into();
        let mut state = self.shared.lock();
        state.active_client_id = Some(client_id.clone());
        log::info!("Active client ID set to: {}", client_id);
        log::info!(
            "Publishing topic is now: {}",
            topic::resolve(&self.shared.broker.base_topic, Some(&client_id))
        );
        client_id
    }

    pub fn active_client_id(&self) -> Option<String> {
        self.shared.lock().active_client_id.clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.lock().status.clone()
    }

    pub fn status(&self) -> StatusSnapshot {
        let state = self.shared.lock();
        let publish_topic = state
            .active_client_id
            .as_deref()
            .map(|id| topic::resolve(&self.shared.broker.base_topic, Some(id)));
        StatusSnapshot {
            status: state.status.clone(),
            connected: state.status.is_connected() && state.session.is_some(),
            active_client_id: state.active_client_id.clone(),
            publish_topic,
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn close_session(&self, session: LiveSession) {
        if let Err(err) = session.handle.close(self.disconnect_timeout) {
            log::warn!("error closing MQTT session {}: {:#}", session.generation, err);
        }
    }

    fn handle_event(&self, generation: u64, event: SessionEvent) {
        let mut state = self.lock();
        if state.generation != generation {
            log::debug!(
                "ignoring {:?} from retired session {} (current: {})",
                event,
                generation,
                state.generation
            );
            return;
        }

        match event {
            SessionEvent::ConnAck { code: 0 } => {
                log::info!("Connected to MQTT broker with result code 0");
                transition(&mut state.status, Transition::Acknowledged);
                // Without an installed session, connect() announces once it installs one.
                if state.session.is_some() {
                    self.announce(&state);
                }
            }
            SessionEvent::ConnAck { code } => {
                let err = BridgeError::ConnectFailure(format!(
                    "Failed to connect to MQTT broker with result code {}",
                    code
                ));
                transition(&mut state.status, Transition::Fail(err));
            }
            SessionEvent::LinkFailed(reason) => {
                if state.status.state() == ConnectionState::Connecting {
                    let err = BridgeError::ConnectFailure(format!(
                        "Failed to connect to MQTT broker: {}",
                        reason
                    ));
                    transition(&mut state.status, Transition::Fail(err));
                } else {
                    log::warn!("Disconnected from MQTT broker: {}", reason);
                    transition(&mut state.status, Transition::Lost);
                }
            }
            SessionEvent::Closed => {
                log::info!("Disconnected from MQTT broker");
                transition(&mut state.status, Transition::Lost);
            }
            SessionEvent::Published { pkid } => {
                log::info!("Message published: {}", pkid);
            }
        }
    }

    /// Best-effort "Connected" publish; failure never changes the state.
    fn announce(&self, state: &ManagerState) {
        let topic = topic::resolve(&self.broker.base_topic, state.active_client_id.as_deref());
        let result = relay(
            state.status.state(),
            state.session.as_ref().map(|s| s.handle.as_ref()),
            &topic,
            &Value::String(ANNOUNCE_PAYLOAD.to_string()),
        );
        if let Err(err) = result {
            log::warn!("connection announcement not sent: {}", err);
        }
    }
}

/// Delivery handle a session uses to report lifecycle events.
///
/// Tagged with the generation of the session it belongs to; once that session is
/// replaced or discarded, its events are ignored.
#[derive(Clone)]
pub struct SessionEvents {
    target: Weak<Shared>,
    generation: u64,
}

impl SessionEvents {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn deliver(&self, event: SessionEvent) {
        match self.target.upgrade() {
            Some(shared) => shared.handle_event(self.generation, event),
            None => log::debug!("dropping {:?}: connection manager is gone", event),
        }
    }
}

impl std::fmt::Debug for SessionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEvents")
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::OutboundMessage;
    use crate::certs::{CA_CERT_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE};
    use anyhow::anyhow;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Log {
        opened: Vec<SessionEvents>,
        sent: Vec<OutboundMessage>,
        closed: Vec<u64>,
        seen_during_open: Vec<ConnectionState>,
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        log: Arc<Mutex<Log>>,
        fail_open: bool,
        ack_during_open: bool,
        observer: Arc<Mutex<Option<ConnectionManager>>>,
    }

    struct FakeSession {
        log: Arc<Mutex<Log>>,
        generation: u64,
    }

    impl Connector for FakeConnector {
        fn open(
            &self,
            _request: &SessionRequest<'_>,
            events: SessionEvents,
        ) -> anyhow::Result<Box<dyn BrokerSession>> {
            if self.fail_open {
                return Err(anyhow!("bad key"));
            }
            let observed = self.observer.lock().unwrap().clone();
            if let Some(mgr) = observed {
                let state = mgr.connection_status().state();
                self.log.lock().unwrap().seen_during_open.push(state);
            }
            if self.ack_during_open {
                events.deliver(SessionEvent::ConnAck { code: 0 });
            }
            let generation = events.generation();
            self.log.lock().unwrap().opened.push(events);
            Ok(Box::new(FakeSession {
                log: self.log.clone(),
                generation,
            }))
        }
    }

    impl BrokerSession for FakeSession {
        fn publish(&self, message: OutboundMessage) -> anyhow::Result<()> {
            self.log.lock().unwrap().sent.push(message);
            Ok(())
        }

        fn close(self: Box<Self>, _timeout: Duration) -> anyhow::Result<()> {
            self.log.lock().unwrap().closed.push(self.generation);
            Ok(())
        }
    }

    fn cert_dir() -> TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in [CA_CERT_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE] {
            std::fs::write(dir.path().join(name), b"pem").expect("write");
        }
        dir
    }

    fn manager(dir: &TempDir, connector: FakeConnector) -> ConnectionManager {
        let broker = BrokerConfig {
            host: "broker.test".to_string(),
            port: 8883,
            client_id: "bridge-test".to_string(),
            base_topic: "/client_id/api".to_string(),
            keep_alive: Duration::from_secs(60),
        };
        ConnectionManager::new(
            broker,
            CertificateBundle::from_dir(dir.path()),
            Box::new(connector),
            Duration::from_secs(1),
        )
    }

    fn last_events(connector: &FakeConnector) -> SessionEvents {
        connector
            .log
            .lock()
            .unwrap()
            .opened
            .last()
            .cloned()
            .expect("session opened")
    }

    #[test]
    fn starts_disconnected() {
        let dir = cert_dir();
        let mgr = manager(&dir, FakeConnector::default());
        let snapshot = mgr.status();
        assert_eq!(snapshot.status.state(), ConnectionState::Disconnected);
        assert_eq!(snapshot.status.error(), None);
        assert!(!snapshot.connected);
        assert_eq!(snapshot.publish_topic, None);
    }

    #[test]
    fn connack_success_connects_and_announces() {
        let dir = cert_dir();
        let connector = FakeConnector::default();
        let mgr = manager(&dir, connector.clone());

        let status = mgr.connect().expect("connect");
        assert_eq!(status.state(), ConnectionState::Connecting);

        last_events(&connector).deliver(SessionEvent::ConnAck { code: 0 });
        assert!(mgr.status().connected);

        let log = connector.log.lock().unwrap();
        assert_eq!(log.sent.len(), 1);
        assert_eq!(log.sent[0].topic, "/client_id/api");
        assert_eq!(log.sent[0].payload, br#""Connected""#.to_vec());
    }

    #[test]
    fn connack_refusal_sets_error_with_code() {
        let dir = cert_dir();
        let connector = FakeConnector::default();
        let mgr = manager(&dir, connector.clone());
        mgr.connect().expect("connect");

        last_events(&connector).deliver(SessionEvent::ConnAck { code: 5 });
        let snapshot = mgr.status();
        assert_eq!(snapshot.status.state(), ConnectionState::Error);
        assert!(snapshot.status.error().unwrap().contains('5'));
        assert!(!snapshot.connected);
    }

    #[test]
    fn link_failure_while_connecting_is_an_error_but_later_is_a_disconnect() {
        let dir = cert_dir();
        let connector = FakeConnector::default();
        let mgr = manager(&dir, connector.clone());

        mgr.connect().expect("connect");
        last_events(&connector).deliver(SessionEvent::LinkFailed("tls handshake".into()));
        let status = mgr.connection_status();
        assert_eq!(status.state(), ConnectionState::Error);
        assert!(status.error().unwrap().contains("tls handshake"));

        mgr.connect().expect("reconnect");
        let events = last_events(&connector);
        events.deliver(SessionEvent::ConnAck { code: 0 });
        events.deliver(SessionEvent::LinkFailed("connection reset".into()));
        let status = mgr.connection_status();
        assert_eq!(status.state(), ConnectionState::Disconnected);
        assert_eq!(status.error(), None);
    }

    #[test]
    fn missing_certificate_skips_network() {
        let dir = cert_dir();
        std::fs::remove_file(dir.path().join(CA_CERT_FILE)).expect("remove");
        let connector = FakeConnector::default();
        let mgr = manager(&dir, connector.clone());

        let err = mgr.connect().unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
        assert!(err.to_string().contains("ca_cert"));
        assert_eq!(mgr.connection_status().state(), ConnectionState::Error);
        assert!(connector.log.lock().unwrap().opened.is_empty());
    }

    #[test]
    fn initialization_failure_is_caught() {
        let dir = cert_dir();
        let connector = FakeConnector {
            fail_open: true,
            ..FakeConnector::default()
        };
        let mgr = manager(&dir, connector);

        let err = mgr.connect().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to initialize MQTT client: bad key"
        );
        let status = mgr.connection_status();
        assert_eq!(status.state(), ConnectionState::Error);
        assert_eq!(status.error(), Some("Failed to initialize MQTT client: bad key"));
    }

    #[test]
    fn status_is_readable_while_session_opens() {
        let dir = cert_dir();
        let connector = FakeConnector::default();
        let mgr = manager(&dir, connector.clone());
        *connector.observer.lock().unwrap() = Some(mgr.clone());

        mgr.connect().expect("connect");

        let seen = connector.log.lock().unwrap().seen_during_open.clone();
        assert_eq!(seen, vec![ConnectionState::Connecting]);
        *connector.observer.lock().unwrap() = None;
    }

    #[test]
    fn connack_before_install_still_announces() {
        let dir = cert_dir();
        let connector = FakeConnector {
            ack_during_open: true,
            ..FakeConnector::default()
        };
        let mgr = manager(&dir, connector.clone());

        let status = mgr.connect().expect("connect");
        assert_eq!(status.state(), ConnectionState::Connected);
        assert!(mgr.status().connected);

        let log = connector.log.lock().unwrap();
        assert_eq!(log.sent.len(), 1);
        assert_eq!(log.sent[0].payload, br#""Connected""#.to_vec());
    }

    #[test]
    fn reconnect_retires_previous_session() {
        let dir = cert_dir();
        let connector = FakeConnector::default();
        let mgr = manager(&dir, connector.clone());

        mgr.connect().expect("first");
        let stale = last_events(&connector);
        mgr.connect().expect("second");
        assert_eq!(connector.log.lock().unwrap().closed, vec![stale.generation()]);

        stale.deliver(SessionEvent::ConnAck { code: 0 });
        assert_eq!(
            mgr.connection_status().state(),
            ConnectionState::Connecting
        );
    }

    #[test]
    fn disconnect_is_idempotent_from_every_state() {
        let dir = cert_dir();
        let connector = FakeConnector::default();
        let mgr = manager(&dir, connector.clone());

        // disconnected
        assert_eq!(mgr.disconnect().state(), ConnectionState::Disconnected);
        // connecting
        mgr.connect().expect("connect");
        assert_eq!(mgr.disconnect().state(), ConnectionState::Disconnected);
        // connected
        mgr.connect().expect("connect");
        last_events(&connector).deliver(SessionEvent::ConnAck { code: 0 });
        assert_eq!(mgr.disconnect().state(), ConnectionState::Disconnected);
        // error
        mgr.connect().expect("connect");
        last_events(&connector).deliver(SessionEvent::ConnAck { code: 4 });
        let status = mgr.disconnect();
        assert_eq!(status.state(), ConnectionState::Disconnected);
        assert_eq!(status.error(), None);
        // again
        assert_eq!(mgr.disconnect(), ConnectionStatus::default());
        assert_eq!(connector.log.lock().unwrap().closed.len(), 3);
    }

    #[test]
    fn publish_uses_active_client_topic() {
        let dir = cert_dir();
        let connector = FakeConnector::default();
        let mgr = manager(&dir, connector.clone());
        mgr.connect().expect("connect");
        last_events(&connector).deliver(SessionEvent::ConnAck { code: 0 });

        mgr.set_active_client_id("tenant42");
        mgr.publish(&json!({"a": 1})).expect("publish");

        let log = connector.log.lock().unwrap();
        let last = log.sent.last().expect("sent");
        assert_eq!(last.topic, "/tenant42/api");
        assert_eq!(last.payload, br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn publish_when_not_connected_leaves_status_alone() {
        let dir = cert_dir();
        let connector = FakeConnector::default();
        let mgr = manager(&dir, connector.clone());
        mgr.connect().expect("connect");

        let before = mgr.connection_status();
        assert_eq!(mgr.publish(&json!({"x": "y"})), Err(BridgeError::NotConnected));
        assert_eq!(mgr.connection_status(), before);
        assert!(connector.log.lock().unwrap().sent.is_empty());
    }

    #[test]
    fn active_client_survives_disconnect() {
        let dir = cert_dir();
        let mgr = manager(&dir, FakeConnector::default());
        mgr.set_active_client_id("first");
        mgr.set_active_client_id("second");
        mgr.disconnect();
        let snapshot = mgr.status();
        assert_eq!(snapshot.active_client_id.as_deref(), Some("second"));
        assert_eq!(snapshot.publish_topic.as_deref(), Some("/second/api"));
    }
}
