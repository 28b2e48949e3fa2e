//! Broker connection lifecycle and publish relay.
//!
//! The bridge holds at most one MQTT session. Its lifecycle is an explicit state
//! machine owned by [`ConnectionManager`]:
//!
//! ```text
//!                connect()                ConnAck(0)
//! disconnected ───────────► connecting ─────────────► connected
//!      ▲  ▲                     │ ConnAck(n≠0) / link failure   │
//!      │  │                     ▼                               │
//!      │  └──────────────── error ◄──── missing certificates    │
//!      │     disconnect()                                       │
//!      └────────────── disconnect() / link lost ────────────────┘
//! ```
//!
//! The network loop runs on its own thread and reports back through
//! [`SessionEvents`]; direct calls and loop events share one transition function
//! and one lock, so a status read never observes a half-applied transition.
//!
//! ## Submodules
//!
//! - `manager`: status record, active client id, session ownership, transitions
//! - `relay`: QoS 1 publish of JSON payloads on the resolved topic
//! - `session`: rumqttc-backed session and its network loop thread

mod manager;
mod relay;
mod session;

pub use manager::{ConnectionManager, SessionEvents, StatusSnapshot};
pub use relay::ANNOUNCE_PAYLOAD;
pub use session::{return_code, RumqttcConnector, RumqttcSession};

use anyhow::Result;
use rumqttc::QoS;
use serde::Serialize;
use std::time::Duration;

use crate::certs::CertificateBundle;
use crate::config::BrokerConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state plus its error message.
///
/// Only `error` carries a message; every other state has none. Fields are private so
/// that invariant cannot be broken from outside the manager.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    state: ConnectionState,
    error: Option<String>,
}

impl ConnectionStatus {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self { state, error: None }
    }

    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Error,
            error: Some(message.into()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Lifecycle notifications produced by a session's network loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Broker answered the CONNECT; `code` 0 means accepted.
    ConnAck { code: u8 },
    /// Broker acknowledged a QoS 1 publish.
    Published { pkid: u16 },
    /// Network or protocol failure; the loop has stopped.
    LinkFailed(String),
    /// Broker closed the session.
    Closed,
}

/// One outbound publish as handed to the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// What a connector needs to open a session.
#[derive(Clone, Copy, Debug)]
pub struct SessionRequest<'a> {
    pub broker: &'a BrokerConfig,
    pub certificates: &'a CertificateBundle,
}

/// A live broker session. Owned exclusively by the [`ConnectionManager`].
pub trait BrokerSession: Send {
    /// Queue a publish without waiting for the broker or for queue space.
    fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Stop the network loop and close the connection, waiting at most `timeout`.
    fn close(self: Box<Self>, timeout: Duration) -> Result<()>;
}

/// Builds sessions. The connect handshake itself completes asynchronously and is
/// reported through `events`.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        request: &SessionRequest<'_>,
        events: SessionEvents,
    ) -> Result<Box<dyn BrokerSession>>;
}
