//! MQTT Bridge
//!
//! Relays JSON payloads from a local HTTP control surface to a single MQTT broker over
//! mutually authenticated TLS.
//!
//! # Architecture
//!
//! The bridge owns at most one broker session at a time:
//!
//! 1. **Explicit lifecycle**: `disconnected`, `connecting`, `connected`, `error`; every
//!    change goes through one transition function under one lock.
//! 2. **Certificates first**: a connect attempt never touches the network while any of
//!    the three PEM files is missing or unreadable.
//! 3. **Tenant topics**: publishes go to the base topic with its `client_id` placeholder
//!    replaced by the active client id, when one has been set.
//! 4. **No hidden retries**: a failed connect or publish is reported, never retried.
//!
//! # Module Structure
//!
//! - `api`: HTTP control surface (status, connect, disconnect, set-client, publish)
//! - `broker`: connection manager, publish relay, rumqttc session
//! - `certs`: certificate bundle layout and presence check
//! - `config`: file + environment configuration
//! - `error`: `BridgeError` taxonomy
//! - `topic`: publish topic resolution
//! - `transport`: TLS material loading for the broker connection

pub mod api;
pub mod broker;
pub mod certs;
pub mod config;
pub mod error;
pub mod topic;
pub mod transport;

pub use broker::{
    BrokerSession, ConnectionManager, ConnectionState, ConnectionStatus, Connector,
    OutboundMessage, SessionEvent, SessionEvents, SessionRequest, StatusSnapshot,
};
pub use certs::{CertificateBundle, CertificateKind, MissingCertificate, MissingReason};
pub use config::{BridgeConfig, BrokerConfig};
pub use error::BridgeError;
