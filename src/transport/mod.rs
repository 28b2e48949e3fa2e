//! Transport layer for the broker connection.
//!
//! Loads the mutual-TLS materials and turns them into the MQTT client library's
//! transport configuration.

mod tls;

pub use tls::TlsMaterials;
