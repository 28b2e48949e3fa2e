//! Failure taxonomy surfaced at the bridge's component boundary.
//!
//! Every operation the control surface calls resolves to `Result<_, BridgeError>`.
//! The control surface only ever needs the rendered message, never the cause chain.

use crate::certs::MissingCertificate;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeError {
    /// One or more certificate files are absent or unreadable.
    Configuration(Vec<MissingCertificate>),
    /// The broker refused the handshake or the link failed before the connect ack.
    ConnectFailure(String),
    /// A publish was attempted without a live, connected session.
    NotConnected,
    /// The client library rejected the publish request.
    PublishFailure(String),
    /// Any other fault during setup, publish or teardown.
    Unexpected(String),
}

impl BridgeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::ConnectFailure(_) => "connect_failure",
            Self::NotConnected => "not_connected",
            Self::PublishFailure(_) => "publish_failure",
            Self::Unexpected(_) => "unexpected",
        }
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(missing) => {
                let items: Vec<String> = missing.iter().map(|m| m.to_string()).collect();
                write!(
                    f,
                    "Missing or unreadable certificates: {}",
                    items.join(", ")
                )
            }
            Self::NotConnected => write!(f, "MQTT client not connected"),
            Self::ConnectFailure(message)
            | Self::PublishFailure(message)
            | Self::Unexpected(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for BridgeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::{CertificateKind, MissingReason};
    use std::path::PathBuf;

    #[test]
    fn configuration_error_lists_every_missing_item() {
        let err = BridgeError::Configuration(vec![
            MissingCertificate {
                kind: CertificateKind::ClientKey,
                path: PathBuf::from("/certs/client-key.pem"),
                reason: MissingReason::Absent,
            },
            MissingCertificate {
                kind: CertificateKind::CaCert,
                path: PathBuf::from("/certs/ca-cert.pem"),
                reason: MissingReason::Unreadable,
            },
        ]);
        assert_eq!(
            err.to_string(),
            "Missing or unreadable certificates: client_key at /certs/client-key.pem, \
             ca_cert at /certs/ca-cert.pem (not readable)"
        );
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn not_connected_has_fixed_message() {
        assert_eq!(
            BridgeError::NotConnected.to_string(),
            "MQTT client not connected"
        );
    }
}
