use rumqttc::QoS;
use serde_json::Value;

use super::{BrokerSession, ConnectionState, OutboundMessage};
use crate::error::BridgeError;

/// Informational message published once a connection is acknowledged.
pub const ANNOUNCE_PAYLOAD: &str = "Connected";

/// Publish `payload` as JSON text on `topic` at QoS 1.
///
/// Requires a live session in the `connected` state; there is no queueing or retry
/// when that does not hold. Success means the client library accepted the request;
/// the broker's PUBACK is only observed later on the network loop.
pub(crate) fn relay(
    state: ConnectionState,
    session: Option<&dyn BrokerSession>,
    topic: &str,
    payload: &Value,
) -> Result<(), BridgeError> {
    let session = match session {
        Some(session) if state == ConnectionState::Connected => session,
        _ => {
            log::warn!("{}", BridgeError::NotConnected);
            return Err(BridgeError::NotConnected);
        }
    };

    let body = serde_json::to_vec(payload)
        .map_err(|e| BridgeError::Unexpected(format!("Error publishing message: {}", e)))?;
    log::info!("Publishing message to topic: {}", topic);
    log::debug!("Payload: {}", String::from_utf8_lossy(&body));

    let message = OutboundMessage {
        topic: topic.to_string(),
        payload: body,
        qos: QoS::AtLeastOnce,
        retain: false,
    };
    match session.publish(message) {
        Ok(()) => {
            log::info!("Message published successfully");
            Ok(())
        }
        Err(err) => {
            let message = format!("Failed to publish message: {:#}", err);
            log::warn!("{}", message);
            Err(BridgeError::PublishFailure(message))
        }
    }
}
