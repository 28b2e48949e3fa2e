use anyhow::{anyhow, Context, Result};
use rumqttc::{
    Client, Connection, ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing, Packet,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{BrokerSession, Connector, OutboundMessage, SessionEvent, SessionEvents, SessionRequest};
use crate::transport::TlsMaterials;

const REQUEST_QUEUE_CAPACITY: usize = 64;

/// Numeric MQTT 3.1.1 CONNACK return code.
pub fn return_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

/// Opens MQTT v3.1.1 sessions over mutual TLS with rumqttc.
#[derive(Clone, Copy, Debug, Default)]
pub struct RumqttcConnector;

impl Connector for RumqttcConnector {
    fn open(
        &self,
        request: &SessionRequest<'_>,
        events: SessionEvents,
    ) -> Result<Box<dyn BrokerSession>> {
        let broker = request.broker;
        let tls = TlsMaterials::load(request.certificates)?;

        let mut options = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
        options.set_keep_alive(broker.keep_alive);
        options.set_clean_session(true);
        options.set_transport(tls.build_transport());

        log::debug!(
            "opening MQTT session {} as {}",
            events.generation(),
            broker.client_id
        );
        let (client, connection) = Client::new(options, REQUEST_QUEUE_CAPACITY);
        let session = RumqttcSession::start(client, connection, events)?;
        Ok(Box::new(session))
    }
}

/// A rumqttc client plus the thread driving its network loop.
pub struct RumqttcSession {
    client: Client,
    closing: Arc<AtomicBool>,
    loop_handle: JoinHandle<()>,
    done: mpsc::Receiver<()>,
}

/// Signals loop exit on drop, including when the loop thread panics.
struct DoneSignal(mpsc::Sender<()>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

impl RumqttcSession {
    fn start(client: Client, connection: Connection, events: SessionEvents) -> Result<Self> {
        let closing = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = mpsc::channel();
        let loop_closing = closing.clone();
        let loop_handle = std::thread::Builder::new()
            .name(format!("mqtt-session-{}", events.generation()))
            .spawn(move || {
                let _done = DoneSignal(done_tx);
                run_network_loop(connection, &events, &loop_closing);
            })
            .context("failed to spawn MQTT network loop thread")?;

        Ok(Self {
            client,
            closing,
            loop_handle,
            done,
        })
    }
}

fn run_network_loop(mut connection: Connection, events: &SessionEvents, closing: &AtomicBool) {
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                events.deliver(SessionEvent::ConnAck {
                    code: return_code(ack.code),
                });
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                events.deliver(SessionEvent::Published { pkid: ack.pkid });
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                events.deliver(SessionEvent::Closed);
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                log::debug!("MQTT session {} sent DISCONNECT", events.generation());
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                events.deliver(SessionEvent::ConnAck {
                    code: return_code(code),
                });
                break;
            }
            Err(e) => {
                if closing.load(Ordering::SeqCst) {
                    log::debug!("MQTT session {} stopped: {}", events.generation(), e);
                } else {
                    log::warn!("MQTT connection error: {}", e);
                    events.deliver(SessionEvent::LinkFailed(e.to_string()));
                }
                break;
            }
        }
    }
    log::debug!("MQTT network loop {} exited", events.generation());
}

impl BrokerSession for RumqttcSession {
    fn publish(&self, message: OutboundMessage) -> Result<()> {
        self.client
            .try_publish(message.topic, message.qos, message.retain, message.payload)
            .map_err(|e| anyhow!("{}", e))
    }

    fn close(self: Box<Self>, timeout: Duration) -> Result<()> {
        let Self {
            client,
            closing,
            loop_handle,
            done,
        } = *self;

        closing.store(true, Ordering::SeqCst);
        if let Err(e) = client.try_disconnect() {
            log::debug!("MQTT disconnect request not queued: {}", e);
        }
        // Dropping the last client handle ends the request stream, which stops the
        // loop even if the DISCONNECT never went out.
        drop(client);

        match done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => loop_handle
                .join()
                .map_err(|_| anyhow!("MQTT network loop panicked")),
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "MQTT network loop did not stop within {:?}; detaching it",
                    timeout
                );
                Err(anyhow!("network loop still running after {:?}", timeout))
            }
        }
    }
}
