//! A minimal MQTT v5 client over WebTransport, the native twin of what a
//! browser does with the JavaScript `WebTransport` API against the bridge.
//!
//! One session, exactly one bidirectional stream, CONNECT sent as soon as
//! the stream opens. Publishing and subscribing are accepted immediately
//! after that, matching real MQTT pipelining; the logical "connected" signal
//! is the [`MqttEvent::Connack`] with reason 0.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::broadcast;
use url::Url;

use crate::{packet, Client, ClientError, RecvStream, SendStream, Session, WriteError};

const READ_CHUNK: usize = 64 * 1024;
const DEFAULT_KEEP_ALIVE: u16 = 60;

#[derive(Error, Debug)]
pub enum MqttClientError {
    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("topic is required")]
    EmptyTopic,

    #[error("transport error: {0}")]
    Transport(#[from] ClientError),

    #[error("session error: {0}")]
    Session(#[from] crate::SessionError),

    #[error("write error: {0}")]
    Write(#[from] WriteError),
}

/// Connection lifecycle of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Everything a client can observe, as a closed set of variants rather than
/// an open string-keyed callback map. Listener failures are the listener's
/// problem; a lagging receiver never breaks the read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    Connack {
        reason: u8,
        session_present: bool,
    },
    Suback {
        packet_id: u16,
        codes: Vec<u8>,
    },
    Message {
        topic: String,
        payload: String,
        qos: u8,
        packet_id: Option<u16>,
    },
    Closed,
    Error(String),
}

/// Per-client packet identifier counter: 16 bits, monotonically increasing,
/// wrapping at 0xFFFF. Shared by SUBSCRIBE and QoS>0 PUBLISH.
#[derive(Debug)]
struct PacketIds {
    next: u16,
}

impl PacketIds {
    fn new() -> Self {
        Self { next: 1 }
    }

    fn next(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// An MQTT v5 client speaking through the bridge.
pub struct MqttClient {
    client: Client,
    url: Url,
    client_id: String,
    keep_alive: u16,

    state: Arc<Mutex<ClientState>>,
    session: Option<Session>,
    writer: Option<SendStream>,
    packet_ids: PacketIds,
    events: broadcast::Sender<MqttEvent>,
}

impl MqttClient {
    /// Create a client that will dial `url` (e.g. `https://host:1027/mqtt`).
    ///
    /// The client id defaults to a generated one; see [`Self::with_client_id`].
    pub fn new(client: Client, url: Url) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            client,
            url,
            client_id: generate_client_id(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            state: Arc::new(Mutex::new(ClientState::Idle)),
            session: None,
            writer: None,
            packet_ids: PacketIds::new(),
            events,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Keep-alive interval in seconds, advertised in CONNECT.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap()
    }

    /// Subscribe to the client's event feed. Can be called before or after
    /// [`Self::connect`]; each receiver sees every event from then on.
    pub fn events(&self) -> broadcast::Receiver<MqttEvent> {
        self.events.subscribe()
    }

    /// Open the session and its single bidirectional stream and send CONNECT.
    ///
    /// Only valid from the Idle state.
    pub async fn connect(&mut self) -> Result<(), MqttClientError> {
        if self.state() != ClientState::Idle {
            return Err(MqttClientError::AlreadyConnected);
        }
        *self.state.lock().unwrap() = ClientState::Connecting;

        // Every failure on the way up resets to Idle so the caller can retry;
        // leaving the state at Connecting would wedge the client for good.
        match self.try_connect().await {
            Ok(()) => {
                *self.state.lock().unwrap() = ClientState::Connected;
                Ok(())
            }
            Err(err) => {
                *self.state.lock().unwrap() = ClientState::Idle;
                Err(err)
            }
        }
    }

    async fn try_connect(&mut self) -> Result<(), MqttClientError> {
        tracing::debug!(url = %self.url, "connecting WebTransport");
        let session = self.client.connect(self.url.clone()).await?;
        let (mut send, recv) = session.open_bi().await?;

        tracing::debug!(client_id = %self.client_id, ">> CONNECT(v5)");
        send.write_all(&packet::encode_connect(&self.client_id, self.keep_alive))
            .await?;

        tokio::spawn(read_loop(recv, self.events.clone(), self.state.clone()));

        self.session = Some(session);
        self.writer = Some(send);
        Ok(())
    }

    /// Close the session. The read loop notices and emits [`MqttEvent::Closed`].
    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.close(0, b"client disconnect");
        }
        self.writer = None;
        *self.state.lock().unwrap() = ClientState::Closed;
    }

    /// Subscribe to a topic filter at QoS 0, returning the packet id to match
    /// against the eventual [`MqttEvent::Suback`].
    pub async fn subscribe(&mut self, topic: &str) -> Result<u16, MqttClientError> {
        if topic.is_empty() {
            return Err(MqttClientError::EmptyTopic);
        }
        let packet_id = self.packet_ids.next();
        let pkt = packet::encode_subscribe(topic, packet_id);

        tracing::debug!(%topic, packet_id, ">> SUBSCRIBE(v5)");
        self.writer
            .as_mut()
            .ok_or(MqttClientError::NotConnected)?
            .write_all(&pkt)
            .await?;
        Ok(packet_id)
    }

    /// Publish a text payload. A packet id is allocated (and returned) only
    /// when `qos > 0`.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: u8,
    ) -> Result<Option<u16>, MqttClientError> {
        if topic.is_empty() {
            return Err(MqttClientError::EmptyTopic);
        }
        let packet_id = (qos > 0).then(|| self.packet_ids.next());
        let pkt = packet::encode_publish(topic, payload, qos, packet_id.unwrap_or(0));

        tracing::debug!(%topic, qos, ">> PUBLISH(v5)");
        self.writer
            .as_mut()
            .ok_or(MqttClientError::NotConnected)?
            .write_all(&pkt)
            .await?;
        Ok(packet_id)
    }
}

/// Feed each transport read to the decoder exactly once and broadcast the
/// result. Decode failures (e.g. a packet split across reads) are logged and
/// skipped; only the stream ending stops the loop.
async fn read_loop(
    mut recv: RecvStream,
    events: broadcast::Sender<MqttEvent>,
    state: Arc<Mutex<ClientState>>,
) {
    loop {
        match recv.read_chunk(READ_CHUNK).await {
            Ok(Some(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                match packet::decode(&chunk) {
                    Ok(Some(packet)) => {
                        tracing::debug!("<< {packet:?}");
                        events.send(event_for(packet)).ok();
                    }
                    Ok(None) => {}
                    Err(err) => tracing::debug!("dropping undecodable read: {err}"),
                }
            }
            Ok(None) => {
                tracing::debug!("read loop finished");
                break;
            }
            Err(err) => {
                tracing::debug!("read loop error: {err}");
                events.send(MqttEvent::Error(err.to_string())).ok();
                break;
            }
        }
    }

    *state.lock().unwrap() = ClientState::Closed;
    events.send(MqttEvent::Closed).ok();
}

fn event_for(packet: packet::Packet) -> MqttEvent {
    match packet {
        packet::Packet::Connack {
            reason,
            session_present,
        } => MqttEvent::Connack {
            reason,
            session_present,
        },
        packet::Packet::Suback { packet_id, codes } => MqttEvent::Suback { packet_id, codes },
        packet::Packet::Publish {
            topic,
            payload,
            qos,
            packet_id,
        } => MqttEvent::Message {
            topic,
            payload,
            qos,
            packet_id,
        },
    }
}

fn generate_client_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    format!("wt-{:08x}", nanos ^ std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{decode, Packet};

    #[test]
    fn packet_ids_increment_and_wrap() {
        let mut ids = PacketIds::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);

        ids.next = 0xFFFF;
        assert_eq!(ids.next(), 0xFFFF);
        // Wraps to 0, matching the 16-bit counter on the wire.
        assert_eq!(ids.next(), 0);
        assert_eq!(ids.next(), 1);
    }

    #[test]
    fn qos1_publishes_carry_increasing_ids() {
        let mut ids = PacketIds::new();
        let first = packet::encode_publish("t", "a", 1, ids.next());
        let second = packet::encode_publish("t", "b", 1, ids.next());

        let id_of = |pkt: &[u8]| match decode(pkt).unwrap().unwrap() {
            Packet::Publish { packet_id, .. } => packet_id.unwrap(),
            other => panic!("unexpected packet: {other:?}"),
        };
        assert_eq!(id_of(&first), 1);
        assert_eq!(id_of(&second), 2);
    }

    #[test]
    fn generated_client_ids_have_prefix() {
        assert!(generate_client_id().starts_with("wt-"));
    }
}
