//! End-to-end tests over real in-process endpoints: a fake MQTT broker
//! speaking QUIC with the `mqtt` ALPN, the bridge in the middle, and either
//! a raw WebTransport session or the full [`MqttClient`] on the outside.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::time::timeout;
use url::Url;

use crate::{
    Bridge, Client, ClientBuilder, ClientState, MqttClient, MqttClientError, MqttEvent,
    MqttUpstream, ServerBuilder, UpstreamConfig, ALPN_MQTT,
};

const WAIT: Duration = Duration::from_secs(5);

fn install_provider() {
    rustls::crypto::ring::default_provider().install_default().ok();
}

fn self_signed() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    (cert.cert.der().clone(), key.into())
}

struct FakeBroker {
    addr: SocketAddr,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

/// A broker double: one bidi stream per connection, byte-level responses.
/// CONNECT gets a CONNACK with reason 0, SUBSCRIBE gets a single-code SUBACK
/// echoing the packet id, everything else (PUBLISH included) is echoed
/// verbatim.
fn spawn_fake_broker() -> FakeBroker {
    let (cert, key) = self_signed();
    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    crypto.alpn_protocols = vec![ALPN_MQTT.as_bytes().to_vec()];

    let config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto).unwrap(),
    ));
    let endpoint = quinn::Endpoint::server(config, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.local_addr().unwrap();

    let opened = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));

    let opened2 = opened.clone();
    let closed2 = closed.clone();
    tokio::spawn(async move {
        while let Some(incoming) = endpoint.accept().await {
            let opened = opened2.clone();
            let closed = closed2.clone();
            tokio::spawn(async move {
                let Ok(conn) = incoming.await else { return };
                opened.fetch_add(1, Ordering::SeqCst);

                if let Ok((mut send, mut recv)) = conn.accept_bi().await {
                    while let Ok(Some(chunk)) = recv.read_chunk(64 * 1024, true).await {
                        let buf = chunk.bytes;
                        let reply: Vec<u8> = match buf.first().map(|b| b >> 4) {
                            Some(1) => vec![0x20, 0x03, 0x00, 0x00, 0x00],
                            Some(8) => vec![0x90, 0x04, buf[2], buf[3], 0x00, 0x00],
                            _ => buf.to_vec(),
                        };
                        if send.write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                    send.finish().ok();
                }

                conn.closed().await;
                closed.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    FakeBroker {
        addr,
        opened,
        closed,
    }
}

/// Start the bridge in front of `broker`, returning the URL clients dial.
fn spawn_bridge(broker: &FakeBroker) -> Url {
    let (cert, key) = self_signed();
    let server = ServerBuilder::new()
        .with_addr("127.0.0.1:0".parse().unwrap())
        .with_certificate(vec![cert], key)
        .build()
        .unwrap();

    let upstream = MqttUpstream::new(UpstreamConfig {
        host: "127.0.0.1".to_string(),
        port: broker.addr.port(),
        sni: None,
        no_verify: true,
        roots: rustls::RootCertStore::empty(),
    })
    .unwrap();

    let bridge = Bridge::new(server, upstream);
    let addr = bridge.local_addr().unwrap();
    tokio::spawn(bridge.run());

    format!("https://127.0.0.1:{}/mqtt", addr.port())
        .parse()
        .unwrap()
}

fn web_transport_client() -> Client {
    ClientBuilder::new()
        .with_no_certificate_verification()
        .build()
        .unwrap()
}

async fn wait_for(counter: &AtomicUsize, value: usize) {
    timeout(WAIT, async {
        while counter.load(Ordering::SeqCst) < value {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("counter never reached expected value");
}

#[tokio::test]
async fn raw_stream_relay_roundtrip() {
    install_provider();
    let broker = spawn_fake_broker();
    let url = spawn_bridge(&broker);

    let session = web_transport_client().connect(url).await.unwrap();
    let (mut send, mut recv) = session.open_bi().await.unwrap();

    // Arbitrary non-MQTT bytes: the relay must carry them untouched and the
    // echo must come back in order.
    send.write_all(b"\xab\xcd first").await.unwrap();
    let chunk = timeout(WAIT, recv.read_chunk(1024)).await.unwrap().unwrap();
    assert_eq!(chunk.unwrap(), &b"\xab\xcd first"[..]);

    send.write_all(b"\xab second").await.unwrap();
    let chunk = timeout(WAIT, recv.read_chunk(1024)).await.unwrap().unwrap();
    assert_eq!(chunk.unwrap(), &b"\xab second"[..]);

    // Finishing our write half ends the relay unit: the broker sees
    // end-of-stream and the unit tears down. Whether our read half observes
    // a clean end or a reset depends on which direction wins the teardown;
    // either way no further data arrives.
    send.finish().unwrap();
    let end = timeout(WAIT, recv.read_chunk(1024)).await.unwrap();
    assert!(matches!(end, Ok(None) | Err(_)));

    session.close(0, b"done");
}

#[tokio::test]
async fn streams_support_tokio_io_traits() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    install_provider();
    let broker = spawn_fake_broker();
    let url = spawn_bridge(&broker);

    let session = web_transport_client().connect(url).await.unwrap();
    let (mut send, mut recv) = session.open_bi().await.unwrap();

    // Drive the stream halves through the tokio traits instead of the
    // inherent methods; the echo still comes back intact.
    AsyncWriteExt::write_all(&mut send, b"\xab via traits")
        .await
        .unwrap();
    let mut buf = [0u8; 12];
    timeout(WAIT, AsyncReadExt::read_exact(&mut recv, &mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"\xab via traits");

    session.close(0, b"done");
}

#[tokio::test]
async fn concurrent_streams_get_own_upstream_connections() {
    install_provider();
    let broker = spawn_fake_broker();
    let url = spawn_bridge(&broker);

    let session = web_transport_client().connect(url).await.unwrap();
    let (mut send_a, mut recv_a) = session.open_bi().await.unwrap();
    let (mut send_b, mut recv_b) = session.open_bi().await.unwrap();

    send_a.write_all(b"\xaa stream a").await.unwrap();
    send_b.write_all(b"\xbb stream b").await.unwrap();

    let chunk_a = timeout(WAIT, recv_a.read_chunk(1024)).await.unwrap().unwrap();
    assert_eq!(chunk_a.unwrap(), &b"\xaa stream a"[..]);
    let chunk_b = timeout(WAIT, recv_b.read_chunk(1024)).await.unwrap().unwrap();
    assert_eq!(chunk_b.unwrap(), &b"\xbb stream b"[..]);

    // One fresh upstream connection per stream, never shared.
    wait_for(&broker.opened, 2).await;
    assert_eq!(broker.opened.load(Ordering::SeqCst), 2);

    session.close(0, b"done");
}

#[tokio::test]
async fn session_closure_tears_down_upstreams() {
    install_provider();
    let broker = spawn_fake_broker();
    let url = spawn_bridge(&broker);

    let session = web_transport_client().connect(url).await.unwrap();
    let (mut send, mut recv) = session.open_bi().await.unwrap();
    send.write_all(b"\xaa ping").await.unwrap();
    let chunk = timeout(WAIT, recv.read_chunk(1024)).await.unwrap().unwrap();
    assert_eq!(chunk.unwrap(), &b"\xaa ping"[..]);
    wait_for(&broker.opened, 1).await;

    // Closing the whole session cancels the relay unit, which closes its
    // upstream connection.
    session.close(0, b"going away");
    wait_for(&broker.closed, 1).await;
}

#[tokio::test]
async fn mqtt_client_end_to_end() {
    install_provider();
    let broker = spawn_fake_broker();
    let url = spawn_bridge(&broker);

    let mut client = MqttClient::new(web_transport_client(), url).with_client_id("test-client");
    let mut events = client.events();

    assert_eq!(client.state(), ClientState::Idle);
    client.connect().await.unwrap();
    assert_eq!(client.state(), ClientState::Connected);

    let connack = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(
        connack,
        MqttEvent::Connack {
            reason: 0,
            session_present: false,
        }
    );

    let packet_id = client.subscribe("bench/topic").await.unwrap();
    let suback = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(
        suback,
        MqttEvent::Suback {
            packet_id,
            codes: vec![0],
        }
    );

    // The fake broker echoes the PUBLISH back at us.
    client.publish("bench/topic", "hello", 0).await.unwrap();
    let message = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(
        message,
        MqttEvent::Message {
            topic: "bench/topic".to_string(),
            payload: "hello".to_string(),
            qos: 0,
            packet_id: None,
        }
    );

    client.disconnect();
    assert_eq!(client.state(), ClientState::Closed);
    let closed = timeout(WAIT, async {
        loop {
            match events.recv().await.unwrap() {
                MqttEvent::Closed => break,
                other => tracing::debug!("draining event: {other:?}"),
            }
        }
    })
    .await;
    closed.unwrap();
}

#[tokio::test]
async fn failed_connect_resets_to_idle() {
    install_provider();
    // A hostname that never resolves: the dial fails before any transport
    // activity, the same cleanup path as a CONNECT write failure.
    let url: Url = "https://nowhere.invalid:443/mqtt".parse().unwrap();
    let mut client = MqttClient::new(web_transport_client(), url);

    assert!(client.connect().await.is_err());
    assert_eq!(client.state(), ClientState::Idle);

    // The client is not wedged: a retry dials again instead of reporting
    // AlreadyConnected.
    assert!(matches!(
        client.connect().await,
        Err(MqttClientError::Transport(_))
    ));
    assert_eq!(client.state(), ClientState::Idle);
}

#[tokio::test]
async fn publish_and_subscribe_require_connection() {
    install_provider();
    let url: Url = "https://127.0.0.1:1/mqtt".parse().unwrap();
    let mut client = MqttClient::new(web_transport_client(), url);

    assert!(client.subscribe("t").await.is_err());
    assert!(client.publish("t", "x", 0).await.is_err());
    assert!(client.subscribe("").await.is_err());
}
