use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::{SkipServerVerification, ALPN_MQTT};

/// An error establishing one upstream QUIC connection to the broker.
///
/// These are isolated per relay unit: the one WebTransport stream stays
/// unbridged, nothing else is affected and no retry is attempted.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("failed to connect: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no TLS 1.3 cipher suite available: {0}")]
    Crypto(#[from] quinn::crypto::rustls::NoInitialCipherSuite),

    #[error("tls configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("could not resolve broker address {0}")]
    NoAddress(String),
}

/// Where the broker's QUIC listener lives.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    /// SNI to present; defaults to `host`. Must match the broker certificate's
    /// hostname when verification is on.
    pub sni: Option<String>,
    /// Skip certificate verification. For development setups only.
    pub no_verify: bool,
    /// Roots to trust when verification is on.
    pub roots: rustls::RootCertStore,
}

/// Dials fresh QUIC connections to the broker with the `mqtt` ALPN.
///
/// One connection per call: connections are deliberately not pooled or
/// reused, so every relayed stream is its own MQTT connection as far as the
/// broker is concerned.
pub struct MqttUpstream {
    endpoint: quinn::Endpoint,
    config: quinn::ClientConfig,
    host: String,
    port: u16,
    sni: String,
}

/// One freshly dialed upstream connection and its single bidirectional stream.
pub struct UpstreamLink {
    pub conn: quinn::Connection,
    pub send: quinn::SendStream,
    pub recv: quinn::RecvStream,
}

impl MqttUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamError> {
        let builder = rustls::ClientConfig::builder();
        let mut crypto = if config.no_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(config.roots)
                .with_no_client_auth()
        };
        crypto.alpn_protocols = vec![ALPN_MQTT.as_bytes().to_vec()];

        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?;
        let client_config = quinn::ClientConfig::new(Arc::new(crypto));

        let endpoint = quinn::Endpoint::client("[::]:0".parse().unwrap())?;

        let sni = config.sni.unwrap_or_else(|| config.host.clone());
        Ok(Self {
            endpoint,
            config: client_config,
            host: config.host,
            port: config.port,
            sni,
        })
    }

    /// Dial one new connection and open its one bidirectional stream.
    pub async fn connect(&self) -> Result<UpstreamLink, UpstreamError> {
        let addr: SocketAddr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| UpstreamError::NoAddress(self.host.clone()))?;

        tracing::debug!(%addr, sni = %self.sni, "dialing broker (ALPN={ALPN_MQTT})");

        let conn = self
            .endpoint
            .connect_with(self.config.clone(), addr, &self.sni)?
            .await?;

        // The broker treats the first (only) bidi stream as the MQTT connection.
        let (send, recv) = conn.open_bi().await?;

        tracing::debug!("broker stream opened");
        Ok(UpstreamLink { conn, send, recv })
    }
}
