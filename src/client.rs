use std::net::SocketAddr;
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore};
use url::Url;

use crate::{ClientError, Session, ALPN_H3};

/// Construct a WebTransport [Client] using sane defaults.
pub struct ClientBuilder {
    roots: RootCertStore,
    no_verify: bool,
}

impl ClientBuilder {
    /// Create a Client builder, which can be used to establish multiple [Session]s.
    pub fn new() -> Self {
        Self {
            roots: RootCertStore::empty(),
            no_verify: false,
        }
    }

    /// Trust the given root certificates when verifying the server.
    pub fn with_root_certificates(mut self, roots: RootCertStore) -> Self {
        self.roots = roots;
        self
    }

    /// Trust a single server certificate, typically self-signed. Useful for tests.
    pub fn with_server_certificate(
        mut self,
        cert: CertificateDer<'static>,
    ) -> Result<Self, ClientError> {
        self.roots.add(cert).map_err(ClientError::Tls)?;
        Ok(self)
    }

    /// Skip certificate verification entirely. For development setups only.
    pub fn with_no_certificate_verification(mut self) -> Self {
        self.no_verify = true;
        self
    }

    pub fn build(self) -> Result<Client, ClientError> {
        let builder = rustls::ClientConfig::builder();
        let mut crypto = if self.no_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(self.roots)
                .with_no_client_auth()
        };
        crypto.alpn_protocols = vec![ALPN_H3.as_bytes().to_vec()];

        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?;
        let config = quinn::ClientConfig::new(Arc::new(crypto));

        let endpoint = quinn::Endpoint::client("[::]:0".parse().unwrap())?;

        Ok(Client { endpoint, config })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A client for connecting to a WebTransport server.
pub struct Client {
    endpoint: quinn::Endpoint,
    config: quinn::ClientConfig,
}

impl Client {
    /// Manually create a client via a quinn endpoint and config.
    ///
    /// The ALPN MUST be set to [ALPN_H3].
    pub fn new(endpoint: quinn::Endpoint, config: quinn::ClientConfig) -> Self {
        Self { endpoint, config }
    }

    /// Connect to the server at the given `https` URL and perform the
    /// WebTransport handshake.
    pub async fn connect(&self, url: Url) -> Result<Session, ClientError> {
        let host = url.host_str().ok_or(ClientError::InvalidUrl)?.to_string();
        let port = url.port().unwrap_or(443);

        // Resolve the hostname, preferring whatever the resolver returns first.
        let addr: SocketAddr = tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or(ClientError::InvalidUrl)?;

        let conn = self
            .endpoint
            .connect_with(self.config.clone(), addr, &host)?
            .await?;

        Session::connect_h3(conn, url).await
    }
}

/// Accepts any server certificate. Meant for development setups where the
/// broker presents a certificate for a hostname other than the one dialed.
#[derive(Debug)]
pub(crate) struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
