use std::{
    fs,
    io::{self, BufReader},
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::Duration,
};

use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use url::Url;

use crate::{Connect, ServerError, Session, Settings, ALPN_H3};

/// Construct a WebTransport [Server] using sane defaults.
///
/// This is optional; advanced users may use [Server::new] directly.
pub struct ServerBuilder {
    listen: SocketAddr,
    chain: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            listen: "[::]:443".parse().unwrap(),
            chain: Vec::new(),
            key: None,
        }
    }

    /// Listen on the specified address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    /// Use an already-loaded certificate chain and private key.
    pub fn with_certificate(
        mut self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        self.chain = chain;
        self.key = Some(key);
        self
    }

    /// Load the certificate chain and private key from PEM files.
    pub fn with_pem_files(
        mut self,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, ServerError> {
        let mut reader = BufReader::new(fs::File::open(cert_path)?);
        self.chain = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
        if self.chain.is_empty() {
            return Err(ServerError::InvalidPem(format!(
                "no certificates found in {}",
                cert_path.display()
            )));
        }

        let mut reader = BufReader::new(fs::File::open(key_path)?);
        let key = rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
            ServerError::InvalidPem(format!("no private key found in {}", key_path.display()))
        })?;
        self.key = Some(key);

        Ok(self)
    }

    pub fn build(self) -> Result<Server, ServerError> {
        let key = self
            .key
            .ok_or_else(|| ServerError::InvalidPem("no private key configured".into()))?;

        let mut crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.chain, key)?;
        crypto.alpn_protocols = vec![ALPN_H3.as_bytes().to_vec()];

        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)?;
        let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(Duration::from_secs(1)));
        config.transport_config(Arc::new(transport));

        let endpoint = quinn::Endpoint::server(config, self.listen)?;
        Ok(Server::new(endpoint))
    }
}

/// A WebTransport server that accepts new sessions.
pub struct Server {
    endpoint: quinn::Endpoint,
    accept: FuturesUnordered<BoxFuture<'static, Result<Request, ServerError>>>,
}

impl Server {
    /// Creates a new server with a manually constructed [`quinn::Endpoint`].
    pub fn new(endpoint: quinn::Endpoint) -> Self {
        Self {
            endpoint,
            accept: Default::default(),
        }
    }

    /// The address the endpoint is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Accept a new WebTransport session Request from a client.
    ///
    /// The H3 handshake for each incoming connection runs off the accept
    /// loop, so a slow or broken client can't stall the others; a handshake
    /// failure is dropped here rather than surfaced.
    pub async fn accept(&mut self) -> Option<Request> {
        loop {
            tokio::select! {
                res = self.endpoint.accept() => {
                    let incoming = res?;
                    self.accept.push(Box::pin(async move {
                        let conn = incoming.await?;
                        Request::accept(conn).await
                    }));
                }
                Some(res) = self.accept.next() => {
                    match res {
                        Ok(session) => return Some(session),
                        Err(err) => tracing::debug!("handshake failed: {err}"),
                    }
                }
            }
        }
    }
}

/// A mostly complete WebTransport handshake, just awaiting the server's
/// decision on whether to accept or reject the session based on the URL.
pub struct Request {
    conn: quinn::Connection,
    settings: Settings,
    connect: Connect,
}

impl Request {
    /// Accept a new WebTransport session from a client.
    pub async fn accept(conn: quinn::Connection) -> Result<Self, ServerError> {
        // Exchange SETTINGS frames, then receive the extended CONNECT request.
        let settings = Settings::connect(&conn).await?;
        let connect = Connect::accept(&conn).await?;

        Ok(Self {
            conn,
            settings,
            connect,
        })
    }

    /// Returns the URL provided by the client.
    pub fn url(&self) -> &Url {
        self.connect.url()
    }

    /// Accept the session, returning a 200 OK.
    pub async fn ok(mut self) -> Result<Session, ServerError> {
        self.connect.respond(http::StatusCode::OK).await?;
        Ok(Session::new_h3(self.conn, self.settings, self.connect))
    }

    /// Reject the session, returning your favorite HTTP status code.
    pub async fn close(mut self, status: http::StatusCode) -> Result<(), ServerError> {
        self.connect.respond(status).await?;
        self.conn
            .close(status.as_u16().into(), status.as_str().as_bytes());
        Ok(())
    }
}
