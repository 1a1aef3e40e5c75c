use web_transport_proto::{ConnectRequest, ConnectResponse, VarInt};

use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    #[error("quic stream was closed early")]
    UnexpectedEnd,

    #[error("protocol error: {0}")]
    ProtoError(#[from] web_transport_proto::ConnectError),

    #[error("connection error: {0}")]
    ConnectionError(#[from] quinn::ConnectionError),

    #[error("read error: {0}")]
    ReadError(#[from] quinn::ReadError),

    #[error("write error: {0}")]
    WriteError(#[from] quinn::WriteError),

    #[error("http error status: {0}")]
    ErrorStatus(http::StatusCode),
}

/// The HTTP/3 extended CONNECT exchange that establishes a WebTransport session.
pub struct Connect {
    // The request that was sent by the client.
    request: ConnectRequest,

    // A reference to the send/recv stream, so we don't close it until dropped.
    send: quinn::SendStream,

    #[allow(dead_code)]
    recv: quinn::RecvStream,
}

impl Connect {
    /// Accept the stream that carries the HTTP CONNECT request.
    /// Any other type of HTTP request errors out.
    pub async fn accept(conn: &quinn::Connection) -> Result<Self, ConnectError> {
        let (send, mut recv) = conn.accept_bi().await?;

        let request = ConnectRequest::read(&mut recv).await?;
        tracing::debug!("received CONNECT request: {request:?}");

        // The request was successfully decoded, so we can send a response.
        Ok(Self {
            request,
            send,
            recv,
        })
    }

    // Called by the server to send a response to the client.
    pub async fn respond(&mut self, status: http::StatusCode) -> Result<(), ConnectError> {
        let resp = ConnectResponse { status };

        tracing::debug!("sending CONNECT response: {resp:?}");
        resp.write(&mut self.send).await?;

        Ok(())
    }

    /// Called by the client to send the CONNECT request and await the response.
    pub async fn open(conn: &quinn::Connection, url: Url) -> Result<Self, ConnectError> {
        let (mut send, mut recv) = conn.open_bi().await?;

        let request = ConnectRequest { url };

        tracing::debug!("sending CONNECT request: {request:?}");
        request.write(&mut send).await?;

        let response = ConnectResponse::read(&mut recv).await?;
        tracing::debug!("received CONNECT response: {response:?}");

        // Throw an error if we didn't get a 200 OK.
        if response.status != http::StatusCode::OK {
            return Err(ConnectError::ErrorStatus(response.status));
        }

        Ok(Self {
            request,
            send,
            recv,
        })
    }

    // The session ID is the stream ID of the CONNECT request.
    pub fn session_id(&self) -> VarInt {
        // We gotta convert from the Quinn VarInt to the WebTransport VarInt.
        let stream_id = quinn::VarInt::from(self.send.id());
        VarInt::try_from(stream_id.into_inner()).unwrap()
    }

    // The URL in the CONNECT request.
    pub fn url(&self) -> &Url {
        &self.request.url
    }

    pub(super) fn into_inner(self) -> (quinn::SendStream, quinn::RecvStream) {
        (self.send, self.recv)
    }

    // Keep reading from the control stream until it's closed.
    pub(crate) async fn run_closed(self) -> (u32, String) {
        let (_send, mut recv) = self.into_inner();

        loop {
            match web_transport_proto::Capsule::read(&mut recv).await {
                Ok(web_transport_proto::Capsule::CloseWebTransportSession { code, reason }) => {
                    return (code, reason);
                }
                Ok(web_transport_proto::Capsule::Unknown { typ, payload }) => {
                    tracing::warn!("unknown capsule: type={typ} size={}", payload.len());
                }
                Err(_) => {
                    return (1, "capsule error".to_string());
                }
            }
        }
    }
}
