//! Accept loops tying the WebTransport server to the relay.
//!
//! One spawned task per session, one spawned relay unit per stream. Failures
//! are isolated at each level: a broken stream never takes down its session,
//! a broken session never takes down the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{relay, MqttUpstream, RecvStream, SendStream, Server, ServerError, Session};

/// The bridge: a WebTransport server whose every incoming bidirectional
/// stream is relayed over one fresh QUIC connection to the broker.
pub struct Bridge {
    server: Server,
    upstream: Arc<MqttUpstream>,
}

impl Bridge {
    pub fn new(server: Server, upstream: MqttUpstream) -> Self {
        Self {
            server,
            upstream: Arc::new(upstream),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Accept sessions until the endpoint closes.
    ///
    /// Individual session failures are logged inside their own task; only
    /// the endpoint going away ends this loop.
    pub async fn run(mut self) -> Result<(), ServerError> {
        while let Some(request) = self.server.accept().await {
            tracing::info!(url = %request.url(), "new WebTransport session");

            let upstream = self.upstream.clone();
            tokio::spawn(async move {
                match request.ok().await {
                    Ok(session) => run_session(session, upstream).await,
                    Err(err) => tracing::warn!("session handshake failed: {err}"),
                }
            });
        }

        tracing::info!("endpoint closed, bridge stopping");
        Ok(())
    }
}

/// Accept bidirectional streams on one session, spawning a relay unit per
/// stream, until the session closes.
///
/// Session closure cancels every relay unit still running under it: the
/// token's drop guard fires when this function returns.
pub async fn run_session(session: Session, upstream: Arc<MqttUpstream>) {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    loop {
        match session.accept_bi().await {
            Ok((send, recv)) => {
                tracing::info!("new bidi stream from client");
                tokio::spawn(relay_stream(
                    upstream.clone(),
                    send,
                    recv,
                    cancel.child_token(),
                ));
            }
            Err(err) => {
                tracing::info!("session closed: {err}");
                return;
            }
        }
    }
}

/// One relay unit: dial the broker, pump until either side finishes or the
/// session goes away, then tear the upstream connection down.
async fn relay_stream(
    upstream: Arc<MqttUpstream>,
    wt_send: SendStream,
    wt_recv: RecvStream,
    cancel: CancellationToken,
) {
    // A connect failure leaves this one stream unbridged; no retry.
    let link = match upstream.connect().await {
        Ok(link) => link,
        Err(err) => {
            tracing::warn!("upstream connect failed: {err}");
            return;
        }
    };

    relay::run_relay((wt_send, wt_recv), (link.send, link.recv), cancel).await;

    // Ends any stream operation still pending; closing twice is a no-op.
    link.conn.close(0u32.into(), b"relay done");
    tracing::info!("stream and upstream connection closed");
}
