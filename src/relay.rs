//! The relay unit: one WebTransport bidirectional stream paired with one
//! upstream QUIC stream, bytes pumped transparently in both directions.
//!
//! The relay never parses the MQTT bytes it carries. Within one direction,
//! the next read only starts once the previous write completed, which
//! preserves byte order and is the only backpressure mechanism; the two
//! directions are independent of each other.

use std::fmt;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{ReadError, RecvStream, SendStream, WriteError};

/// Largest chunk moved per read. Transport reads may return less; boundaries
/// carry no meaning.
const MAX_CHUNK: usize = 64 * 1024;

/// Error code used when aborting a write half after the opposite read failed.
const RELAY_ABORTED: u32 = 1;

/// The read half of a relayed byte stream: chunks at transport-determined
/// boundaries, `None` at end-of-stream.
#[allow(async_fn_in_trait)]
pub trait ChunkSource: Send {
    type Error: fmt::Display + Send;

    async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>, Self::Error>;
}

/// The write half of a relayed byte stream, with independent graceful close
/// and abrupt abort.
#[allow(async_fn_in_trait)]
pub trait ChunkSink: Send {
    type Error: fmt::Display + Send;

    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), Self::Error>;

    /// Gracefully end the stream; the peer sees end-of-stream.
    fn close(&mut self);

    /// Abruptly end the stream with an error code.
    fn abort(&mut self, code: u32);
}

impl ChunkSource for RecvStream {
    type Error = ReadError;

    async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>, Self::Error> {
        RecvStream::read_chunk(self, max).await
    }
}

impl ChunkSink for SendStream {
    type Error = WriteError;

    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), Self::Error> {
        SendStream::write_chunk(self, chunk).await
    }

    fn close(&mut self) {
        // Already-finished is fine; the stream ends either way.
        SendStream::finish(self).ok();
    }

    fn abort(&mut self, code: u32) {
        SendStream::reset(self, code).ok();
    }
}

// The upstream side uses quinn streams directly; no WebTransport header or
// error-code translation applies there.
impl ChunkSource for quinn::RecvStream {
    type Error = quinn::ReadError;

    async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>, Self::Error> {
        let chunk = quinn::RecvStream::read_chunk(self, max, true).await?;
        Ok(chunk.map(|chunk| chunk.bytes))
    }
}

impl ChunkSink for quinn::SendStream {
    type Error = quinn::WriteError;

    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), Self::Error> {
        quinn::SendStream::write_chunk(self, chunk).await
    }

    fn close(&mut self) {
        self.finish().ok();
    }

    fn abort(&mut self, code: u32) {
        self.reset(quinn::VarInt::from_u32(code)).ok();
    }
}

/// Pump one direction until end-of-stream or failure.
///
/// End-of-stream closes the sink so the far side observes the same; a
/// failure on either half aborts the sink instead. Errors are logged, never
/// propagated: each direction fails in isolation.
pub async fn pump<R: ChunkSource, W: ChunkSink>(mut source: R, mut sink: W, label: &'static str) {
    loop {
        match source.read_chunk(MAX_CHUNK).await {
            Ok(Some(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                if let Err(err) = sink.write_chunk(chunk).await {
                    tracing::debug!(%label, "relay write failed: {err}");
                    sink.abort(RELAY_ABORTED);
                    return;
                }
            }
            Ok(None) => {
                tracing::trace!(%label, "relay end of stream");
                sink.close();
                return;
            }
            Err(err) => {
                tracing::debug!(%label, "relay read failed: {err}");
                sink.abort(RELAY_ABORTED);
                return;
            }
        }
    }
}

/// Run one relay unit to completion.
///
/// The unit ends with whichever comes first: the client-to-broker pump
/// finishing, the broker-to-client pump finishing, or `cancel` firing
/// (the owning session closed). The losing branches are dropped, which
/// cooperatively cancels them at their next suspension point; their streams
/// are cleaned up by the caller closing the upstream connection.
pub async fn run_relay<WS, WR, US, UR>(
    wt: (WS, WR),
    upstream: (US, UR),
    cancel: CancellationToken,
) where
    WS: ChunkSink,
    WR: ChunkSource,
    US: ChunkSink,
    UR: ChunkSource,
{
    let (wt_send, wt_recv) = wt;
    let (up_send, up_recv) = upstream;

    tokio::select! {
        _ = pump(wt_recv, up_send, "client->broker") => {
            tracing::debug!("client->broker pump finished");
        }
        _ = pump(up_recv, wt_send, "broker->client") => {
            tracing::debug!("broker->client pump finished");
        }
        _ = cancel.cancelled() => {
            tracing::debug!("relay cancelled by session closure");
        }
    }
}
