use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;

use crate::WriteError;

/// A stream that can be used to send bytes. See [`quinn::SendStream`].
#[derive(Debug)]
pub struct SendStream {
    inner: quinn::SendStream,
}

impl SendStream {
    pub(crate) fn new(stream: quinn::SendStream) -> Self {
        Self { inner: stream }
    }

    /// Abruptly reset the stream with the given error code.
    /// This is a u32 with WebTransport since it shares the error space with HTTP/3.
    pub fn reset(&mut self, code: u32) -> Result<(), quinn::ClosedStream> {
        let code = web_transport_proto::error_to_http3(code);
        let code = quinn::VarInt::try_from(code).unwrap();
        self.inner.reset(code)
    }

    /// Write some data to the stream, returning the amount written. See [`quinn::SendStream::write`].
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, WriteError> {
        self.inner.write(buf).await.map_err(Into::into)
    }

    /// Write all of the data to the stream. See [`quinn::SendStream::write_all`].
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        self.inner.write_all(buf).await.map_err(Into::into)
    }

    /// Write a chunk without copying it. See [`quinn::SendStream::write_chunk`].
    pub async fn write_chunk(&mut self, buf: Bytes) -> Result<(), WriteError> {
        self.inner.write_chunk(buf).await.map_err(Into::into)
    }

    /// Gracefully finish the send half; the peer observes end-of-stream after
    /// all pending data arrives. Finishing twice is an error at the quinn
    /// level, which callers are free to ignore.
    pub fn finish(&mut self) -> Result<(), quinn::ClosedStream> {
        self.inner.finish()
    }

    /// Set the priority of the stream. See [`quinn::SendStream::set_priority`].
    pub fn set_priority(&mut self, priority: i32) -> Result<(), quinn::ClosedStream> {
        self.inner.set_priority(priority)
    }
}

impl tokio::io::AsyncWrite for SendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // Fully qualified: quinn also has an inherent poll_write with its own
        // error type, which would shadow the trait method here.
        tokio::io::AsyncWrite::poll_write(Pin::new(&mut self.inner), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
