//! Byte-stream plumbing.
//!
//! [`WsPipe`] turns a message-oriented WebSocket into an ordered byte stream
//! that the multiplexer can run over. [`Rewind`] replays bytes that were read
//! ahead of time before handing reads back to the wrapped stream, and
//! [`passthrough`] relays two streams against each other.

use bytes::{Buf, Bytes};
use futures_util::{ready, Sink, Stream};
use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::trace;

/// What a received WebSocket message means to the byte stream.
#[derive(Debug)]
pub enum Frame {
    /// Payload bytes.
    Data(Vec<u8>),
    /// Ping, pong and raw frames carry no stream data.
    Control,
    /// The peer closed the connection.
    Close,
}

/// A WebSocket message type usable as a byte carrier.
pub trait WsFrame: Sized {
    fn binary(data: Vec<u8>) -> Self;
    fn into_frame(self) -> Frame;
}

impl WsFrame for axum::extract::ws::Message {
    fn binary(data: Vec<u8>) -> Self {
        axum::extract::ws::Message::Binary(data)
    }

    fn into_frame(self) -> Frame {
        use axum::extract::ws::Message;
        match self {
            Message::Binary(data) => Frame::Data(data),
            Message::Text(text) => Frame::Data(text.into_bytes()),
            Message::Ping(_) | Message::Pong(_) => Frame::Control,
            Message::Close(_) => Frame::Close,
        }
    }
}

impl WsFrame for tokio_tungstenite::tungstenite::Message {
    fn binary(data: Vec<u8>) -> Self {
        tokio_tungstenite::tungstenite::Message::Binary(data)
    }

    fn into_frame(self) -> Frame {
        use tokio_tungstenite::tungstenite::Message;
        match self {
            Message::Binary(data) => Frame::Data(data),
            Message::Text(text) => Frame::Data(text.into_bytes()),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Frame::Control,
            Message::Close(_) => Frame::Close,
        }
    }
}

/// Byte stream over a WebSocket connection.
///
/// Every write goes out as one binary message. Reads hand out message
/// payloads in order, splitting them across calls when the caller's buffer
/// is smaller than the message.
pub struct WsPipe<S> {
    inner: S,
    pending: Bytes,
    eof: bool,
}

impl<S> WsPipe<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            eof: false,
        }
    }
}

fn other<E>(err: E) -> io::Error
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::Other, err)
}

impl<S, M, E> AsyncRead for WsPipe<S>
where
    S: Stream<Item = Result<M, E>> + Unpin,
    M: WsFrame,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(message)) => match message.into_frame() {
                    Frame::Data(data) => this.pending = Bytes::from(data),
                    Frame::Control => trace!("Skipping control message"),
                    Frame::Close => this.eof = true,
                },
                Some(Err(e)) => return Poll::Ready(Err(other(e))),
                None => this.eof = true,
            }
        }
    }
}

impl<S, M, E, W> AsyncWrite for WsPipe<S>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = W> + Unpin,
    M: WsFrame,
    W: Into<Box<dyn StdError + Send + Sync>>,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(other)?;
        Pin::new(&mut this.inner)
            .start_send(M::binary(buf.to_vec()))
            .map_err(other)?;
        // Push the message out now if the socket allows it; a pending flush
        // is picked up by the next poll_ready or poll_flush.
        if let Poll::Ready(Err(e)) = Pin::new(&mut this.inner).poll_flush(cx) {
            return Poll::Ready(Err(other(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(other)
    }
}

/// A stream with bytes pushed back in front of it.
pub struct Rewind<T> {
    prefix: Option<Bytes>,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(inner: T, prefix: Option<Bytes>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
            inner,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(mut prefix) = this.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix[..n]);
            prefix.advance(n);
            if !prefix.is_empty() {
                this.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Copy bytes both ways until either direction finishes, then shut down
/// both write sides. The other direction is not drained.
pub async fn passthrough<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let result = tokio::select! {
        r = tokio::io::copy(&mut a_read, &mut b_write) => r,
        r = tokio::io::copy(&mut b_read, &mut a_write) => r,
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    result.map(|bytes| trace!("Passthrough finished after {} bytes", bytes))
}

/// Read until the end of an HTTP head, returning everything read so far.
///
/// Fails if the stream ends first or the head grows past `limit` bytes.
#[cfg(test)]
pub(crate) async fn read_http_head<R>(reader: &mut R, limit: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before end of HTTP head",
            ));
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP head too large",
            ));
        }
    }
}
