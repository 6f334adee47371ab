/*
 * connection.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Varco, an intercepting HTTP/HTTPS proxy.
 *
 * Varco is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Varco is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Varco.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Connection object: one plain, UNIX, or TLS stream with a read buffer, a
//! write queue, and a close latch. A connection is owned by exactly one
//! protocol handler (client side) or by the pool (idle upstream side) and is
//! shut down exactly once.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::buffer::RecvBuffer;

/// Stream that replays buffered bytes before reading from the inner stream.
/// A CONNECT client often sends its TLS ClientHello together with the
/// request; those bytes are already in the read buffer when the handshake
/// starts and must not be lost.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    pub fn empty(inner: S) -> Self {
        Self {
            prefix: Bytes::new(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Unified stream: plain TCP, UNIX socket, server-side TLS (a client we
/// accepted or intercepted), or client-side TLS (an origin we dialled).
pub enum PeerStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<PrefixedStream<TcpStream>>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// Placeholder after the stream was taken for a TLS upgrade, and the
    /// terminal state after close.
    Closed,
}

impl AsyncRead for PeerStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            PeerStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            PeerStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            PeerStream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            PeerStream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            PeerStream::Closed => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            PeerStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            PeerStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            PeerStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            PeerStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            PeerStream::Closed => {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "closed")))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            PeerStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            PeerStream::Unix(s) => Pin::new(s).poll_flush(cx),
            PeerStream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            PeerStream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            PeerStream::Closed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            PeerStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            PeerStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            PeerStream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            PeerStream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            PeerStream::Closed => Poll::Ready(Ok(())),
        }
    }
}

/// Which side of the proxy this connection faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnTag {
    /// Accepted from a downstream client.
    Client,
    /// Dialled to an upstream origin.
    Server,
}

/// Outcome of one `recv` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Appended this many bytes to the read buffer.
    Data(usize),
    /// Orderly end of stream from the peer.
    Eof,
    /// The close latch was already set; nothing was read.
    Closed,
}

pub struct TcpConn {
    stream: PeerStream,
    tag: ConnTag,
    pub read_buf: RecvBuffer,
    write_queue: VecDeque<Bytes>,
    written: u64,
    closed: bool,
}

impl TcpConn {
    pub fn client(stream: PeerStream) -> Self {
        Self::with_tag(stream, ConnTag::Client)
    }

    pub fn server(stream: PeerStream) -> Self {
        Self::with_tag(stream, ConnTag::Server)
    }

    fn with_tag(stream: PeerStream, tag: ConnTag) -> Self {
        Self {
            stream,
            tag,
            read_buf: RecvBuffer::new(),
            write_queue: VecDeque::new(),
            written: 0,
            closed: false,
        }
    }

    /// Total bytes ever flushed to the peer. The handler uses this to decide
    /// whether an error response can still be sent.
    pub fn total_written(&self) -> u64 {
        self.written
    }

    pub fn tag(&self) -> ConnTag {
        self.tag
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read once into the buffer. No-op after close.
    pub async fn recv(&mut self) -> io::Result<RecvState> {
        if self.closed {
            return Ok(RecvState::Closed);
        }
        let n = self.stream.read_buf(self.read_buf.inner_mut()).await?;
        self.read_buf.note_appended(n);
        if n == 0 {
            Ok(RecvState::Eof)
        } else {
            Ok(RecvState::Data(n))
        }
    }

    /// Append bytes to the write queue. No-op after close.
    pub fn queue(&mut self, data: Bytes) {
        if !self.closed && !data.is_empty() {
            self.write_queue.push_back(data);
        }
    }

    /// Write queued chunks head-first. A short write leaves the remainder at
    /// the head of the queue. Returns bytes written; no-op after close.
    pub async fn flush(&mut self) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let mut written = 0;
        while let Some(front) = self.write_queue.front_mut() {
            let n = self.stream.write(front).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped"));
            }
            written += n;
            self.written += n as u64;
            if n == front.len() {
                self.write_queue.pop_front();
            } else {
                front.advance(n);
            }
        }
        self.stream.flush().await?;
        Ok(written)
    }

    pub fn has_pending(&self) -> bool {
        !self.closed && !self.write_queue.is_empty()
    }

    /// Shut the socket down. Idempotent: the latch guarantees the underlying
    /// socket is closed exactly once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.write_queue.clear();
        let _ = self.stream.shutdown().await;
        self.stream = PeerStream::Closed;
    }

    /// The origin's certificate chain, when this is a TLS connection we
    /// dialled. Used to preserve SAN entries on synthesised certificates.
    pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        match &self.stream {
            PeerStream::ClientTls(s) => s
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect()),
            _ => None,
        }
    }

    /// Switch an accepted plaintext TCP client to server-side TLS with the
    /// given (synthesised or fixed) certificate config. Bytes already in the
    /// read buffer are replayed into the handshake. On failure the
    /// connection is left unusable and must be closed by the caller.
    pub async fn upgrade_server_tls(&mut self, config: Arc<ServerConfig>) -> io::Result<()> {
        let prefix = self.read_buf.take_all();
        let taken = std::mem::replace(&mut self.stream, PeerStream::Closed);
        let tcp = match taken {
            PeerStream::Tcp(t) => t,
            other => {
                self.stream = other;
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "TLS upgrade requires a plain TCP client",
                ));
            }
        };
        let acceptor = TlsAcceptor::from(config);
        let tls = acceptor.accept(PrefixedStream::new(prefix, tcp)).await?;
        self.stream = PeerStream::ServerTls(Box::new(tls));
        Ok(())
    }
}
