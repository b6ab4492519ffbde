use std::{
    fmt, io,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::client::TlsStream;

use crate::{dns::RemoteAddress, proto::h2::H2Conn, proto::handle::HandleRegistry};

/// The negotiated application protocol of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Protocol {
    Http1,
    Http2,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http1 => f.write_str("HTTP/1.1"),
            Protocol::Http2 => f.write_str("HTTP/2"),
        }
    }
}

/// A plaintext or TLS transport stream.
pub(crate) enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One live HTTP/1.1 connection: the stream, its read buffer and the
/// single-slot handle registry. Owned exclusively by the request driving an
/// exchange on it.
pub(crate) struct H1Conn {
    pub(crate) io: MaybeTlsStream,
    pub(crate) read_buf: BytesMut,
    pub(crate) registry: HandleRegistry,
    pub(crate) broken: bool,
}

impl H1Conn {
    pub(crate) fn new(io: MaybeTlsStream) -> H1Conn {
        H1Conn {
            io,
            read_buf: BytesMut::with_capacity(8 * 1024),
            registry: HandleRegistry::http1(),
            broken: false,
        }
    }
}

pub(crate) enum ConnInner {
    H1(H1Conn),
    H2(H2Conn),
}

/// One pooled transport connection with its negotiated protocol.
pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) addr: RemoteAddress,
    pub(crate) ssl: bool,
    pub(crate) inner: ConnInner,
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

impl Connection {
    pub(crate) fn h1(addr: RemoteAddress, ssl: bool, io: MaybeTlsStream) -> Connection {
        Connection {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            ssl,
            inner: ConnInner::H1(H1Conn::new(io)),
        }
    }

    pub(crate) fn h2(addr: RemoteAddress, ssl: bool, conn: H2Conn) -> Connection {
        Connection {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            ssl,
            inner: ConnInner::H2(conn),
        }
    }

    pub(crate) fn protocol(&self) -> Protocol {
        match self.inner {
            ConnInner::H1(_) => Protocol::Http1,
            ConnInner::H2(_) => Protocol::Http2,
        }
    }

    /// Whether the connection can still carry requests.
    pub(crate) fn is_open(&self) -> bool {
        match &self.inner {
            ConnInner::H1(h1) => !h1.broken,
            ConnInner::H2(h2) => h2.is_open(),
        }
    }

    /// HTTP/2 connections multiplex; hand out a shared clone while the
    /// original stays pooled. HTTP/1.1 connections are exclusive.
    pub(crate) fn share(&self) -> Option<Connection> {
        match &self.inner {
            ConnInner::H1(_) => None,
            ConnInner::H2(h2) => Some(Connection {
                id: self.id,
                addr: self.addr.clone(),
                ssl: self.ssl,
                inner: ConnInner::H2(h2.clone()),
            }),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("ssl", &self.ssl)
            .field("protocol", &self.protocol())
            .finish()
    }
}
