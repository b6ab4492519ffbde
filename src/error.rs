use std::{error::Error as StdError, fmt, io};

use http::Uri;

/// A `Result` alias where the `Err` case is `courier::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while driving a request through the transport.
///
/// Note: errors may include the full URI of the request. If the URI contains
/// sensitive information (e.g. an API key as a query parameter), be sure to
/// remove it ([`without_uri`](Error::without_uri)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    uri: Option<Uri>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Io,
    Connect,
    ClosedConnection,
    PoolAcquire,
    WriteBufferFull,
    ContentOverSized,
    Decode,
    StreamIdExhausted,
    Timeout,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                uri: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn io<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Io, Some(e))
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    pub(crate) fn closed_connection<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::ClosedConnection, Some(e))
    }

    pub(crate) fn pool_acquire<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::PoolAcquire, Some(e))
    }

    pub(crate) fn write_buffer_full() -> Error {
        Error::new(Kind::WriteBufferFull, None::<Error>)
    }

    pub(crate) fn content_over_sized(limit: u64) -> Error {
        Error::new(
            Kind::ContentOverSized,
            Some(format!("content length over the limit of {limit} bytes")),
        )
    }

    pub(crate) fn decode<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Decode, Some(e))
    }

    pub(crate) fn stream_id_exhausted() -> Error {
        Error::new(Kind::StreamIdExhausted, None::<Error>)
    }

    pub(crate) fn timeout() -> Error {
        Error::new(Kind::Timeout, Some(TimedOut))
    }
}

impl Error {
    /// Returns a possible URI related to this error.
    pub fn uri(&self) -> Option<&Uri> {
        self.inner.uri.as_ref()
    }

    /// Add a URI related to this error (overwriting any existing).
    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.inner.uri = Some(uri);
        self
    }

    /// Strip the related URI from this error (if, for example, it contains
    /// sensitive information).
    pub fn without_uri(mut self) -> Self {
        self.inner.uri = None;
        self
    }

    /// Returns true if the error came from a caller contract violation.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the error is related to connection establishment,
    /// protocol negotiation, a transport reset or a GOAWAY.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the peer closed the connection mid-exchange.
    pub fn is_closed_connection(&self) -> bool {
        matches!(self.inner.kind, Kind::ClosedConnection)
    }

    /// Returns true if a pooled connection could not be acquired, either
    /// because the pool and its waiting queue are at capacity or because the
    /// pool was closed.
    pub fn is_pool_acquire(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolAcquire)
    }

    /// Returns true if a write was rejected because the outbound buffer was
    /// already at its high-water mark.
    pub fn is_write_buffer_full(&self) -> bool {
        matches!(self.inner.kind, Kind::WriteBufferFull)
    }

    /// Returns true if a response declared or accumulated more content than
    /// the configured maximum.
    pub fn is_content_over_sized(&self) -> bool {
        matches!(self.inner.kind, Kind::ContentOverSized)
    }

    /// Returns true if malformed wire data was encountered.
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }

    /// Returns true if a connection ran out of HTTP/2 stream ids.
    pub fn is_stream_id_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::StreamIdExhausted)
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout) {
            return true;
        }

        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns true if the error is related to a connection reset.
    pub fn is_connection_reset(&self) -> bool {
        let mut source = self.source();

        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::ConnectionReset {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("courier::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref uri) = self.inner.uri {
            builder.field("uri", uri);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Io => f.write_str("i/o error")?,
            Kind::Connect => f.write_str("connection error")?,
            Kind::ClosedConnection => f.write_str("connection closed before message completed")?,
            Kind::PoolAcquire => f.write_str("error acquiring pooled connection")?,
            Kind::WriteBufferFull => f.write_str("write buffer is full")?,
            Kind::ContentOverSized => f.write_str("response content over sized")?,
            Kind::Decode => f.write_str("error decoding wire data")?,
            Kind::StreamIdExhausted => f.write_str("http2 stream ids exhausted")?,
            Kind::Timeout => f.write_str("operation timed out")?,
        };

        if let Some(uri) = &self.inner.uri {
            write!(f, " for uri ({uri})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}
