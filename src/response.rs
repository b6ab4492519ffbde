use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

use crate::error::BoxError;

/// A completed response.
///
/// Unless a [`ResponseSink`] was installed on the request context, the body
/// has been accumulated here in full, bounded by the configured maximum
/// content length.
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) trailers: Option<HeaderMap>,
}

impl Response {
    /// The response status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The negotiated HTTP version the response arrived on.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The accumulated response body. Empty when a sink consumed the body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consumes the response, returning the body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Trailer headers, when the peer sent any.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .finish()
    }
}

/// A streaming consumer of response events.
///
/// Installing a sink on the request context forwards body data to it instead
/// of accumulating it on the [`Response`]. Any `Err` returned from a sink
/// callback fails the request and closes the owning connection, so a
/// misbehaving consumer cannot corrupt the connection's remaining state.
#[allow(unused_variables)]
pub trait ResponseSink: Send {
    /// The status line and headers arrived.
    fn on_head(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<(), BoxError> {
        Ok(())
    }

    /// One chunk of body data arrived.
    fn on_data(&mut self, chunk: Bytes) -> Result<(), BoxError>;

    /// Trailer headers arrived. Called at most once, before `on_end`.
    fn on_trailers(&mut self, trailers: &HeaderMap) -> Result<(), BoxError> {
        Ok(())
    }

    /// The response completed.
    fn on_end(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}
