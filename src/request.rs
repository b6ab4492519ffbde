use std::{fmt, time::Duration};

use http::{HeaderMap, Method, Uri};

use crate::{body::Body, response::ResponseSink};

/// An outbound request, ready to be handed to the transceiver.
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
}

impl Request {
    /// Constructs a new request.
    pub fn new(method: Method, uri: Uri) -> Request {
        Request {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Body::empty(),
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The target URI. Must be in absolute form; the authority decides the
    /// pool the request is routed through.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Replaces the request body.
    pub fn body(mut self, body: impl Into<Body>) -> Request {
        self.body = body.into();
        self
    }

    pub(crate) fn into_parts(self) -> (Method, Uri, HeaderMap, Body) {
        (self.method, self.uri, self.headers, self.body)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Per-request mutable state carried through the transceiver.
#[derive(Default)]
pub struct RequestContext {
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) expect_continue: bool,
    pub(crate) on_continue: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) sink: Option<Box<dyn ResponseSink>>,
    retries_left: u32,
}

impl RequestContext {
    /// Creates an empty context.
    pub fn new() -> RequestContext {
        RequestContext::default()
    }

    /// Overrides the read timeout for this request.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Defers the body behind an `Expect: 100-continue` exchange.
    pub fn expect_continue(mut self) -> Self {
        self.expect_continue = true;
        self
    }

    /// Stores a callback invoked (at most once) when the server answers the
    /// expect-continue exchange with `100 Continue`, before any body bytes
    /// are written.
    pub fn on_continue<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_continue = Some(Box::new(callback));
        self
    }

    /// Streams the response body into `sink` instead of accumulating it.
    pub fn response_sink<S>(mut self, sink: S) -> Self
    where
        S: ResponseSink + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Remaining retry/redirect budget. The transport itself never consumes
    /// this; interceptor chains wrapping the transceiver do.
    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    /// Sets the retry/redirect budget for wrapping interceptors.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_left = retries;
        self
    }

    /// Decrements the retry/redirect budget, returning whether budget was
    /// available.
    pub fn consume_retry(&mut self) -> bool {
        if self.retries_left == 0 {
            return false;
        }
        self.retries_left -= 1;
        true
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("read_timeout", &self.read_timeout)
            .field("expect_continue", &self.expect_continue)
            .field("has_continue_callback", &self.on_continue.is_some())
            .field("has_sink", &self.sink.is_some())
            .field("retries_left", &self.retries_left)
            .finish()
    }
}
