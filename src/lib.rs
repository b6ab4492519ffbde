//! # courier
//!
//! `courier` is an asynchronous HTTP client **transport**: the layer that
//! owns connections and moves requests over them.
//!
//! - Bounded, address-keyed connection pooling with a bounded wait queue
//!   (admission control: excess load is rejected, never queued unboundedly)
//! - HTTP/1.1 and HTTP/2 with per-connection protocol negotiation (TLS ALPN,
//!   plaintext prior knowledge, `Upgrade: h2c` probing)
//! - Request/response correlation through a per-connection handle registry
//!   (HTTP/2 stream ids are the request ids) and an explicit response state
//!   machine with bounded-content-length enforcement
//! - A request-writer family for plain, file, multipart and caller-driven
//!   bodies, with `Expect: 100-continue` coordination and write
//!   backpressure
//!
//! It is deliberately **not** a full HTTP client: no redirects, retries,
//! cookies or caching. Those belong to interceptor chains wrapping the
//! [`Transceiver`], which consumes the single
//! [`handle`](Transceiver::handle) entrypoint.
//!
//! ## Sending a request
//!
//! ```rust,no_run
//! use courier::{Body, Method, Request, Transceiver};
//!
//! # async fn run() -> courier::Result<()> {
//! let transport = Transceiver::default_config();
//!
//! let request = Request::new(Method::POST, "http://example.com/upload".parse().unwrap())
//!     .body(Body::full("hello"));
//! let response = transport.send(request).await?;
//!
//! assert!(response.status().is_success());
//! # Ok(())
//! # }
//! ```

pub use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};

mod body;
mod config;
mod conn;
mod connect;
mod error;
mod pool;
mod proto;
mod request;
mod response;
mod transceiver;
mod writer;

pub mod dns;
pub mod listener;
pub mod multipart;

pub use self::body::{Body, SegmentSender};
pub use self::config::{PoolOptions, TransportConfig, TransportConfigBuilder};
pub use self::connect::{TlsConnector, TlsHandshaking, TlsStream};
pub use self::dns::{GaiResolver, Name, RemoteAddress, Resolve};
pub use self::error::{BoxError, Error, Result};
pub use self::listener::{NoopListener, TransportListener};
pub use self::pool::PoolMetrics;
pub use self::request::{Request, RequestContext};
pub use self::response::{Response, ResponseSink};
pub use self::transceiver::Transceiver;

fn _assert_impls() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    fn assert_clone<T: Clone>() {}

    assert_send::<Transceiver>();
    assert_sync::<Transceiver>();
    assert_clone::<Transceiver>();

    assert_send::<Request>();
    assert_send::<Response>();

    assert_send::<Error>();
    assert_sync::<Error>();
}
