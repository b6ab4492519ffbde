//! Lifecycle listener SPI.
//!
//! A [`TransportListener`] receives the lifecycle events of a single request
//! as it moves through the transport: pool acquisition, connection
//! establishment, the write phase and response completion. Implementations
//! are used for observability only; they cannot alter the exchange.

use http::StatusCode;

use crate::{dns::RemoteAddress, error::Error};

/// Observer of per-request transport lifecycle events.
///
/// All methods have empty default implementations, so implementors override
/// only what they care about. Methods are invoked from the request's own
/// task and must not block.
#[allow(unused_variables)]
pub trait TransportListener: Send + Sync {
    /// A pooled-connection acquisition is about to start.
    fn on_pool_attempt(&self, addr: &RemoteAddress) {}

    /// A pooled connection was acquired.
    fn on_pool_acquired(&self, addr: &RemoteAddress) {}

    /// Acquisition failed (capacity, queue overflow or pool closed).
    fn on_pool_failed(&self, addr: &RemoteAddress, error: &Error) {}

    /// A new transport connection is being established.
    fn on_connection_attempt(&self, addr: &RemoteAddress) {}

    /// A connection (new or reused) is ready for the request.
    fn on_connection_acquired(&self, addr: &RemoteAddress, reused: bool) {}

    /// Connection establishment or protocol negotiation failed.
    fn on_connection_failed(&self, addr: &RemoteAddress, error: &Error) {}

    /// The request is about to be written.
    fn on_write_attempt(&self) {}

    /// The request (headers and body) was fully flushed.
    fn on_write_done(&self) {}

    /// The request could not be written.
    fn on_write_failed(&self, error: &Error) {}

    /// The response status line and headers arrived.
    fn on_message_received(&self, status: StatusCode) {}

    /// The exchange completed successfully.
    fn on_completed(&self) {}

    /// The exchange failed.
    fn on_error(&self, error: &Error) {}
}

/// A listener that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;

impl TransportListener for NoopListener {}
