use std::{fmt, sync::Arc, time::Duration};

use crate::{
    connect::TlsConnector,
    dns::{RemoteAddress, Resolve},
};

// Window defaults sized for the common non-constrained case; the protocol
// default of 64kb is too limiting for throughput.
const DEFAULT_CONN_WINDOW: u32 = 1024 * 1024 * 5; // 5mb
const DEFAULT_STREAM_WINDOW: u32 = 1024 * 1024 * 2; // 2mb
const DEFAULT_WRITE_BUFFER_LIMIT: usize = 1024 * 1024; // 1mb
const DEFAULT_MAX_CONTENT_LENGTH: u64 = 4 * 1024 * 1024; // 4mb

/// Per-address connection pool options.
///
/// One immutable value per address: the client-wide defaults apply unless a
/// [`pool_options_provider`](TransportConfigBuilder::pool_options_provider)
/// overrides them for a given address.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub(crate) size: usize,
    pub(crate) waiting_queue_length: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) idle_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            size: 64,
            waiting_queue_length: 128,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

impl PoolOptions {
    /// Creates options with the default values.
    pub fn new() -> PoolOptions {
        PoolOptions::default()
    }

    /// Maximum number of live connections in the pool.
    #[inline]
    pub fn size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    /// Maximum number of acquisitions allowed to queue while the pool is at
    /// capacity. Beyond this, acquisition fails immediately.
    #[inline]
    pub fn waiting_queue_length(mut self, len: usize) -> Self {
        self.waiting_queue_length = len;
        self
    }

    /// Bound on establishing (or waiting for) a pooled connection.
    #[inline]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Default read timeout armed once a request has been written.
    #[inline]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// How long an idle connection may sit in the pool before being
    /// discarded on the next acquisition. `None` disables the check.
    #[inline]
    pub fn idle_timeout<D>(mut self, timeout: D) -> Self
    where
        D: Into<Option<Duration>>,
    {
        self.idle_timeout = timeout.into();
        self
    }
}

type PoolOptionsProvider = dyn Fn(&RemoteAddress) -> Option<PoolOptions> + Send + Sync;

/// Configuration of the transport.
#[derive(Clone)]
pub struct TransportConfig {
    pub(crate) pool: PoolOptions,
    pub(crate) pool_overrides: Option<Arc<PoolOptionsProvider>>,
    pub(crate) max_content_length: u64,
    pub(crate) write_buffer_limit: usize,
    pub(crate) keep_alive: bool,
    pub(crate) http2_prior_knowledge: bool,
    pub(crate) h2c_upgrade: bool,
    pub(crate) http1_max_headers: usize,
    pub(crate) http2_initial_stream_window_size: u32,
    pub(crate) http2_initial_connection_window_size: u32,
    pub(crate) http2_max_frame_size: Option<u32>,
    pub(crate) resolver: Option<Arc<dyn Resolve>>,
    pub(crate) tls: Option<Arc<dyn TlsConnector>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            pool: PoolOptions::default(),
            pool_overrides: None,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            write_buffer_limit: DEFAULT_WRITE_BUFFER_LIMIT,
            keep_alive: true,
            http2_prior_knowledge: false,
            h2c_upgrade: false,
            http1_max_headers: 100,
            http2_initial_stream_window_size: DEFAULT_STREAM_WINDOW,
            http2_initial_connection_window_size: DEFAULT_CONN_WINDOW,
            http2_max_frame_size: None,
            resolver: None,
            tls: None,
        }
    }
}

impl TransportConfig {
    /// Creates a builder to configure the transport.
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder {
            config: TransportConfig::default(),
        }
    }

    pub(crate) fn options_for(&self, addr: &RemoteAddress) -> PoolOptions {
        if let Some(provider) = &self.pool_overrides {
            if let Some(options) = provider(addr) {
                return options;
            }
        }
        self.pool.clone()
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("pool", &self.pool)
            .field("max_content_length", &self.max_content_length)
            .field("keep_alive", &self.keep_alive)
            .field("http2_prior_knowledge", &self.http2_prior_knowledge)
            .field("h2c_upgrade", &self.h2c_upgrade)
            .finish()
    }
}

/// A builder for [`TransportConfig`].
#[must_use]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Client-wide default pool options.
    #[inline]
    pub fn pool_options(mut self, options: PoolOptions) -> Self {
        self.config.pool = options;
        self
    }

    /// Per-address pool option overrides. Returning `None` for an address
    /// falls back to the client-wide defaults.
    #[inline]
    pub fn pool_options_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn(&RemoteAddress) -> Option<PoolOptions> + Send + Sync + 'static,
    {
        self.config.pool_overrides = Some(Arc::new(provider));
        self
    }

    /// Upper bound on a response's declared or accumulated content length.
    ///
    /// Default is 4mb.
    #[inline]
    pub fn max_content_length(mut self, max: u64) -> Self {
        self.config.max_content_length = max;
        self
    }

    /// High-water mark for outbound buffered bytes: caps the HTTP/2 send
    /// buffer per stream, and is the natural bound to pass to
    /// [`Body::segmented`](crate::Body::segmented).
    ///
    /// Default is 1mb.
    #[inline]
    pub fn write_buffer_limit(mut self, limit: usize) -> Self {
        self.config.write_buffer_limit = limit.max(1);
        self
    }

    /// Whether connections are kept alive and pooled after a completed
    /// exchange. When disabled, every request uses an ephemeral single-use
    /// pool.
    ///
    /// Default is `true`.
    #[inline]
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.config.keep_alive = enabled;
        self
    }

    /// Speak HTTP/2 directly on plaintext connections (prior knowledge),
    /// without an `Upgrade: h2c` exchange.
    ///
    /// Default is `false`.
    #[inline]
    pub fn http2_prior_knowledge(mut self, enabled: bool) -> Self {
        self.config.http2_prior_knowledge = enabled;
        self
    }

    /// Probe plaintext connections with an `Upgrade: h2c` header exchange on
    /// the first request. A `101 Switching Protocols` reply switches the
    /// address to HTTP/2; any other reply is the real response on HTTP/1.1.
    ///
    /// Default is `false`.
    #[inline]
    pub fn h2c_upgrade(mut self, enabled: bool) -> Self {
        self.config.h2c_upgrade = enabled;
        self
    }

    /// Maximum number of headers accepted in an HTTP/1.1 response head.
    ///
    /// Default is 100.
    #[inline]
    pub fn http1_max_headers(mut self, max: usize) -> Self {
        self.config.http1_max_headers = max.clamp(1, 1024);
        self
    }

    /// HTTP/2 initial stream-level flow control window.
    #[inline]
    pub fn http2_initial_stream_window_size(mut self, size: u32) -> Self {
        self.config.http2_initial_stream_window_size = size;
        self
    }

    /// HTTP/2 initial connection-level flow control window.
    #[inline]
    pub fn http2_initial_connection_window_size(mut self, size: u32) -> Self {
        self.config.http2_initial_connection_window_size = size;
        self
    }

    /// HTTP/2 maximum frame size.
    #[inline]
    pub fn http2_max_frame_size<S>(mut self, size: S) -> Self
    where
        S: Into<Option<u32>>,
    {
        self.config.http2_max_frame_size = size.into();
        self
    }

    /// Use a custom DNS resolver instead of the default `getaddrinfo` one.
    #[inline]
    pub fn resolver<R>(mut self, resolver: R) -> Self
    where
        R: Resolve + 'static,
    {
        self.config.resolver = Some(Arc::new(resolver));
        self
    }

    /// Use a custom TLS connector factory instead of the default
    /// rustls-based one.
    #[inline]
    pub fn tls_connector<T>(mut self, tls: T) -> Self
    where
        T: TlsConnector + 'static,
    {
        self.config.tls = Some(Arc::new(tls));
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> TransportConfig {
        self.config
    }
}
