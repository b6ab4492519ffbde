//! The transceiver: per-request orchestration.
//!
//! For each outbound request: resolve the target identity, acquire a pooled
//! connection (negotiated on creation), select the request writer for the
//! body kind, run the protocol adapter's exchange, and resolve the caller's
//! future when the response handle completes. Capacity failures, write
//! failures, timeouts and protocol errors each take their prescribed
//! release-or-close path; the pooled connection is returned or closed
//! exactly once on every one of them.

use std::{fmt, sync::Arc, time::Duration};

use http::{header, Method};
use log::{debug, trace};

use crate::{
    config::{PoolOptions, TransportConfig},
    conn::{ConnInner, Protocol},
    connect::Connector,
    dns::RemoteAddress,
    error::{Error, Result},
    listener::{NoopListener, TransportListener},
    pool::{PoolMetrics, PoolRegistry},
    proto::{self, h1, h2},
    request::{Request, RequestContext},
    response::Response,
    writer::{self, BodyPlan},
};

/// A connection that ran out of stream ids (or turned out broken before the
/// write) is replaced and the request retried on a fresh one, this many
/// times in total.
const MAX_DISPATCH_ATTEMPTS: usize = 3;

struct Inner {
    config: Arc<TransportConfig>,
    connector: Arc<Connector>,
    pools: PoolRegistry,
}

/// The asynchronous HTTP transport entrypoint.
///
/// Cheap to clone; clones share the connection pools.
#[derive(Clone)]
pub struct Transceiver {
    inner: Arc<Inner>,
}

impl Transceiver {
    /// Builds a transceiver from the given configuration.
    pub fn new(config: TransportConfig) -> Transceiver {
        let config = Arc::new(config);
        let connector = Arc::new(Connector::new(config.clone()));
        let pools = PoolRegistry::new(config.clone(), connector.clone());
        Transceiver {
            inner: Arc::new(Inner {
                config,
                connector,
                pools,
            }),
        }
    }

    /// Builds a transceiver with the default configuration.
    pub fn default_config() -> Transceiver {
        Transceiver::new(TransportConfig::default())
    }

    /// Shuts the transport down: every pool is closed, in-flight exchanges
    /// finish, new acquisitions fail fast.
    pub fn close(&self) {
        self.inner.pools.close();
    }

    /// Point-in-time pool metrics for an address, when a pool exists.
    pub fn pool_metrics(&self, addr: &RemoteAddress) -> Option<PoolMetrics> {
        self.inner.pools.metrics(addr)
    }

    /// Applies new pool options for one address.
    ///
    /// The address's pool is replaced: exchanges in flight on the old pool
    /// finish and their connections drain, while new acquisitions go to a
    /// pool built with `options`.
    pub fn update_pool_options(
        &self,
        addr: &RemoteAddress,
        ssl: bool,
        options: PoolOptions,
    ) -> Result<()> {
        self.inner
            .pools
            .update_options(addr.clone(), ssl, options)
    }

    /// Sends a request with default context and no listener.
    pub async fn send(&self, request: Request) -> Result<Response> {
        self.handle(request, RequestContext::new(), Arc::new(NoopListener), None)
            .await
    }

    /// Drives one request through the transport.
    ///
    /// This is the single entrypoint interceptor chains wrap: the
    /// transceiver itself is unaware of retry or redirect semantics.
    /// `read_timeout` overrides both the context's and the pool's default.
    pub async fn handle(
        &self,
        request: Request,
        mut ctx: RequestContext,
        listener: Arc<dyn TransportListener>,
        read_timeout: Option<Duration>,
    ) -> Result<Response> {
        let (method, uri, mut headers, body) = request.into_parts();

        let ssl = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => {
                return Err(Error::builder(
                    "request uri must be absolute with an http or https scheme",
                )
                .with_uri(uri));
            }
        };
        let host = match uri.host() {
            Some(host) => host,
            None => return Err(Error::builder("request uri has no host").with_uri(uri)),
        };
        let port = uri.port_u16().unwrap_or(if ssl { 443 } else { 80 });
        let addr = RemoteAddress::new(host, port);

        let keep_alive = self.inner.config.keep_alive && !proto::connection_close(&headers);
        let expect_continue = ctx.expect_continue || wants_continue(&headers);

        // Select the writer up front; a missing file or a broken form fails
        // here, before any connection is touched.
        let mut plan = Some(
            writer::prepare(&method, &mut headers, body)
                .await
                .map_err(|e| e.with_uri(uri.clone()))?,
        );

        let mut attempt = 0;
        loop {
            attempt += 1;

            listener.on_pool_attempt(&addr);
            let pool = match self.inner.pools.get_or_create(ssl, keep_alive, &addr) {
                Ok(pool) => pool,
                Err(e) => {
                    listener.on_pool_failed(&addr, &e);
                    return Err(e.with_uri(uri));
                }
            };
            let mut pooled = match pool.acquire(listener.as_ref()).await {
                Ok(pooled) => {
                    listener.on_pool_acquired(&addr);
                    pooled
                }
                Err(e) => {
                    listener.on_pool_failed(&addr, &e);
                    return Err(e.with_uri(uri));
                }
            };

            let effective_timeout = read_timeout
                .or(ctx.read_timeout)
                .unwrap_or(pool.options().read_timeout);

            // Take the body plan for this attempt, keeping a replayable copy
            // when the plan supports it.
            let attempt_plan = {
                let replay = plan.as_ref().and_then(BodyPlan::retry_clone);
                match replay {
                    Some(clone) => clone,
                    None => match plan.take() {
                        Some(original) => original,
                        None => {
                            // A caller-driven body was consumed by a failed
                            // attempt; it cannot be replayed.
                            return Err(Error::closed_connection(
                                "request body consumed by a failed dispatch",
                            )
                            .with_uri(uri));
                        }
                    },
                }
            };

            match pooled.conn_mut().protocol() {
                Protocol::Http1 => {
                    let probe = self.should_probe_h2c(&method, ssl, expect_continue, &addr)
                        && plan.is_some();
                    let dispatch = h1::H1Dispatch {
                        method: method.clone(),
                        uri: uri.clone(),
                        headers: headers.clone(),
                        plan: attempt_plan,
                        ssl,
                        expect_continue,
                        on_continue: ctx.on_continue.take(),
                        upgrade_probe: probe,
                        max_content_length: self.inner.config.max_content_length,
                        max_headers: self.inner.config.http1_max_headers,
                        read_timeout: effective_timeout,
                        sink: ctx.sink.take(),
                        listener: listener.as_ref(),
                    };

                    let conn = pooled.conn_mut();
                    let h1_conn = match &mut conn.inner {
                        ConnInner::H1(h1_conn) => h1_conn,
                        ConnInner::H2(_) => unreachable!("protocol checked above"),
                    };
                    let (outcome, rx) = match h1::dispatch(h1_conn, dispatch).await {
                        Ok(pair) => pair,
                        Err(e) => {
                            // Nothing was written; the connection is clean.
                            drop(pooled);
                            return Err(e.with_uri(uri));
                        }
                    };

                    match outcome {
                        h1::H1Outcome::Complete { reuse } => {
                            if !reuse || !keep_alive {
                                pooled.mark_not_reusable();
                            }
                            drop(pooled);
                            return self.finish(rx, &uri, listener.as_ref()).await;
                        }
                        h1::H1Outcome::UpgradedH2c { sink } => {
                            debug!("{addr} switched protocols, replaying over h2c");
                            ctx.sink = sink;
                            self.inner.connector.mark_h2c(&addr);
                            pooled.mark_not_reusable();
                            drop(pooled);
                            if attempt >= MAX_DISPATCH_ATTEMPTS {
                                return Err(Error::connect(
                                    "h2c upgrade loop exceeded dispatch attempts",
                                )
                                .with_uri(uri));
                            }
                            continue;
                        }
                    }
                }
                Protocol::Http2 => {
                    let h2_conn = match &pooled.conn().inner {
                        ConnInner::H2(h2_conn) => h2_conn.clone(),
                        ConnInner::H1(_) => unreachable!("protocol checked above"),
                    };

                    // An id-exhausted connection is released without reuse
                    // and the acquisition retried on a fresh one.
                    if !h2_conn.has_capacity() {
                        trace!("stream ids exhausted on connection to {addr}");
                        pooled.mark_not_reusable();
                        drop(pooled);
                        if attempt >= MAX_DISPATCH_ATTEMPTS {
                            return Err(Error::stream_id_exhausted().with_uri(uri));
                        }
                        continue;
                    }

                    let dispatch = h2::H2Dispatch {
                        method: method.clone(),
                        uri: uri.clone(),
                        headers: headers.clone(),
                        plan: attempt_plan,
                        max_content_length: self.inner.config.max_content_length,
                        read_timeout: effective_timeout,
                        sink: ctx.sink.take(),
                        listener: listener.as_ref(),
                    };

                    let (reuse, rx) = match h2::dispatch(&h2_conn, dispatch).await {
                        Ok(pair) => pair,
                        Err(e) => {
                            pooled.mark_not_reusable();
                            drop(pooled);
                            return Err(e.with_uri(uri));
                        }
                    };

                    if !reuse || !keep_alive {
                        pooled.mark_not_reusable();
                    }
                    drop(pooled);
                    return self.finish(rx, &uri, listener.as_ref()).await;
                }
            }
        }
    }

    fn should_probe_h2c(
        &self,
        method: &Method,
        ssl: bool,
        expect_continue: bool,
        addr: &RemoteAddress,
    ) -> bool {
        // The probe replays the request on 101, so only methods that are
        // safe to re-run qualify.
        self.inner.config.h2c_upgrade
            && !ssl
            && !expect_continue
            && !self.inner.connector.is_h2c(addr)
            && (*method == Method::GET
                || *method == Method::HEAD
                || *method == Method::OPTIONS
                || *method == Method::TRACE)
    }

    async fn finish(
        &self,
        rx: proto::handle::ResponseReceiver,
        uri: &http::Uri,
        listener: &dyn TransportListener,
    ) -> Result<Response> {
        let result = rx
            .await
            .unwrap_or_else(|_| Err(Error::closed_connection("response handle dropped")));
        match result {
            Ok(response) => {
                listener.on_completed();
                Ok(response)
            }
            Err(e) => {
                let e = e.with_uri(uri.clone());
                listener.on_error(&e);
                Err(e)
            }
        }
    }
}

fn wants_continue(headers: &http::HeaderMap) -> bool {
    headers
        .get(header::EXPECT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false)
}

impl fmt::Debug for Transceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transceiver")
            .field("config", &self.inner.config)
            .finish()
    }
}
