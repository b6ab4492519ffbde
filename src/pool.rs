//! Bounded, address-keyed connection pooling.
//!
//! One [`Pool`] per remote address, created lazily by the [`PoolRegistry`].
//! Acquisition reuses an idle connection, opens a new one up to the pool
//! size, or queues behind the wait queue; anything beyond that fails
//! immediately. This is the transport's admission-control boundary: excess
//! load is rejected, never queued unboundedly.
//!
//! A checked-out connection travels inside a [`Pooled`] guard, which
//! guarantees the release-or-close-exactly-once discipline on every exit
//! path.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex},
    time::Instant,
};

use log::{debug, trace};
use tokio::{sync::oneshot, time::timeout};

use crate::{
    config::{PoolOptions, TransportConfig},
    conn::Connection,
    connect::Connector,
    dns::RemoteAddress,
    error::{Error, TimedOut},
    listener::TransportListener,
};

/// Point-in-time metrics for one address's pool.
#[derive(Clone, Copy, Debug)]
pub struct PoolMetrics {
    /// Connections currently checked out.
    pub active: usize,
    /// Configured maximum pool size.
    pub max_size: usize,
    /// Acquisitions currently queued.
    pub pending_acquires: usize,
    /// Configured wait-queue bound.
    pub max_pending_acquires: usize,
}

enum Waken {
    /// A released connection, handed over directly.
    Conn(Connection),
    /// A slot freed up; re-run the acquisition routing.
    Retry,
}

struct Idle {
    conn: Connection,
    since: Instant,
}

struct PoolState {
    idle: Vec<Idle>,
    /// Live plus currently-connecting connections.
    count: usize,
    /// Connections checked out to requests.
    active: usize,
    waiters: VecDeque<oneshot::Sender<Waken>>,
    closed: bool,
}

struct PoolShared {
    addr: RemoteAddress,
    ssl: bool,
    options: PoolOptions,
    connector: Arc<Connector>,
    state: Mutex<PoolState>,
}

/// A bounded connection pool for one remote address.
#[derive(Clone)]
pub(crate) struct Pool {
    shared: Arc<PoolShared>,
}

enum Route {
    /// An idle connection (or a shared clone of a multiplexed one).
    Ready(Connection, bool),
    Connect,
    Wait(oneshot::Receiver<Waken>),
}

impl Pool {
    pub(crate) fn new(
        addr: RemoteAddress,
        ssl: bool,
        options: PoolOptions,
        connector: Arc<Connector>,
    ) -> Pool {
        Pool {
            shared: Arc::new(PoolShared {
                addr,
                ssl,
                options,
                connector,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    count: 0,
                    active: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    pub(crate) fn options(&self) -> &PoolOptions {
        &self.shared.options
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.state.lock().expect("pool state poisoned").closed
    }

    pub(crate) fn metrics(&self) -> PoolMetrics {
        let state = self.shared.state.lock().expect("pool state poisoned");
        PoolMetrics {
            active: state.active,
            max_size: self.shared.options.size,
            pending_acquires: state.waiters.len(),
            max_pending_acquires: self.shared.options.waiting_queue_length,
        }
    }

    /// Acquires a connection, bounded by the pool's connect timeout.
    ///
    /// Either reuses an idle connection, opens a new one within the size
    /// bound, or waits in the bounded queue. A pool at capacity with a full
    /// queue fails immediately, without blocking.
    pub(crate) async fn acquire(&self, listener: &dyn TransportListener) -> Result<Pooled, Error> {
        match timeout(self.shared.options.connect_timeout, self.acquire_inner(listener)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::pool_acquire(TimedOut)),
        }
    }

    async fn acquire_inner(&self, listener: &dyn TransportListener) -> Result<Pooled, Error> {
        loop {
            let route = {
                let mut state = self.shared.state.lock().expect("pool state poisoned");
                if state.closed {
                    return Err(Error::pool_acquire("pool is closed"));
                }

                let mut ready = None;
                while let Some(idle) = state.idle.pop() {
                    let expired = self
                        .shared
                        .options
                        .idle_timeout
                        .map(|t| idle.since.elapsed() > t)
                        .unwrap_or(false);
                    if expired || !idle.conn.is_open() {
                        trace!("evicting stale idle connection to {}", self.shared.addr);
                        state.count -= 1;
                        continue;
                    }
                    match idle.conn.share() {
                        Some(clone) => {
                            // A multiplexed connection stays pooled while
                            // its clones are out.
                            state.idle.push(idle);
                            ready = Some((clone, true));
                        }
                        None => ready = Some((idle.conn, false)),
                    }
                    break;
                }

                match ready {
                    Some((conn, shared)) => {
                        state.active += 1;
                        Route::Ready(conn, shared)
                    }
                    None if state.count < self.shared.options.size => {
                        state.count += 1;
                        Route::Connect
                    }
                    None if state.waiters.len() < self.shared.options.waiting_queue_length => {
                        let (tx, rx) = oneshot::channel();
                        state.waiters.push_back(tx);
                        Route::Wait(rx)
                    }
                    None => {
                        return Err(Error::pool_acquire(
                            "pool is at capacity and the waiting queue is full",
                        ));
                    }
                }
            };

            match route {
                Route::Ready(conn, shared) => {
                    listener.on_connection_acquired(&self.shared.addr, true);
                    return Ok(self.pooled(conn, shared));
                }
                Route::Connect => {
                    listener.on_connection_attempt(&self.shared.addr);
                    match self
                        .shared
                        .connector
                        .connect(&self.shared.addr, self.shared.ssl)
                        .await
                    {
                        Ok(conn) => {
                            let mut state =
                                self.shared.state.lock().expect("pool state poisoned");
                            if state.closed {
                                state.count -= 1;
                                drop(state);
                                return Err(Error::pool_acquire("pool is closed"));
                            }
                            state.active += 1;
                            drop(state);
                            listener.on_connection_acquired(&self.shared.addr, false);
                            return Ok(self.pooled(conn, false));
                        }
                        Err(e) => {
                            listener.on_connection_failed(&self.shared.addr, &e);
                            let mut state =
                                self.shared.state.lock().expect("pool state poisoned");
                            state.count -= 1;
                            // The freed slot can serve a queued acquisition.
                            if let Some(tx) = state.waiters.pop_front() {
                                let _ = tx.send(Waken::Retry);
                            }
                            return Err(e);
                        }
                    }
                }
                Route::Wait(rx) => {
                    trace!("pool for {} at capacity, queueing", self.shared.addr);
                    match rx.await {
                        Ok(Waken::Conn(conn)) => {
                            listener.on_connection_acquired(&self.shared.addr, true);
                            return Ok(self.pooled(conn, false));
                        }
                        Ok(Waken::Retry) => continue,
                        Err(_) => return Err(Error::pool_acquire("pool is closed")),
                    }
                }
            }
        }
    }

    fn pooled(&self, conn: Connection, shared: bool) -> Pooled {
        Pooled {
            conn: Some(conn),
            pool: self.clone(),
            reusable: true,
            shared,
        }
    }

    /// Returns a connection to the pool, or closes it.
    ///
    /// A reusable connection is handed to a queued waiter or parked idle; a
    /// poisoned one is closed and evicted, freeing its slot for a waiter.
    /// `shared` marks a clone of a pooled multiplexed connection, which is
    /// not counted on its own.
    fn release(&self, conn: Connection, reusable: bool, shared: bool) {
        let mut state = self.shared.state.lock().expect("pool state poisoned");
        state.active = state.active.saturating_sub(1);

        if state.closed {
            if !shared {
                state.count -= 1;
            }
            drop(state);
            debug!("pool closed, dropping connection to {}", self.shared.addr);
            return;
        }

        if reusable && conn.is_open() {
            if shared {
                // The pooled original can serve a queued waiter right away.
                if let Some(tx) = state.waiters.pop_front() {
                    let _ = tx.send(Waken::Retry);
                }
                return;
            }
            if let Some(tx) = state.waiters.pop_front() {
                trace!("handing released connection to a queued waiter");
                state.active += 1;
                if let Err(waken) = tx.send(Waken::Conn(conn)) {
                    // The waiter gave up (timeout); park the connection.
                    state.active -= 1;
                    if let Waken::Conn(conn) = waken {
                        state.idle.push(Idle {
                            conn,
                            since: Instant::now(),
                        });
                    }
                }
                return;
            }
            trace!("pooling idle connection to {}", self.shared.addr);
            state.idle.push(Idle {
                conn,
                since: Instant::now(),
            });
            return;
        }

        // Closing. For a clone of a pooled multiplexed connection, evict
        // the original too (unless a sibling already did).
        if shared {
            let before = state.idle.len();
            state.idle.retain(|i| i.conn.id != conn.id);
            if state.idle.len() < before {
                state.count -= 1;
            }
        } else {
            state.count -= 1;
        }
        if let Some(tx) = state.waiters.pop_front() {
            let _ = tx.send(Waken::Retry);
        }
        drop(state);
        debug!("closing connection to {}", self.shared.addr);
    }

    /// Closes the pool: idle connections are dropped, queued waiters fail,
    /// and checked-out connections are closed on release.
    pub(crate) fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.shared.state.lock().expect("pool state poisoned");
            state.closed = true;
            state.count -= state.idle.len();
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        debug!(
            "closing pool for {} ({} idle, {} waiting)",
            self.shared.addr,
            idle.len(),
            waiters.len()
        );
        drop(idle);
        drop(waiters);
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metrics = self.metrics();
        f.debug_struct("Pool")
            .field("addr", &self.shared.addr)
            .field("metrics", &metrics)
            .finish()
    }
}

/// A checked-out pooled connection.
///
/// Dropping the guard releases the connection back to its pool, or closes
/// it when it was marked unusable; exactly one of the two happens, on every
/// exit path.
pub(crate) struct Pooled {
    conn: Option<Connection>,
    pool: Pool,
    reusable: bool,
    shared: bool,
}

impl Pooled {
    pub(crate) fn conn(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }

    /// The connection will be closed instead of released.
    pub(crate) fn mark_not_reusable(&mut self) {
        self.reusable = false;
    }
}

impl Drop for Pooled {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.reusable, self.shared);
        }
    }
}

impl fmt::Debug for Pooled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("conn", &self.conn)
            .field("reusable", &self.reusable)
            .finish()
    }
}

struct RegistryInner {
    pools: HashMap<RemoteAddress, Pool>,
    closed: bool,
}

/// The address-to-pool map.
///
/// Pools are created lazily on first acquisition for an address and closed
/// together on shutdown, after which every operation fails fast.
pub(crate) struct PoolRegistry {
    config: Arc<TransportConfig>,
    connector: Arc<Connector>,
    inner: Mutex<RegistryInner>,
}

impl PoolRegistry {
    pub(crate) fn new(config: Arc<TransportConfig>, connector: Arc<Connector>) -> PoolRegistry {
        PoolRegistry {
            config,
            connector,
            inner: Mutex::new(RegistryInner {
                pools: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Returns the pool for `addr`, creating it on first use. Creation is
    /// idempotent: concurrent callers for the same address get one pool.
    ///
    /// Non-keep-alive requests never share a pool; they get an ephemeral
    /// single-use pool that is not registered.
    pub(crate) fn get_or_create(
        &self,
        ssl: bool,
        keep_alive: bool,
        addr: &RemoteAddress,
    ) -> Result<Pool, Error> {
        let mut inner = self.inner.lock().expect("pool registry poisoned");
        if inner.closed {
            return Err(Error::pool_acquire("pool registry is closed"));
        }

        if !keep_alive {
            let options = self
                .config
                .options_for(addr)
                .size(1)
                .waiting_queue_length(0);
            return Ok(Pool::new(
                addr.clone(),
                ssl,
                options,
                self.connector.clone(),
            ));
        }

        if let Some(pool) = inner.pools.get(addr) {
            return Ok(pool.clone());
        }
        trace!("creating pool for {addr}");
        let pool = Pool::new(
            addr.clone(),
            ssl,
            self.config.options_for(addr),
            self.connector.clone(),
        );
        inner.pools.insert(addr.clone(), pool.clone());
        Ok(pool)
    }

    pub(crate) fn get_if_present(&self, addr: &RemoteAddress) -> Option<Pool> {
        let inner = self.inner.lock().expect("pool registry poisoned");
        inner.pools.get(addr).cloned()
    }

    /// Installs a pool for `addr`, draining and closing any replaced one.
    pub(crate) fn put(&self, addr: RemoteAddress, pool: Pool) -> Result<(), Error> {
        let replaced = {
            let mut inner = self.inner.lock().expect("pool registry poisoned");
            if inner.closed {
                return Err(Error::pool_acquire("pool registry is closed"));
            }
            inner.pools.insert(addr, pool)
        };
        if let Some(old) = replaced {
            old.close();
        }
        Ok(())
    }

    /// Applies new options for `addr` by replacing its pool. In-flight
    /// exchanges on the old pool finish; new acquisitions go to the new one.
    pub(crate) fn update_options(
        &self,
        addr: RemoteAddress,
        ssl: bool,
        options: PoolOptions,
    ) -> Result<(), Error> {
        let pool = Pool::new(addr.clone(), ssl, options, self.connector.clone());
        self.put(addr, pool)
    }

    pub(crate) fn metrics(&self, addr: &RemoteAddress) -> Option<PoolMetrics> {
        self.get_if_present(addr).map(|pool| pool.metrics())
    }

    /// Closes every pool. Existing connections finish their in-flight
    /// exchanges; new acquisitions and registry operations fail fast.
    pub(crate) fn close(&self) {
        let pools: Vec<Pool> = {
            let mut inner = self.inner.lock().expect("pool registry poisoned");
            inner.closed = true;
            inner.pools.drain().map(|(_, pool)| pool).collect()
        };
        debug!("closing {} pools", pools.len());
        for pool in pools {
            pool.close();
        }
    }
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry").finish()
    }
}
