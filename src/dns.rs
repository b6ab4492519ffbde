//! DNS resolution.

use std::{fmt, future::Future, net::SocketAddr, pin::Pin, sync::Arc};

use log::trace;

use crate::error::{BoxError, Error};

/// The resolved `host:port` identity of a remote peer.
///
/// Used as the connection-pool key; equality and hashing are by value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    host: String,
    port: u16,
}

impl RemoteAddress {
    /// Creates an address from a host name and port.
    pub fn new(host: impl Into<String>, port: u16) -> RemoteAddress {
        RemoteAddress {
            host: host.into(),
            port,
        }
    }

    /// The host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A host name to be resolved.
#[derive(Clone, Debug)]
pub struct Name {
    host: String,
}

impl Name {
    pub(crate) fn new(host: impl Into<String>) -> Name {
        Name { host: host.into() }
    }

    /// The host name to resolve.
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)
    }
}

/// Alias for an `Iterator` trait object over `SocketAddr`.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

/// Alias for the `Future` type returned by a resolver.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, BoxError>> + Send>>;

/// Trait for customizing DNS resolution.
pub trait Resolve: Send + Sync {
    /// Performs DNS resolution on a `Name`.
    ///
    /// The return type is a future containing an iterator of `SocketAddr`.
    /// The port of the returned addresses is ignored; the transport applies
    /// the target port itself.
    fn resolve(&self, name: Name) -> Resolving;
}

/// A resolver using blocking `getaddrinfo` calls on a backing thread pool.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Creates a new `GaiResolver`.
    pub fn new() -> GaiResolver {
        GaiResolver { _priv: () }
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.host;
            let addrs = tokio::task::spawn_blocking(move || {
                std::net::ToSocketAddrs::to_socket_addrs(&(host.as_str(), 0u16))
            })
            .await
            .map_err(|join| Box::new(join) as BoxError)?
            .map_err(|io| Box::new(io) as BoxError)?;
            Ok(Box::new(addrs) as Addrs)
        })
    }
}

#[derive(Clone)]
pub(crate) struct DynResolver {
    resolver: Arc<dyn Resolve>,
}

impl DynResolver {
    pub(crate) fn new(resolver: Arc<dyn Resolve>) -> Self {
        DynResolver { resolver }
    }

    pub(crate) fn gai() -> Self {
        DynResolver::new(Arc::new(GaiResolver::new()))
    }

    /// Resolves the address to dialable socket addresses, with the target
    /// port applied.
    pub(crate) async fn resolve(&self, addr: &RemoteAddress) -> Result<Vec<SocketAddr>, Error> {
        // Fast path: a literal IP needs no lookup.
        if let Ok(ip) = addr.host().parse() {
            return Ok(vec![SocketAddr::new(ip, addr.port())]);
        }

        trace!("resolving host={:?}", addr.host());
        let addrs = self
            .resolver
            .resolve(Name::new(addr.host()))
            .await
            .map_err(Error::connect)?;

        let addrs: Vec<SocketAddr> = addrs
            .map(|mut sa| {
                sa.set_port(addr.port());
                sa
            })
            .collect();

        if addrs.is_empty() {
            return Err(Error::connect(format!(
                "dns resolution of {} returned no addresses",
                addr.host()
            )));
        }

        Ok(addrs)
    }
}

impl fmt::Debug for DynResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynResolver").finish()
    }
}
