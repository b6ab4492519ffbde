//! Connection establishment and protocol negotiation.
//!
//! A [`Connector`] resolves the remote address, dials it, and negotiates the
//! application protocol for the new connection: ALPN on TLS (`h2` selects
//! the HTTP/2 adapter, anything else HTTP/1.1), prior-knowledge HTTP/2 on
//! plaintext when configured, or plain HTTP/1.1 otherwise. The `Upgrade:
//! h2c` probe itself rides on the first HTTP/1.1 request and is driven by
//! the transceiver; addresses that accept it are remembered here so later
//! connections go straight to prior knowledge.

use std::{
    collections::HashSet,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use log::{debug, trace};
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tokio::net::TcpStream;

use crate::{
    config::TransportConfig,
    conn::{Connection, MaybeTlsStream},
    dns::{DynResolver, RemoteAddress},
    error::{BoxError, Error},
    proto::h2,
};

/// The stream produced by a finished TLS handshake.
pub type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Alias for the `Future` type returned by a TLS connector: the encrypted
/// stream plus whether ALPN selected HTTP/2.
pub type TlsHandshaking = Pin<Box<dyn Future<Output = Result<(TlsStream, bool), BoxError>> + Send>>;

/// Factory producing TLS handshakes for new connections.
///
/// The default implementation is rustls-based with `webpki` roots; supply a
/// custom one for client certificates, pinning or alternative root stores.
pub trait TlsConnector: Send + Sync {
    /// Starts a client handshake on `io` for `host`. When `alpn_h2` is set,
    /// the handshake advertises `h2` ahead of `http/1.1`.
    fn connect(&self, host: &str, io: TcpStream, alpn_h2: bool) -> TlsHandshaking;
}

struct RustlsConnector {
    alpn: tokio_rustls::TlsConnector,
    http1: tokio_rustls::TlsConnector,
}

impl RustlsConnector {
    fn new() -> RustlsConnector {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let base = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let mut alpn = base.clone();
        alpn.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let mut http1 = base;
        http1.alpn_protocols = vec![b"http/1.1".to_vec()];

        RustlsConnector {
            alpn: tokio_rustls::TlsConnector::from(Arc::new(alpn)),
            http1: tokio_rustls::TlsConnector::from(Arc::new(http1)),
        }
    }
}

impl TlsConnector for RustlsConnector {
    fn connect(&self, host: &str, io: TcpStream, alpn_h2: bool) -> TlsHandshaking {
        let connector = if alpn_h2 {
            self.alpn.clone()
        } else {
            self.http1.clone()
        };
        let host = host.to_owned();
        Box::pin(async move {
            let name = ServerName::try_from(host).map_err(|e| Box::new(e) as BoxError)?;
            let stream = connector.connect(name, io).await?;
            let is_h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2");
            Ok((stream, is_h2))
        })
    }
}

/// Establishes negotiated connections for the pools.
pub(crate) struct Connector {
    config: Arc<TransportConfig>,
    resolver: DynResolver,
    tls: Arc<dyn TlsConnector>,
    h2c_known: Mutex<HashSet<RemoteAddress>>,
}

impl Connector {
    pub(crate) fn new(config: Arc<TransportConfig>) -> Connector {
        let resolver = match &config.resolver {
            Some(resolver) => DynResolver::new(resolver.clone()),
            None => DynResolver::gai(),
        };
        let tls = match &config.tls {
            Some(tls) => tls.clone(),
            None => Arc::new(RustlsConnector::new()) as Arc<dyn TlsConnector>,
        };
        Connector {
            config,
            resolver,
            tls,
            h2c_known: Mutex::new(HashSet::new()),
        }
    }

    /// Whether this address has accepted an h2c upgrade before.
    pub(crate) fn is_h2c(&self, addr: &RemoteAddress) -> bool {
        self.h2c_known
            .lock()
            .expect("h2c set poisoned")
            .contains(addr)
    }

    /// Remembers that the address speaks h2c; subsequent plaintext
    /// connections use prior knowledge directly.
    pub(crate) fn mark_h2c(&self, addr: &RemoteAddress) {
        self.h2c_known
            .lock()
            .expect("h2c set poisoned")
            .insert(addr.clone());
    }

    /// Dials `addr` and negotiates the protocol for the fresh connection.
    pub(crate) async fn connect(&self, addr: &RemoteAddress, ssl: bool) -> Result<Connection, Error> {
        let candidates = self.resolver.resolve(addr).await?;

        let mut last_err = None;
        let mut tcp = None;
        for candidate in candidates {
            trace!("dialing {candidate}");
            match TcpStream::connect(candidate).await {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => {
                    debug!("connect to {candidate} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        let tcp = match tcp {
            Some(tcp) => tcp,
            None => {
                return Err(match last_err {
                    Some(e) => Error::connect(e),
                    None => Error::connect(format!("no addresses for {addr}")),
                });
            }
        };
        let _ = tcp.set_nodelay(true);

        if ssl {
            let (stream, is_h2) = self
                .tls
                .connect(addr.host(), tcp, true)
                .await
                .map_err(Error::connect)?;
            let io = MaybeTlsStream::Tls(Box::new(stream));
            if is_h2 {
                trace!("ALPN negotiated h2 with {addr}");
                let conn = h2::handshake(io, &self.config).await?;
                Ok(Connection::h2(addr.clone(), true, conn))
            } else {
                trace!("ALPN selected http/1.1 with {addr}");
                Ok(Connection::h1(addr.clone(), true, io))
            }
        } else {
            let io = MaybeTlsStream::Plain(tcp);
            if self.config.http2_prior_knowledge || self.is_h2c(addr) {
                trace!("speaking h2 to {addr} with prior knowledge");
                let conn = h2::handshake(io, &self.config).await?;
                Ok(Connection::h2(addr.clone(), false, conn))
            } else {
                Ok(Connection::h1(addr.clone(), false, io))
            }
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector").finish()
    }
}
