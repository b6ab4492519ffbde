//! The HTTP/2 protocol adapter.
//!
//! Stream-id keyed multiplexing over one shared connection. The framing
//! layer (HPACK, SETTINGS, flow control, RST_STREAM/GOAWAY) is the `h2`
//! crate's; this adapter owns the stream bookkeeping: id allocation through
//! the per-connection [`HandleRegistry`], per-stream content-length
//! enforcement through the [`ResponseHandle`], and the mapping of `h2`
//! errors onto stream-scoped vs connection-scoped failures.
//!
//! Registry ids must equal the client's odd wire stream ids, so id
//! allocation and `send_request` happen under one per-connection lock: `h2`
//! assigns ids in `send_request` order.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use http::{header, HeaderMap, Method, Uri, Version};
use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::timeout,
};

use crate::{
    config::TransportConfig,
    error::Error,
    listener::TransportListener,
    proto::{
        self,
        handle::{HandleCell, HandleFault, HandleRegistry, ResponseHandle, ResponseReceiver},
    },
    response::ResponseSink,
    writer::{self, BodyPlan},
};

/// The shared send half of one HTTP/2 connection.
#[derive(Clone)]
pub(crate) struct H2Conn {
    tx: h2::client::SendRequest<Bytes>,
    send_lock: Arc<tokio::sync::Mutex<()>>,
    registry: Arc<HandleRegistry>,
    broken: Arc<AtomicBool>,
}

impl H2Conn {
    pub(crate) fn is_open(&self) -> bool {
        !self.broken.load(Ordering::Acquire)
    }

    /// Whether another stream id can still be allocated. A connection that
    /// ran out must be replaced, never reused.
    pub(crate) fn has_capacity(&self) -> bool {
        !self.registry.would_exhaust()
    }
}

/// Performs the HTTP/2 handshake and spawns the connection driver task.
///
/// The driver owns the transport for the connection's lifetime; when it
/// terminates, every in-flight handle on the connection is failed.
pub(crate) async fn handshake<T>(io: T, config: &TransportConfig) -> Result<H2Conn, Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = h2::client::Builder::new();
    builder
        .initial_window_size(config.http2_initial_stream_window_size)
        .initial_connection_window_size(config.http2_initial_connection_window_size)
        .max_send_buffer_size(config.write_buffer_limit)
        .enable_push(false);
    if let Some(max) = config.http2_max_frame_size {
        builder.max_frame_size(max);
    }

    let (tx, connection) = builder
        .handshake::<_, Bytes>(io)
        .await
        .map_err(Error::connect)?;
    trace!("http2 handshake complete, spawning connection driver");

    let registry = Arc::new(HandleRegistry::http2());
    let broken = Arc::new(AtomicBool::new(false));

    let driver_registry = registry.clone();
    let driver_broken = broken.clone();
    tokio::spawn(async move {
        if let Err(_e) = connection.await {
            debug!("h2 connection error: {_e}");
        }
        driver_broken.store(true, Ordering::Release);
        driver_registry.fail_all(|| Error::closed_connection("connection driver terminated"));
    });

    Ok(H2Conn {
        tx,
        send_lock: Arc::new(tokio::sync::Mutex::new(())),
        registry,
        broken,
    })
}

/// Maps an `h2` error to our taxonomy plus whether it poisons the whole
/// connection (every sibling stream) or just the one stream it hit.
fn map_h2_error(e: h2::Error) -> (Error, bool) {
    if e.is_io() {
        (Error::closed_connection(e), true)
    } else if e.is_go_away() {
        (Error::connect(e), true)
    } else {
        // RST_STREAM and other library errors are scoped to the stream.
        (Error::connect(e), false)
    }
}

pub(crate) struct H2Dispatch<'a> {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) plan: BodyPlan,
    pub(crate) max_content_length: u64,
    pub(crate) read_timeout: Duration,
    pub(crate) sink: Option<Box<dyn ResponseSink>>,
    pub(crate) listener: &'a dyn TransportListener,
}

fn fail_request(registry: &HandleRegistry, id: u32, cell: &HandleCell, error: Error) {
    registry.remove(id);
    cell.lock()
        .expect("response handle poisoned")
        .on_error(error);
}

/// Runs one exchange as a stream on a shared HTTP/2 connection.
///
/// Returns whether the connection may be reused, plus the receiver for the
/// response future. `Err` is returned only for failures before the request
/// was registered (notably stream-id exhaustion), in which case nothing was
/// written and the caller may retry on a fresh connection.
pub(crate) async fn dispatch(
    conn: &H2Conn,
    mut d: H2Dispatch<'_>,
) -> Result<(bool, ResponseReceiver), Error> {
    let guard = conn.send_lock.lock().await;
    let id = conn.registry.allocate()?;
    let (cell, rx) = ResponseHandle::channel(d.max_content_length, d.sink.take());
    conn.registry.insert(id, cell.clone());

    proto::strip_connection_headers(&mut d.headers);
    // Interim responses are not observable through the framing layer, so the
    // body is written immediately: the implicit go-ahead default.
    d.headers.remove(header::EXPECT);

    let request = {
        let builder = http::Request::builder()
            .method(d.method.clone())
            .uri(d.uri.clone())
            .version(Version::HTTP_2);
        match builder.body(()) {
            Ok(mut request) => {
                *request.headers_mut() = std::mem::take(&mut d.headers);
                request
            }
            Err(e) => {
                conn.registry.remove(id);
                return Err(Error::builder(e));
            }
        }
    };

    d.listener.on_write_attempt();
    let mut tx = match conn.tx.clone().ready().await {
        Ok(tx) => tx,
        Err(e) => {
            conn.broken.store(true, Ordering::Release);
            let error = Error::closed_connection(e);
            d.listener.on_write_failed(&error);
            fail_request(&conn.registry, id, &cell, error);
            return Ok((false, rx));
        }
    };

    let eos = d.plan.is_end();
    let (response_fut, mut send_stream) = match tx.send_request(request, eos) {
        Ok(pair) => pair,
        Err(e) => {
            let (error, conn_scoped) = map_h2_error(e);
            if conn_scoped {
                conn.broken.store(true, Ordering::Release);
            }
            d.listener.on_write_failed(&error);
            fail_request(&conn.registry, id, &cell, error);
            return Ok((!conn_scoped, rx));
        }
    };
    drop(guard);
    trace!("h2 stream {id} opened");

    if !eos {
        if let Err(e) = writer::write_h2(&mut send_stream, d.plan).await {
            send_stream.send_reset(h2::Reason::CANCEL);
            let conn_scoped = e.is_closed_connection();
            if conn_scoped {
                conn.broken.store(true, Ordering::Release);
            }
            d.listener.on_write_failed(&e);
            fail_request(&conn.registry, id, &cell, e);
            return Ok((!conn_scoped, rx));
        }
    }
    d.listener.on_write_done();

    // Write succeeded; the read timeout is armed from here on.
    let response = match timeout(d.read_timeout, response_fut).await {
        Err(_elapsed) => {
            // Reset only this stream; siblings on the connection are
            // unaffected.
            send_stream.send_reset(h2::Reason::CANCEL);
            fail_request(&conn.registry, id, &cell, Error::timeout());
            return Ok((true, rx));
        }
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            let (error, conn_scoped) = map_h2_error(e);
            if conn_scoped {
                conn.broken.store(true, Ordering::Release);
            }
            fail_request(&conn.registry, id, &cell, error);
            return Ok((!conn_scoped, rx));
        }
    };

    let (parts, mut body) = response.into_parts();
    d.listener.on_message_received(parts.status);
    {
        let mut handle = cell.lock().expect("response handle poisoned");
        if let Err(fault) = handle.on_message(Version::HTTP_2, parts.status, parts.headers) {
            drop(handle);
            conn.registry.remove(id);
            // Dropping the receive stream resets it. An over-sized message
            // stays scoped to this stream; a failed sink takes the whole
            // connection down with it.
            let conn_scoped = fault == HandleFault::Sink;
            if conn_scoped {
                conn.broken.store(true, Ordering::Release);
            }
            return Ok((!conn_scoped, rx));
        }
    }

    let mut flow = body.flow_control().clone();
    loop {
        let chunk = match timeout(d.read_timeout, body.data()).await {
            Err(_elapsed) => {
                fail_request(&conn.registry, id, &cell, Error::timeout());
                return Ok((true, rx));
            }
            Ok(None) => break,
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => {
                let (error, conn_scoped) = map_h2_error(e);
                if conn_scoped {
                    conn.broken.store(true, Ordering::Release);
                }
                fail_request(&conn.registry, id, &cell, error);
                return Ok((!conn_scoped, rx));
            }
        };

        let len = chunk.len();
        let fault = {
            let mut handle = cell.lock().expect("response handle poisoned");
            handle.on_data(chunk).err()
        };
        if let Some(fault) = fault {
            conn.registry.remove(id);
            let conn_scoped = fault == HandleFault::Sink;
            if conn_scoped {
                conn.broken.store(true, Ordering::Release);
            }
            return Ok((!conn_scoped, rx));
        }
        // Ignored failures here just mean the stream is already done.
        let _ = flow.release_capacity(len);
    }

    match timeout(d.read_timeout, body.trailers()).await {
        Err(_elapsed) => {
            fail_request(&conn.registry, id, &cell, Error::timeout());
            return Ok((true, rx));
        }
        Ok(Ok(Some(trailers))) => {
            let fault = {
                let mut handle = cell.lock().expect("response handle poisoned");
                handle.on_trailers(trailers).err()
            };
            if let Some(fault) = fault {
                conn.registry.remove(id);
                let conn_scoped = fault == HandleFault::Sink;
                if conn_scoped {
                    conn.broken.store(true, Ordering::Release);
                }
                return Ok((!conn_scoped, rx));
            }
        }
        Ok(Ok(None)) => {}
        Ok(Err(e)) => {
            let (error, conn_scoped) = map_h2_error(e);
            if conn_scoped {
                conn.broken.store(true, Ordering::Release);
            }
            fail_request(&conn.registry, id, &cell, error);
            return Ok((!conn_scoped, rx));
        }
    }

    let end_ok = {
        let mut handle = cell.lock().expect("response handle poisoned");
        handle.on_end().is_ok()
    };
    conn.registry.remove(id);
    if !end_ok {
        conn.broken.store(true, Ordering::Release);
        return Ok((false, rx));
    }

    Ok((true, rx))
}
