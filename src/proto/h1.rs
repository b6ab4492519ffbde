//! The HTTP/1.1 protocol adapter.
//!
//! Sequential request/response correlation over one exclusively-owned
//! connection: encode the request head, stream the body (coordinating with
//! `Expect: 100-continue`), then parse the response head with `httparse` and
//! decode the body per its framing (content length, chunked or
//! close-delimited), feeding every event into the request's
//! [`ResponseHandle`].

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode, Uri, Version,
};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::{
    conn::H1Conn,
    error::Error,
    listener::TransportListener,
    proto::{
        self,
        handle::{HandleCell, ResponseHandle, ResponseReceiver},
    },
    response::ResponseSink,
    writer::{self, BodyPlan},
};

/// totally scientific
const AVERAGE_HEADER_SIZE: usize = 30;
const READ_CHUNK_HIGH_WATER: usize = 8 * 1024;
const MAX_CHUNK_LINE: usize = 4096;

// SETTINGS_ENABLE_PUSH = 0, the token advertised on an h2c upgrade probe.
const H2C_SETTINGS_PAYLOAD: &[u8] = &[0x00, 0x02, 0x00, 0x00, 0x00, 0x00];

/// How body bytes of a response are framed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Decode {
    Length(u64),
    Chunked,
    Eof,
    Empty,
}

pub(crate) struct ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) keep_alive: bool,
    pub(crate) decode: Decode,
}

impl ResponseHead {
    pub(crate) fn is_informational(&self) -> bool {
        self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS
    }
}

/// Parses a response head out of `buf`, advancing it past the parsed bytes.
/// Returns `None` until a full head is buffered.
pub(crate) fn parse_head(
    buf: &mut BytesMut,
    max_headers: usize,
    req_method: &Method,
) -> Result<Option<ResponseHead>, Error> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut header_slots = vec![httparse::EMPTY_HEADER; max_headers];
    let mut parsed = httparse::Response::new(&mut header_slots);

    let len = match parsed.parse(buf.as_ref()) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(Error::decode(e)),
    };
    trace!("response head parsed, {len} bytes");

    let status = StatusCode::from_u16(parsed.code.expect("complete response has code"))
        .map_err(Error::decode)?;
    let version = match parsed.version.expect("complete response has version") {
        0 => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(Error::decode)?;
        let value = HeaderValue::from_bytes(h.value).map_err(Error::decode)?;
        headers.append(name, value);
    }
    buf.advance(len);

    let keep_alive = match version {
        Version::HTTP_11 => !proto::connection_close(&headers),
        _ => proto::connection_keep_alive(&headers),
    };
    let decode = decoder(status, req_method, version, &headers)?;

    // A close-delimited body uses up the connection.
    let keep_alive = keep_alive && decode != Decode::Eof;

    Ok(Some(ResponseHead {
        version,
        status,
        headers,
        keep_alive,
        decode,
    }))
}

/// Decides how the body is framed, per RFC 9112 section 6.3.
fn decoder(
    status: StatusCode,
    req_method: &Method,
    version: Version,
    headers: &HeaderMap,
) -> Result<Decode, Error> {
    match status.as_u16() {
        100..=199 | 204 | 304 => return Ok(Decode::Empty),
        _ => {}
    }
    if *req_method == Method::HEAD {
        return Ok(Decode::Empty);
    }
    if *req_method == Method::CONNECT && status.is_success() {
        return Ok(Decode::Empty);
    }

    if headers.contains_key(header::TRANSFER_ENCODING) {
        if version == Version::HTTP_10 {
            debug!("HTTP/1.0 cannot have Transfer-Encoding header");
            return Err(Error::decode("transfer-encoding in HTTP/1.0 response"));
        }
        return if proto::transfer_encoding_is_chunked(headers) {
            Ok(Decode::Chunked)
        } else {
            trace!("not chunked, read till eof");
            Ok(Decode::Eof)
        };
    }

    if let Some(len) = proto::content_length_parse_all(headers) {
        return Ok(Decode::Length(len));
    }
    if headers.contains_key(header::CONTENT_LENGTH) {
        debug!("illegal Content-Length header");
        return Err(Error::decode("invalid content-length header"));
    }

    trace!("neither Transfer-Encoding nor Content-Length");
    Ok(Decode::Eof)
}

/// Encodes the request head: request line in origin-form plus headers.
pub(crate) fn encode_head(dst: &mut Vec<u8>, method: &Method, uri: &Uri, headers: &HeaderMap) {
    dst.reserve(30 + headers.len() * AVERAGE_HEADER_SIZE);

    dst.extend_from_slice(method.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    dst.extend_from_slice(target.as_bytes());
    dst.extend_from_slice(b" HTTP/1.1\r\n");

    for (name, value) in headers {
        dst.extend_from_slice(name.as_ref());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}

fn host_value(uri: &Uri, ssl: bool) -> Result<HeaderValue, Error> {
    let host = uri
        .host()
        .ok_or_else(|| Error::builder("request uri has no host"))?;
    let default_port = if ssl { 443 } else { 80 };
    let value = match uri.port_u16() {
        Some(port) if port != default_port => format!("{host}:{port}"),
        _ => host.to_owned(),
    };
    HeaderValue::from_str(&value).map_err(Error::builder)
}

async fn fill<T>(io: &mut T, buf: &mut BytesMut, read_timeout: Duration) -> Result<usize, Error>
where
    T: AsyncRead + Unpin,
{
    if buf.capacity() == buf.len() {
        buf.reserve(READ_CHUNK_HIGH_WATER);
    }
    let n = timeout(read_timeout, io.read_buf(buf))
        .await
        .map_err(|_| Error::timeout())?
        .map_err(Error::io)?;
    Ok(n)
}

async fn read_head<T>(
    io: &mut T,
    buf: &mut BytesMut,
    max_headers: usize,
    req_method: &Method,
    read_timeout: Duration,
) -> Result<ResponseHead, Error>
where
    T: AsyncRead + Unpin,
{
    loop {
        if let Some(head) = parse_head(buf, max_headers, req_method)? {
            return Ok(head);
        }
        if fill(io, buf, read_timeout).await? == 0 {
            return Err(Error::closed_connection(
                "connection closed before response head",
            ));
        }
    }
}

fn fault_error() -> Error {
    // The real error already completed the response future; this value only
    // tells the dispatcher to stop and close the connection.
    Error::decode("response handle rejected further events")
}

fn emit_data(cell: &HandleCell, chunk: Bytes) -> Result<(), Error> {
    let mut handle = cell.lock().expect("response handle poisoned");
    handle.on_data(chunk).map_err(|_| fault_error())
}

async fn read_body<T>(
    io: &mut T,
    buf: &mut BytesMut,
    decode: Decode,
    cell: &HandleCell,
    read_timeout: Duration,
) -> Result<(), Error>
where
    T: AsyncRead + Unpin,
{
    match decode {
        Decode::Empty => Ok(()),
        Decode::Length(total) => {
            let mut remaining = total;
            while remaining > 0 {
                if buf.is_empty() && fill(io, buf, read_timeout).await? == 0 {
                    return Err(Error::closed_connection(
                        "connection closed mid-body",
                    ));
                }
                let take = (buf.len() as u64).min(remaining) as usize;
                if take > 0 {
                    remaining -= take as u64;
                    emit_data(cell, buf.split_to(take).freeze())?;
                }
            }
            Ok(())
        }
        Decode::Eof => {
            loop {
                if !buf.is_empty() {
                    let chunk = buf.split().freeze();
                    emit_data(cell, chunk)?;
                }
                if fill(io, buf, read_timeout).await? == 0 {
                    return Ok(());
                }
            }
        }
        Decode::Chunked => read_chunked_body(io, buf, cell, read_timeout).await,
    }
}

async fn read_line<T>(
    io: &mut T,
    buf: &mut BytesMut,
    read_timeout: Duration,
) -> Result<Bytes, Error>
where
    T: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            return Ok(line);
        }
        if buf.len() > MAX_CHUNK_LINE {
            return Err(Error::decode("chunk size line too long"));
        }
        if fill(io, buf, read_timeout).await? == 0 {
            return Err(Error::closed_connection("connection closed mid-chunk"));
        }
    }
}

async fn read_chunked_body<T>(
    io: &mut T,
    buf: &mut BytesMut,
    cell: &HandleCell,
    read_timeout: Duration,
) -> Result<(), Error>
where
    T: AsyncRead + Unpin,
{
    loop {
        let line = read_line(io, buf, read_timeout).await?;
        let size_str = std::str::from_utf8(&line)
            .map_err(Error::decode)?
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let size = u64::from_str_radix(size_str, 16)
            .map_err(|_| Error::decode(format!("invalid chunk size {size_str:?}")))?;

        if size == 0 {
            return read_trailers(io, buf, cell, read_timeout).await;
        }

        let mut remaining = size;
        while remaining > 0 {
            if buf.is_empty() && fill(io, buf, read_timeout).await? == 0 {
                return Err(Error::closed_connection("connection closed mid-chunk"));
            }
            let take = (buf.len() as u64).min(remaining) as usize;
            if take > 0 {
                remaining -= take as u64;
                emit_data(cell, buf.split_to(take).freeze())?;
            }
        }

        // Chunk data is followed by its own CRLF.
        let crlf = read_line(io, buf, read_timeout).await?;
        if !crlf.is_empty() {
            return Err(Error::decode("missing CRLF after chunk data"));
        }
    }
}

async fn read_trailers<T>(
    io: &mut T,
    buf: &mut BytesMut,
    cell: &HandleCell,
    read_timeout: Duration,
) -> Result<(), Error>
where
    T: AsyncRead + Unpin,
{
    loop {
        let mut slots = [httparse::EMPTY_HEADER; 16];
        match httparse::parse_headers(buf.as_ref(), &mut slots) {
            Ok(httparse::Status::Complete((len, parsed))) => {
                if !parsed.is_empty() {
                    let mut trailers = HeaderMap::with_capacity(parsed.len());
                    for h in parsed {
                        let name =
                            HeaderName::from_bytes(h.name.as_bytes()).map_err(Error::decode)?;
                        let value = HeaderValue::from_bytes(h.value).map_err(Error::decode)?;
                        trailers.append(name, value);
                    }
                    let mut handle = cell.lock().expect("response handle poisoned");
                    handle.on_trailers(trailers).map_err(|_| fault_error())?;
                }
                buf.advance(len);
                return Ok(());
            }
            Ok(httparse::Status::Partial) => {
                if fill(io, buf, read_timeout).await? == 0 {
                    return Err(Error::closed_connection(
                        "connection closed in trailer section",
                    ));
                }
            }
            Err(e) => return Err(Error::decode(e)),
        }
    }
}

/// The outcome of one HTTP/1.1 exchange.
pub(crate) enum H1Outcome {
    /// The exchange ran to a terminal handle state; `reuse` says whether the
    /// connection may go back to its pool.
    Complete { reuse: bool },
    /// The server answered an h2c upgrade probe with `101 Switching
    /// Protocols`; nothing was delivered to the handle, and the reclaimed
    /// sink rides along for the replay.
    UpgradedH2c {
        sink: Option<Box<dyn ResponseSink>>,
    },
}

pub(crate) struct H1Dispatch<'a> {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) plan: BodyPlan,
    pub(crate) ssl: bool,
    pub(crate) expect_continue: bool,
    pub(crate) on_continue: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) upgrade_probe: bool,
    pub(crate) max_content_length: u64,
    pub(crate) max_headers: usize,
    pub(crate) read_timeout: Duration,
    pub(crate) sink: Option<Box<dyn ResponseSink>>,
    pub(crate) listener: &'a dyn TransportListener,
}

/// Runs one exchange on an exclusively-owned HTTP/1.1 connection.
///
/// Every path leaves the returned receiver resolved (success, failure or
/// timeout), except the h2c upgrade outcome where the pending request must
/// be replayed by the caller.
pub(crate) async fn dispatch(
    conn: &mut H1Conn,
    mut d: H1Dispatch<'_>,
) -> Result<(H1Outcome, ResponseReceiver), Error> {
    // Header fixups the adapter owns: host, body framing, expectations.
    // Everything fallible happens before a request id is allocated, so an
    // early error leaves the connection clean.
    if !d.headers.contains_key(header::HOST) {
        let host = host_value(&d.uri, d.ssl)?;
        d.headers.insert(header::HOST, host);
    }
    if d.plan.is_segmented() {
        d.headers.remove(header::CONTENT_LENGTH);
        d.headers
            .insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }
    if d.expect_continue && !d.headers.contains_key(header::EXPECT) {
        d.headers
            .insert(header::EXPECT, HeaderValue::from_static("100-continue"));
    }
    if d.upgrade_probe {
        d.headers.insert(
            header::CONNECTION,
            HeaderValue::from_static("Upgrade, HTTP2-Settings"),
        );
        d.headers
            .insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        use base64::Engine;
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(H2C_SETTINGS_PAYLOAD);
        d.headers.insert(
            HeaderName::from_static("http2-settings"),
            HeaderValue::from_str(&token).map_err(Error::builder)?,
        );
    }

    let mut head_bytes = Vec::new();
    encode_head(&mut head_bytes, &d.method, &d.uri, &d.headers);

    let id = conn.registry.allocate()?;
    let (cell, rx) = ResponseHandle::channel(d.max_content_length, d.sink.take());
    conn.registry.insert(id, cell.clone());

    let fail = |conn: &mut H1Conn, cell: &HandleCell, error: Error| {
        conn.broken = true;
        conn.registry.remove(id);
        cell.lock()
            .expect("response handle poisoned")
            .on_error(error);
        H1Outcome::Complete { reuse: false }
    };

    d.listener.on_write_attempt();
    if let Err(e) = write_all(&mut conn.io, &head_bytes).await {
        d.listener.on_write_failed(&e);
        return Ok((fail(conn, &cell, e), rx));
    }

    let mut plan = Some(d.plan);
    let mut head;

    if d.expect_continue {
        // Body deferred: only the head is flushed until the server answers.
        trace!("expect-continue: head flushed, awaiting interim response");
        loop {
            head = match read_head(
                &mut conn.io,
                &mut conn.read_buf,
                d.max_headers,
                &d.method,
                d.read_timeout,
            )
            .await
            {
                Ok(head) => head,
                Err(e) => return Ok((fail(conn, &cell, e), rx)),
            };

            if head.status == StatusCode::CONTINUE {
                if let Some(cb) = d.on_continue.take() {
                    cb();
                }
                if let Some(plan) = plan.take() {
                    if let Err(e) = write_body(conn, plan, d.listener).await {
                        return Ok((fail(conn, &cell, e), rx));
                    }
                }
                continue;
            }
            if head.is_informational() {
                continue;
            }
            // A final response without 100-continue is an implicit
            // go-ahead: write the body anyway so the exchange is complete.
            if let Some(plan) = plan.take() {
                debug!(
                    "final response ({}) before 100-continue, writing body",
                    head.status
                );
                if let Err(e) = write_body(conn, plan, d.listener).await {
                    return Ok((fail(conn, &cell, e), rx));
                }
            }
            break;
        }
    } else {
        if let Some(plan) = plan.take() {
            if let Err(e) = write_body(conn, plan, d.listener).await {
                return Ok((fail(conn, &cell, e), rx));
            }
        }
        loop {
            head = match read_head(
                &mut conn.io,
                &mut conn.read_buf,
                d.max_headers,
                &d.method,
                d.read_timeout,
            )
            .await
            {
                Ok(head) => head,
                Err(e) => return Ok((fail(conn, &cell, e), rx)),
            };
            if head.is_informational() {
                trace!("skipping informational response: {}", head.status);
                continue;
            }
            break;
        }
    }

    if d.upgrade_probe && head.status == StatusCode::SWITCHING_PROTOCOLS {
        trace!("h2c upgrade accepted");
        conn.registry.remove(id);
        let sink = cell.lock().expect("response handle poisoned").take_sink();
        return Ok((H1Outcome::UpgradedH2c { sink }, rx));
    }

    d.listener.on_message_received(head.status);
    {
        let mut handle = cell.lock().expect("response handle poisoned");
        if handle
            .on_message(head.version, head.status, head.headers)
            .is_err()
        {
            // Over-sized or a failed sink: the body is unread, so the
            // connection cannot be resynchronized.
            drop(handle);
            conn.broken = true;
            conn.registry.remove(id);
            return Ok((H1Outcome::Complete { reuse: false }, rx));
        }
    }

    if let Err(e) = read_body(
        &mut conn.io,
        &mut conn.read_buf,
        head.decode,
        &cell,
        d.read_timeout,
    )
    .await
    {
        return Ok((fail(conn, &cell, e), rx));
    }

    let end_ok = {
        let mut handle = cell.lock().expect("response handle poisoned");
        handle.on_end().is_ok()
    };
    conn.registry.remove(id);
    if !end_ok {
        conn.broken = true;
        return Ok((H1Outcome::Complete { reuse: false }, rx));
    }

    Ok((
        H1Outcome::Complete {
            reuse: head.keep_alive,
        },
        rx,
    ))
}

async fn write_all(io: &mut crate::conn::MaybeTlsStream, bytes: &[u8]) -> Result<(), Error> {
    io.write_all(bytes).await.map_err(Error::closed_connection)?;
    io.flush().await.map_err(Error::closed_connection)
}

async fn write_body(
    conn: &mut H1Conn,
    plan: BodyPlan,
    listener: &dyn TransportListener,
) -> Result<(), Error> {
    match writer::write_h1(&mut conn.io, plan).await {
        Ok(()) => {
            listener.on_write_done();
            Ok(())
        }
        Err(e) => {
            listener.on_write_failed(&e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &[u8]) -> Result<Option<ResponseHead>, Error> {
        let mut buf = BytesMut::from(bytes);
        parse_head(&mut buf, 32, &Method::GET)
    }

    #[test]
    fn parses_complete_head() {
        let head = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Test: yes\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.decode, Decode::Length(5));
        assert!(head.keep_alive);
        assert_eq!(head.headers.get("x-test").unwrap(), "yes");
    }

    #[test]
    fn partial_head_returns_none() {
        assert!(parse(b"HTTP/1.1 200 OK\r\nContent-Le").unwrap().is_none());
    }

    #[test]
    fn connection_close_disables_reuse() {
        let head = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!head.keep_alive);
    }

    #[test]
    fn chunked_beats_eof() {
        let head = parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.decode, Decode::Chunked);
    }

    #[test]
    fn no_framing_headers_is_close_delimited() {
        let head = parse(b"HTTP/1.1 200 OK\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.decode, Decode::Eof);
        assert!(!head.keep_alive);
    }

    #[test]
    fn head_responses_have_no_body() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n"[..]);
        let head = parse_head(&mut buf, 32, &Method::HEAD).unwrap().unwrap();
        assert_eq!(head.decode, Decode::Empty);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(parse(b"NOT HTTP AT ALL\r\n\r\n").is_err());
    }

    #[test]
    fn encode_head_is_origin_form() {
        let mut out = Vec::new();
        let uri: Uri = "http://example.com/path?q=1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        encode_head(&mut out, &Method::GET, &uri, &headers);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
        assert!(text.contains("host: example.com\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn chunked_body_decodes_across_fragmented_reads() {
        // Two chunks plus a trailer, fed through an in-memory reader.
        let wire = b"3\r\nabc\r\n4\r\ndefg\r\n0\r\nx-digest: ok\r\n\r\n";
        let (cell, mut rx) = ResponseHandle::channel(1024, None);
        {
            let mut handle = cell.lock().unwrap();
            handle
                .on_message(Version::HTTP_11, StatusCode::OK, HeaderMap::new())
                .unwrap();
        }

        let mut reader = &wire[..];
        let mut buf = BytesMut::new();
        read_chunked_body(&mut reader, &mut buf, &cell, Duration::from_secs(1))
            .await
            .unwrap();
        cell.lock().unwrap().on_end().unwrap();

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.body().as_ref(), b"abcdefg");
        assert_eq!(response.trailers().unwrap().get("x-digest").unwrap(), "ok");
    }

    #[tokio::test]
    async fn content_length_body_is_sized() {
        let wire = b"hello world";
        let (cell, mut rx) = ResponseHandle::channel(1024, None);
        {
            let mut handle = cell.lock().unwrap();
            handle
                .on_message(Version::HTTP_11, StatusCode::OK, HeaderMap::new())
                .unwrap();
        }

        let mut reader = &wire[..];
        let mut buf = BytesMut::new();
        read_body(
            &mut reader,
            &mut buf,
            Decode::Length(5),
            &cell,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        cell.lock().unwrap().on_end().unwrap();

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.body().as_ref(), b"hello");
    }
}
