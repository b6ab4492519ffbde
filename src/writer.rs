//! The request writer family.
//!
//! [`prepare`] selects a writing strategy per body kind and fixes up the
//! request headers (content length, multipart content type). The per-protocol
//! entry points then serialize the planned body onto a connection:
//! [`write_h1`] streams it onto the socket (chunked transfer coding for
//! caller-driven bodies), [`write_h2`] feeds it through an `h2` send stream
//! respecting flow-control capacity.

use std::{io, path::PathBuf};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method};
use log::trace;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

use crate::{
    body::{Body, BodyKind, Segment, SegmentReceiver},
    error::Error,
    proto,
};

const FILE_CHUNK_SIZE: usize = 16 * 1024;

/// The chosen strategy for serializing one request body.
#[derive(Debug)]
pub(crate) enum BodyPlan {
    Empty,
    Full(Bytes),
    File { path: PathBuf, len: u64 },
    Segmented(SegmentReceiver),
}

impl BodyPlan {
    pub(crate) fn is_end(&self) -> bool {
        matches!(self, BodyPlan::Empty)
    }

    pub(crate) fn is_segmented(&self) -> bool {
        matches!(self, BodyPlan::Segmented(_))
    }

    /// Plans whose input survives a write-less failure can be replayed on a
    /// fresh connection. A caller-driven body cannot.
    pub(crate) fn retry_clone(&self) -> Option<BodyPlan> {
        match self {
            BodyPlan::Empty => Some(BodyPlan::Empty),
            BodyPlan::Full(data) => Some(BodyPlan::Full(data.clone())),
            BodyPlan::File { path, len } => Some(BodyPlan::File {
                path: path.clone(),
                len: *len,
            }),
            BodyPlan::Segmented(_) => None,
        }
    }
}

/// Selects the writer for the request's body kind and prepares the headers.
///
/// A file body is probed here, so a missing file surfaces as an i/o error
/// before any bytes are written. A multipart form is encoded here in full
/// (reading its file parts) for the same reason.
pub(crate) async fn prepare(
    method: &Method,
    headers: &mut HeaderMap,
    body: Body,
) -> Result<BodyPlan, Error> {
    match body.kind {
        BodyKind::Empty => {
            if proto::method_has_defined_payload_semantics(method) {
                proto::set_content_length_if_missing(headers, 0);
            }
            Ok(BodyPlan::Empty)
        }
        BodyKind::Full(data) => {
            proto::set_content_length_if_missing(headers, data.len() as u64);
            Ok(BodyPlan::Full(data))
        }
        BodyKind::File(path) => {
            let meta = fs::metadata(&path).await.map_err(Error::io)?;
            if !meta.is_file() {
                return Err(Error::io(format!(
                    "not a regular file: {}",
                    path.display()
                )));
            }
            let len = meta.len();
            proto::set_content_length_if_missing(headers, len);
            Ok(BodyPlan::File { path, len })
        }
        BodyKind::Multipart(form) => {
            let content_type = form.content_type();
            let data = form.encode().await?;
            if !headers.contains_key(header::CONTENT_TYPE) {
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_str(&content_type).map_err(Error::builder)?,
                );
            }
            proto::set_content_length_if_missing(headers, data.len() as u64);
            Ok(BodyPlan::Full(data))
        }
        BodyKind::Segmented(rx) => Ok(BodyPlan::Segmented(rx)),
    }
}

fn write_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => Error::closed_connection(e),
        _ => Error::io(e),
    }
}

/// Writes the planned body onto an HTTP/1.1 connection.
///
/// Caller-driven bodies are written with chunked transfer coding; segments
/// queued before this writer started draining are flushed in submission
/// order.
pub(crate) async fn write_h1<T>(io: &mut T, plan: BodyPlan) -> Result<(), Error>
where
    T: AsyncWrite + Unpin,
{
    match plan {
        BodyPlan::Empty => Ok(()),
        BodyPlan::Full(data) => {
            io.write_all(&data).await.map_err(write_error)?;
            io.flush().await.map_err(write_error)
        }
        BodyPlan::File { path, len } => {
            let mut file = fs::File::open(&path).await.map_err(Error::io)?;
            let mut buf = vec![0u8; FILE_CHUNK_SIZE];
            let mut written = 0u64;
            loop {
                let n = file.read(&mut buf).await.map_err(Error::io)?;
                if n == 0 {
                    break;
                }
                written += n as u64;
                io.write_all(&buf[..n]).await.map_err(write_error)?;
            }
            if written != len {
                // The file changed size under us; the framing is now wrong.
                return Err(Error::io(format!(
                    "file {} changed size while streaming ({written} of {len} bytes)",
                    path.display()
                )));
            }
            io.flush().await.map_err(write_error)
        }
        BodyPlan::Segmented(mut rx) => {
            loop {
                match rx.recv().await {
                    None => {
                        return Err(Error::io("request body aborted before end"));
                    }
                    Some(Segment::Data(data)) => {
                        write_chunk(io, &data).await?;
                    }
                    Some(Segment::End(last)) => {
                        if let Some(data) = last {
                            write_chunk(io, &data).await?;
                        }
                        io.write_all(b"0\r\n\r\n").await.map_err(write_error)?;
                        break;
                    }
                }
            }
            io.flush().await.map_err(write_error)
        }
    }
}

async fn write_chunk<T>(io: &mut T, data: &Bytes) -> Result<(), Error>
where
    T: AsyncWrite + Unpin,
{
    if data.is_empty() {
        // A zero-length chunk would terminate the body early.
        return Ok(());
    }
    let mut head = [0u8; 18];
    let head = {
        use std::io::Write;
        let mut cursor = io::Cursor::new(&mut head[..]);
        write!(cursor, "{:X}\r\n", data.len()).expect("chunk head fits");
        let n = cursor.position() as usize;
        &head[..n]
    };
    io.write_all(head).await.map_err(write_error)?;
    io.write_all(data).await.map_err(write_error)?;
    io.write_all(b"\r\n").await.map_err(write_error)
}

fn h2_write_error(e: h2::Error) -> Error {
    if e.is_io() {
        Error::closed_connection(e)
    } else {
        Error::connect(e)
    }
}

/// Writes the planned body onto an HTTP/2 stream, respecting the stream's
/// flow-control capacity.
pub(crate) async fn write_h2(
    stream: &mut h2::SendStream<Bytes>,
    plan: BodyPlan,
) -> Result<(), Error> {
    match plan {
        BodyPlan::Empty => Ok(()),
        BodyPlan::Full(data) => send_all(stream, data, true).await,
        BodyPlan::File { path, .. } => {
            let mut file = fs::File::open(&path).await.map_err(Error::io)?;
            let mut buf = vec![0u8; FILE_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await.map_err(Error::io)?;
                if n == 0 {
                    stream
                        .send_data(Bytes::new(), true)
                        .map_err(h2_write_error)?;
                    return Ok(());
                }
                send_all(stream, Bytes::copy_from_slice(&buf[..n]), false).await?;
            }
        }
        BodyPlan::Segmented(mut rx) => loop {
            match rx.recv().await {
                None => {
                    stream.send_reset(h2::Reason::CANCEL);
                    return Err(Error::io("request body aborted before end"));
                }
                Some(Segment::Data(data)) => send_all(stream, data, false).await?,
                Some(Segment::End(last)) => {
                    match last {
                        Some(data) => send_all(stream, data, true).await?,
                        None => stream
                            .send_data(Bytes::new(), true)
                            .map_err(h2_write_error)?,
                    }
                    return Ok(());
                }
            }
        },
    }
}

async fn send_all(
    stream: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
    end_of_stream: bool,
) -> Result<(), Error> {
    if data.is_empty() {
        if end_of_stream {
            stream
                .send_data(Bytes::new(), true)
                .map_err(h2_write_error)?;
        }
        return Ok(());
    }

    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let granted = std::future::poll_fn(|cx| stream.poll_capacity(cx))
            .await
            .ok_or_else(|| Error::closed_connection("stream closed while sending body"))?
            .map_err(h2_write_error)?;
        if granted == 0 {
            continue;
        }
        let n = granted.min(data.len());
        trace!("h2 capacity granted, sending {n} of {} bytes", data.len());
        let chunk = data.split_to(n);
        let eos = end_of_stream && data.is_empty();
        stream.send_data(chunk, eos).map_err(h2_write_error)?;
    }
    Ok(())
}
