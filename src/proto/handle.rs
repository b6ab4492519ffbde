//! Response handles and their per-connection registry.
//!
//! A [`ResponseHandle`] turns raw protocol events (head, data chunks,
//! trailers, end, error) into a single completed or failed response future.
//! It is an explicit state machine: `Init → MessageReceived → End | Error`,
//! where the terminal states swallow every further event.
//!
//! The [`HandleRegistry`] maps request ids to live handles for one
//! connection. For HTTP/2 the id *is* the client-initiated (odd) stream id;
//! for HTTP/1.1 the registry is a single in-flight slot, recycled after each
//! response since pipelining is not attempted.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use log::{error, trace};
use tokio::sync::oneshot;

use crate::{
    error::Error,
    proto::content_length_parse_all,
    response::{Response, ResponseSink},
};

/// The largest stream id a client may initiate.
pub(crate) const MAX_STREAM_ID: u32 = 0x7fff_ffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Init,
    MessageReceived,
    Terminal,
}

/// Why an event was rejected, so the protocol adapter can decide between
/// resetting one stream and closing the whole connection. The handle itself
/// has already been completed exceptionally when a fault is returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandleFault {
    /// Declared or accumulated content exceeded the configured maximum.
    OverSized,
    /// A user-supplied sink callback failed; the owning connection must be
    /// closed, not released.
    Sink,
}

pub(crate) type HandleCell = Arc<Mutex<ResponseHandle>>;
pub(crate) type ResponseReceiver = oneshot::Receiver<Result<Response, Error>>;

pub(crate) struct ResponseHandle {
    state: State,
    version: Version,
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    trailers: Option<HeaderMap>,
    received: u64,
    max_content_length: u64,
    sink: Option<Box<dyn ResponseSink>>,
    tx: Option<oneshot::Sender<Result<Response, Error>>>,
}

impl ResponseHandle {
    /// Creates a handle and the receiver its response future is built from.
    pub(crate) fn channel(
        max_content_length: u64,
        sink: Option<Box<dyn ResponseSink>>,
    ) -> (HandleCell, ResponseReceiver) {
        let (tx, rx) = oneshot::channel();
        let handle = ResponseHandle {
            state: State::Init,
            version: Version::HTTP_11,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            trailers: None,
            received: 0,
            max_content_length,
            sink,
            tx: Some(tx),
        };
        (Arc::new(Mutex::new(handle)), rx)
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state == State::Terminal
    }

    /// The status line and headers arrived.
    ///
    /// Rejects the message up front when its declared `Content-Length`
    /// exceeds the maximum, without waiting for any body bytes.
    pub(crate) fn on_message(
        &mut self,
        version: Version,
        status: StatusCode,
        headers: HeaderMap,
    ) -> Result<(), HandleFault> {
        if self.state != State::Init {
            trace!("on_message ignored in state {:?}", self.state);
            return Ok(());
        }

        if let Some(declared) = content_length_parse_all(&headers) {
            if declared > self.max_content_length {
                self.complete(Err(Error::content_over_sized(self.max_content_length)));
                return Err(HandleFault::OverSized);
            }
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(cause) = sink.on_head(status, &headers) {
                self.complete(Err(Error::decode(cause)));
                return Err(HandleFault::Sink);
            }
        }

        self.version = version;
        self.status = status;
        self.headers = headers;
        self.state = State::MessageReceived;
        Ok(())
    }

    /// One chunk of body data arrived.
    pub(crate) fn on_data(&mut self, chunk: Bytes) -> Result<(), HandleFault> {
        if self.state != State::MessageReceived {
            trace!("on_data ignored in state {:?}", self.state);
            return Ok(());
        }

        self.received += chunk.len() as u64;
        if self.received > self.max_content_length {
            self.complete(Err(Error::content_over_sized(self.max_content_length)));
            return Err(HandleFault::OverSized);
        }

        match self.sink.as_mut() {
            Some(sink) => {
                if let Err(cause) = sink.on_data(chunk) {
                    self.complete(Err(Error::decode(cause)));
                    return Err(HandleFault::Sink);
                }
            }
            None => self.body.put_slice(&chunk),
        }
        Ok(())
    }

    /// Trailer headers arrived; at most once, before the end of the message.
    pub(crate) fn on_trailers(&mut self, trailers: HeaderMap) -> Result<(), HandleFault> {
        if self.state != State::MessageReceived || self.trailers.is_some() {
            trace!("on_trailers ignored in state {:?}", self.state);
            return Ok(());
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(cause) = sink.on_trailers(&trailers) {
                self.complete(Err(Error::decode(cause)));
                return Err(HandleFault::Sink);
            }
        }
        self.trailers = Some(trailers);
        Ok(())
    }

    /// The message completed; resolves the response future.
    pub(crate) fn on_end(&mut self) -> Result<(), HandleFault> {
        if self.state != State::MessageReceived {
            trace!("on_end ignored in state {:?}", self.state);
            return Ok(());
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(cause) = sink.on_end() {
                self.complete(Err(Error::decode(cause)));
                return Err(HandleFault::Sink);
            }
        }

        let response = Response {
            status: self.status,
            version: self.version,
            headers: std::mem::take(&mut self.headers),
            body: self.body.split().freeze(),
            trailers: self.trailers.take(),
        };
        self.complete(Ok(response));
        Ok(())
    }

    /// Fails the response future. At most one terminal transition ever takes
    /// effect; later calls are no-ops.
    pub(crate) fn on_error(&mut self, error: Error) {
        if self.state == State::Terminal {
            trace!("on_error ignored, handle already terminal");
            return;
        }
        self.complete(Err(error));
    }

    fn complete(&mut self, result: Result<Response, Error>) {
        self.state = State::Terminal;
        if let Some(tx) = self.tx.take() {
            // The caller may have dropped the future; nothing to deliver to.
            let _ = tx.send(result);
        }
    }

    /// Reclaims the sink from a handle that never saw a message, so the
    /// request can be replayed with it on another connection.
    pub(crate) fn take_sink(&mut self) -> Option<Box<dyn ResponseSink>> {
        self.sink.take()
    }
}

enum Slots {
    /// One in-flight exchange at a time; the id is recycled after removal.
    Http1 { occupied: bool },
    /// Stream-id keyed multiplexing; ids are successive odd integers.
    Http2 { next_id: u32 },
}

struct RegistryInner {
    slots: Slots,
    handles: HashMap<u32, HandleCell>,
}

/// Maps in-flight request ids to response handles for one connection.
pub(crate) struct HandleRegistry {
    inner: Mutex<RegistryInner>,
}

impl HandleRegistry {
    pub(crate) fn http1() -> HandleRegistry {
        HandleRegistry {
            inner: Mutex::new(RegistryInner {
                slots: Slots::Http1 { occupied: false },
                handles: HashMap::new(),
            }),
        }
    }

    pub(crate) fn http2() -> HandleRegistry {
        HandleRegistry {
            inner: Mutex::new(RegistryInner {
                slots: Slots::Http2 { next_id: 1 },
                handles: HashMap::new(),
            }),
        }
    }

    /// Allocates the next request id.
    ///
    /// HTTP/2 ids run 1, 3, 5, … and report exhaustion once the id space is
    /// spent, at which point the connection must not be reused. An HTTP/1.1
    /// allocation while another exchange is in flight is a programming
    /// contract violation, connections being strictly one-request-at-a-time.
    pub(crate) fn allocate(&self) -> Result<u32, Error> {
        let mut inner = self.inner.lock().expect("handle registry poisoned");
        match &mut inner.slots {
            Slots::Http1 { occupied } => {
                if *occupied {
                    if cfg!(debug_assertions) {
                        panic!("http/1.1 connection already has an in-flight request");
                    }
                    error!("http/1.1 connection already has an in-flight request");
                    return Err(Error::builder(
                        "http/1.1 connection already has an in-flight request",
                    ));
                }
                *occupied = true;
                Ok(1)
            }
            Slots::Http2 { next_id } => {
                if *next_id > MAX_STREAM_ID {
                    return Err(Error::stream_id_exhausted());
                }
                let id = *next_id;
                *next_id += 2;
                Ok(id)
            }
        }
    }

    /// Whether the next allocation would fail for id exhaustion.
    pub(crate) fn would_exhaust(&self) -> bool {
        let inner = self.inner.lock().expect("handle registry poisoned");
        match inner.slots {
            Slots::Http1 { .. } => false,
            Slots::Http2 { next_id } => next_id > MAX_STREAM_ID,
        }
    }

    pub(crate) fn insert(&self, id: u32, cell: HandleCell) {
        let mut inner = self.inner.lock().expect("handle registry poisoned");
        inner.handles.insert(id, cell);
    }

    pub(crate) fn get(&self, id: u32) -> Option<HandleCell> {
        let inner = self.inner.lock().expect("handle registry poisoned");
        inner.handles.get(&id).cloned()
    }

    /// Removes the handle for `id`, recycling the HTTP/1.1 slot.
    pub(crate) fn remove(&self, id: u32) -> Option<HandleCell> {
        let mut inner = self.inner.lock().expect("handle registry poisoned");
        let cell = inner.handles.remove(&id);
        if let Slots::Http1 { occupied } = &mut inner.slots {
            *occupied = false;
        }
        cell
    }

    pub(crate) fn len(&self) -> usize {
        let inner = self.inner.lock().expect("handle registry poisoned");
        inner.handles.len()
    }

    /// Fails every in-flight handle with a connection-scoped error and
    /// clears the registry.
    pub(crate) fn fail_all<F>(&self, make_error: F)
    where
        F: Fn() -> Error,
    {
        let drained: Vec<HandleCell> = {
            let mut inner = self.inner.lock().expect("handle registry poisoned");
            if let Slots::Http1 { occupied } = &mut inner.slots {
                *occupied = false;
            }
            inner.handles.drain().map(|(_, cell)| cell).collect()
        };
        for cell in drained {
            let mut handle = cell.lock().expect("response handle poisoned");
            handle.on_error(make_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, CONTENT_LENGTH};

    fn head_with_length(len: u64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        headers
    }

    #[test]
    fn http2_ids_are_increasing_odd_integers() {
        let registry = HandleRegistry::http2();
        let ids: Vec<u32> = (0..5).map(|_| registry.allocate().unwrap()).collect();
        assert_eq!(ids, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn http2_id_space_exhausts() {
        let registry = HandleRegistry::http2();
        {
            let mut inner = registry.inner.lock().unwrap();
            if let Slots::Http2 { next_id } = &mut inner.slots {
                *next_id = MAX_STREAM_ID;
            }
        }
        assert_eq!(registry.allocate().unwrap(), MAX_STREAM_ID);
        let err = registry.allocate().unwrap_err();
        assert!(err.is_stream_id_exhausted());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic)]
    fn http1_slot_rejects_overlap() {
        let registry = HandleRegistry::http1();
        registry.allocate().unwrap();
        let result = registry.allocate();
        assert!(result.is_err());
    }

    #[test]
    fn http1_slot_recycles_after_remove() {
        let registry = HandleRegistry::http1();
        let id = registry.allocate().unwrap();
        let (cell, _rx) = ResponseHandle::channel(1024, None);
        registry.insert(id, cell);
        registry.remove(id);
        assert!(registry.allocate().is_ok());
    }

    #[test]
    fn declared_content_length_over_limit_fails_before_data() {
        let (cell, mut rx) = ResponseHandle::channel(16, None);
        let mut handle = cell.lock().unwrap();
        let fault = handle
            .on_message(Version::HTTP_11, StatusCode::OK, head_with_length(17))
            .unwrap_err();
        assert_eq!(fault, HandleFault::OverSized);
        assert!(handle.is_terminal());

        let result = rx.try_recv().unwrap();
        assert!(result.unwrap_err().is_content_over_sized());
    }

    #[test]
    fn accumulated_body_over_limit_fails_at_overflow() {
        let (cell, mut rx) = ResponseHandle::channel(8, None);
        let mut handle = cell.lock().unwrap();
        handle
            .on_message(Version::HTTP_11, StatusCode::OK, HeaderMap::new())
            .unwrap();
        handle.on_data(Bytes::from_static(b"12345")).unwrap();
        let fault = handle.on_data(Bytes::from_static(b"6789")).unwrap_err();
        assert_eq!(fault, HandleFault::OverSized);

        // A terminal handle ignores all further events.
        handle.on_data(Bytes::from_static(b"more")).unwrap();
        handle.on_end().unwrap();

        let result = rx.try_recv().unwrap();
        assert!(result.unwrap_err().is_content_over_sized());
    }

    #[test]
    fn at_most_one_terminal_transition() {
        let (cell, mut rx) = ResponseHandle::channel(1024, None);
        let mut handle = cell.lock().unwrap();
        handle
            .on_message(Version::HTTP_11, StatusCode::OK, HeaderMap::new())
            .unwrap();
        handle.on_data(Bytes::from_static(b"ok")).unwrap();
        handle.on_end().unwrap();
        handle.on_error(Error::timeout());
        handle.on_end().unwrap();

        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(result.status(), StatusCode::OK);
        assert_eq!(result.body().as_ref(), b"ok");
    }

    #[test]
    fn trailers_recorded_once_before_end() {
        let (cell, mut rx) = ResponseHandle::channel(1024, None);
        let mut handle = cell.lock().unwrap();
        handle
            .on_message(Version::HTTP_11, StatusCode::OK, HeaderMap::new())
            .unwrap();

        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", HeaderValue::from_static("abc"));
        handle.on_trailers(trailers).unwrap();

        let mut second = HeaderMap::new();
        second.insert("x-checksum", HeaderValue::from_static("overwritten"));
        handle.on_trailers(second).unwrap();

        handle.on_end().unwrap();
        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(
            response.trailers().unwrap().get("x-checksum").unwrap(),
            "abc"
        );
    }

    #[test]
    fn sink_failure_faults_the_handle() {
        struct Failing;
        impl ResponseSink for Failing {
            fn on_data(&mut self, _chunk: Bytes) -> Result<(), crate::error::BoxError> {
                Err("consumer broke".into())
            }
        }

        let (cell, mut rx) = ResponseHandle::channel(1024, Some(Box::new(Failing)));
        let mut handle = cell.lock().unwrap();
        handle
            .on_message(Version::HTTP_11, StatusCode::OK, HeaderMap::new())
            .unwrap();
        let fault = handle.on_data(Bytes::from_static(b"x")).unwrap_err();
        assert_eq!(fault, HandleFault::Sink);
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn fail_all_completes_every_handle() {
        let registry = HandleRegistry::http2();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let id = registry.allocate().unwrap();
            let (cell, rx) = ResponseHandle::channel(1024, None);
            registry.insert(id, cell);
            receivers.push(rx);
        }
        assert!(registry.get(3).is_some());
        registry.fail_all(|| Error::closed_connection("connection lost"));
        assert_eq!(registry.len(), 0);
        assert!(registry.get(3).is_none());
        for mut rx in receivers {
            assert!(rx.try_recv().unwrap().is_err());
        }
    }
}
