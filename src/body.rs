use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{error::Error, multipart::Form};

/// A request body.
pub struct Body {
    pub(crate) kind: BodyKind,
}

pub(crate) enum BodyKind {
    Empty,
    Full(Bytes),
    File(PathBuf),
    Segmented(SegmentReceiver),
    Multipart(Form),
}

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body {
            kind: BodyKind::Empty,
        }
    }

    /// A body with known bytes. The transport sets `Content-Length` from it
    /// if the request does not carry one.
    pub fn full(data: impl Into<Bytes>) -> Body {
        Body {
            kind: BodyKind::Full(data.into()),
        }
    }

    /// A body streamed from a file. A missing file surfaces as an i/o error
    /// before any request bytes are written.
    pub fn file(path: impl Into<PathBuf>) -> Body {
        Body {
            kind: BodyKind::File(path.into()),
        }
    }

    /// A multipart form body.
    pub fn multipart(form: Form) -> Body {
        Body {
            kind: BodyKind::Multipart(form),
        }
    }

    /// A caller-driven body.
    ///
    /// Returns the body plus a [`SegmentSender`] supporting repeated
    /// [`write`](SegmentSender::write) calls and a terminal
    /// [`end`](SegmentSender::end). Segments submitted before the transport
    /// starts draining are buffered (bounded by `queue_length` segments and
    /// `buffer_limit` bytes) and flushed in submission order once it does.
    pub fn segmented(queue_length: usize, buffer_limit: usize) -> (SegmentSender, Body) {
        let (tx, rx) = mpsc::channel(queue_length.max(1));
        let gate = Arc::new(WriteGate::new(buffer_limit.max(1)));
        let sender = SegmentSender {
            tx,
            gate: gate.clone(),
        };
        let body = Body {
            kind: BodyKind::Segmented(SegmentReceiver { rx, gate }),
        };
        (sender, body)
    }

    /// The body length, when known up front.
    pub fn len(&self) -> Option<u64> {
        match &self.kind {
            BodyKind::Empty => Some(0),
            BodyKind::Full(data) => Some(data.len() as u64),
            _ => None,
        }
    }

    /// Whether the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Body {
        Body::full(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Body {
        Body::full(data)
    }
}

impl From<String> for Body {
    fn from(data: String) -> Body {
        Body::full(data)
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Body {
        Body::full(data)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            BodyKind::Empty => "Empty",
            BodyKind::Full(_) => "Full",
            BodyKind::File(_) => "File",
            BodyKind::Segmented(_) => "Segmented",
            BodyKind::Multipart(_) => "Multipart",
        };
        f.debug_struct("Body").field("kind", &kind).finish()
    }
}

pub(crate) enum Segment {
    Data(Bytes),
    End(Option<Bytes>),
}

/// Tracks bytes admitted into the segment queue but not yet flushed to the
/// transport. Admission past the high-water mark is rejected instead of
/// queueing unboundedly.
pub(crate) struct WriteGate {
    pending: AtomicUsize,
    high_water: usize,
}

impl WriteGate {
    fn new(high_water: usize) -> WriteGate {
        WriteGate {
            pending: AtomicUsize::new(0),
            high_water,
        }
    }

    fn admit(&self, n: usize) -> Result<(), Error> {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current + n > self.high_water {
                return Err(Error::write_buffer_full());
            }
            match self.pending.compare_exchange_weak(
                current,
                current + n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn release(&self, n: usize) {
        self.pending.fetch_sub(n, Ordering::AcqRel);
    }
}

/// Writer handle for a caller-driven request body.
///
/// Obtained from [`Body::segmented`]. Dropping the sender without calling
/// [`end`](SegmentSender::end) aborts the request body, which poisons the
/// connection carrying it.
#[derive(Clone)]
pub struct SegmentSender {
    tx: mpsc::Sender<Segment>,
    gate: Arc<WriteGate>,
}

impl SegmentSender {
    /// Queues one body segment.
    ///
    /// Fails with a write-buffer-full error when the segment queue or its
    /// byte budget is exhausted, and with a closed-connection error when the
    /// transport side has gone away.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        let data = data.into();
        self.gate.admit(data.len())?;
        self.send(Segment::Data(data))
    }

    /// Queues the terminal segment. An empty `data` ends the body without a
    /// final chunk.
    pub fn end(self, data: impl Into<Bytes>) -> Result<(), Error> {
        let data = data.into();
        self.gate.admit(data.len())?;
        let last = if data.is_empty() { None } else { Some(data) };
        self.send(Segment::End(last))
    }

    fn send(&self, segment: Segment) -> Result<(), Error> {
        let len = match &segment {
            Segment::Data(d) => d.len(),
            Segment::End(d) => d.as_ref().map(Bytes::len).unwrap_or(0),
        };
        self.tx.try_send(segment).map_err(|e| {
            self.gate.release(len);
            match e {
                mpsc::error::TrySendError::Full(_) => Error::write_buffer_full(),
                mpsc::error::TrySendError::Closed(_) => {
                    Error::closed_connection("segmented body receiver dropped")
                }
            }
        })
    }
}

impl fmt::Debug for SegmentSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentSender").finish()
    }
}

pub(crate) struct SegmentReceiver {
    rx: mpsc::Receiver<Segment>,
    gate: Arc<WriteGate>,
}

impl fmt::Debug for SegmentReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentReceiver").finish()
    }
}

impl SegmentReceiver {
    /// Receives the next queued segment, crediting its bytes back to the
    /// write gate.
    pub(crate) async fn recv(&mut self) -> Option<Segment> {
        let segment = self.rx.recv().await?;
        let len = match &segment {
            Segment::Data(d) => d.len(),
            Segment::End(d) => d.as_ref().map(Bytes::len).unwrap_or(0),
        };
        self.gate.release(len);
        Some(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn segments_flush_in_submission_order() {
        let (tx, body) = Body::segmented(16, 1024);
        for i in 0..10u8 {
            tx.write(vec![i]).unwrap();
        }
        tx.end(Bytes::new()).unwrap();

        let mut rx = match body.kind {
            BodyKind::Segmented(rx) => rx,
            _ => unreachable!(),
        };
        for i in 0..10u8 {
            match rx.recv().await.unwrap() {
                Segment::Data(d) => assert_eq!(d.as_ref(), &[i]),
                Segment::End(_) => panic!("end before all data"),
            }
        }
        assert!(matches!(rx.recv().await, Some(Segment::End(None))));
    }

    #[tokio::test]
    async fn full_queue_rejects_instead_of_blocking() {
        let (tx, _body) = Body::segmented(2, 1024);
        tx.write("a").unwrap();
        tx.write("b").unwrap();
        let err = tx.write("c").unwrap_err();
        assert!(err.is_write_buffer_full());
    }

    #[tokio::test]
    async fn byte_budget_rejects_oversized_backlog() {
        let (tx, _body) = Body::segmented(16, 8);
        tx.write("12345").unwrap();
        let err = tx.write("67890").unwrap_err();
        assert!(err.is_write_buffer_full());
    }

    #[test]
    fn known_lengths() {
        assert_eq!(Body::empty().len(), Some(0));
        assert_eq!(Body::full("abcd").len(), Some(4));
        assert_eq!(Body::file("/tmp/x").len(), None);
    }
}
