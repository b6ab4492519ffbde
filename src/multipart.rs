//! Multipart form bodies.
//!
//! A [`Form`] is a list of attribute and file parts encoded as
//! `multipart/form-data`. When multipart encoding is disabled on the form
//! and no file parts are present, the form falls back to a single
//! `application/x-www-form-urlencoded` body.

use std::{borrow::Cow, fmt, path::PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use mime::Mime;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};

use crate::error::Error;

// https://tools.ietf.org/html/rfc8187#section-3.2.1
const ATTR_CHAR_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// An asynchronous multipart/form-data request body.
pub struct Form {
    boundary: String,
    parts: Vec<Part>,
    multipart_encoded: bool,
}

/// A field in a multipart form.
pub struct Part {
    name: String,
    kind: PartKind,
    mime: Option<Mime>,
    file_name: Option<String>,
}

enum PartKind {
    Text(String),
    Bytes(Bytes),
    File(PathBuf),
}

impl Form {
    /// Creates a new form with a random boundary.
    pub fn new() -> Form {
        Form {
            boundary: format!(
                "{:016x}-{:016x}-{:016x}-{:016x}",
                fast_random(),
                fast_random(),
                fast_random(),
                fast_random()
            ),
            parts: Vec::new(),
            multipart_encoded: true,
        }
    }

    /// The boundary used by this form.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Adds a text attribute part.
    pub fn text<N, V>(mut self, name: N, value: V) -> Form
    where
        N: Into<String>,
        V: Into<String>,
    {
        self.parts.push(Part::text(name, value));
        self
    }

    /// Adds a raw bytes part.
    pub fn bytes<N>(mut self, name: N, data: impl Into<Bytes>) -> Form
    where
        N: Into<String>,
    {
        self.parts.push(Part::bytes(name, data));
        self
    }

    /// Adds a file part. The content type is guessed from the file
    /// extension, and the file name is taken from the path.
    pub fn file<N>(mut self, name: N, path: impl Into<PathBuf>) -> Form
    where
        N: Into<String>,
    {
        self.parts.push(Part::file(name, path));
        self
    }

    /// Adds a prepared part.
    pub fn part(mut self, part: Part) -> Form {
        self.parts.push(part);
        self
    }

    /// Controls whether the form is encoded as `multipart/form-data`.
    ///
    /// When disabled and the form has no file parts, it is sent as a single
    /// `application/x-www-form-urlencoded` body instead.
    pub fn multipart_encoded(mut self, enabled: bool) -> Form {
        self.multipart_encoded = enabled;
        self
    }

    pub(crate) fn has_file_parts(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p.kind, PartKind::File(_)))
    }

    /// The value for the `Content-Type` header of the encoded body.
    pub(crate) fn content_type(&self) -> String {
        if self.is_urlencoded() {
            "application/x-www-form-urlencoded".to_owned()
        } else {
            format!("multipart/form-data; boundary={}", self.boundary)
        }
    }

    fn is_urlencoded(&self) -> bool {
        !self.multipart_encoded && !self.has_file_parts()
    }

    /// Encodes the whole form into one buffer. File parts are read here, so
    /// a missing file fails the request before anything hits the wire.
    pub(crate) async fn encode(&self) -> Result<Bytes, Error> {
        if self.is_urlencoded() {
            let pairs: Vec<(&str, Cow<'_, str>)> = self
                .parts
                .iter()
                .map(|p| {
                    let value = match &p.kind {
                        PartKind::Text(text) => Cow::Borrowed(text.as_str()),
                        PartKind::Bytes(data) => String::from_utf8_lossy(data),
                        PartKind::File(_) => unreachable!("urlencoded form has no file parts"),
                    };
                    (p.name.as_str(), value)
                })
                .collect();
            let encoded = serde_urlencoded::to_string(&pairs).map_err(Error::builder)?;
            return Ok(Bytes::from(encoded));
        }

        let mut buf = BytesMut::new();
        for part in &self.parts {
            buf.put_slice(b"--");
            buf.put_slice(self.boundary.as_bytes());
            buf.put_slice(b"\r\n");
            part.write_headers(&mut buf);
            match &part.kind {
                PartKind::Text(text) => buf.put_slice(text.as_bytes()),
                PartKind::Bytes(data) => buf.put_slice(data),
                PartKind::File(path) => {
                    let contents = tokio::fs::read(path).await.map_err(Error::io)?;
                    buf.put_slice(&contents);
                }
            }
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"--");
        buf.put_slice(self.boundary.as_bytes());
        buf.put_slice(b"--\r\n");
        Ok(buf.freeze())
    }
}

impl Default for Form {
    fn default() -> Self {
        Form::new()
    }
}

impl fmt::Debug for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Form")
            .field("boundary", &self.boundary)
            .field("parts", &self.parts.len())
            .finish()
    }
}

impl Part {
    /// A text attribute part.
    pub fn text<N, V>(name: N, value: V) -> Part
    where
        N: Into<String>,
        V: Into<String>,
    {
        Part {
            name: name.into(),
            kind: PartKind::Text(value.into()),
            mime: None,
            file_name: None,
        }
    }

    /// A raw bytes part.
    pub fn bytes<N>(name: N, data: impl Into<Bytes>) -> Part
    where
        N: Into<String>,
    {
        Part {
            name: name.into(),
            kind: PartKind::Bytes(data.into()),
            mime: None,
            file_name: None,
        }
    }

    /// A file part. The content type is guessed from the extension and the
    /// file name is taken from the path's last component.
    pub fn file<N>(name: N, path: impl Into<PathBuf>) -> Part
    where
        N: Into<String>,
    {
        let path = path.into();
        let mime = mime_guess::from_path(&path).first();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Part {
            name: name.into(),
            kind: PartKind::File(path),
            mime,
            file_name,
        }
    }

    /// Overrides the part's content type.
    pub fn mime(mut self, mime: Mime) -> Part {
        self.mime = Some(mime);
        self
    }

    /// Overrides the part's file name.
    pub fn file_name(mut self, file_name: impl Into<String>) -> Part {
        self.file_name = Some(file_name.into());
        self
    }

    fn write_headers(&self, buf: &mut BytesMut) {
        buf.put_slice(b"Content-Disposition: form-data; name=\"");
        buf.put_slice(percent_escape(&self.name).as_bytes());
        buf.put_slice(b"\"");
        if let Some(file_name) = &self.file_name {
            buf.put_slice(b"; filename=\"");
            buf.put_slice(percent_escape(file_name).as_bytes());
            buf.put_slice(b"\"");
        }
        buf.put_slice(b"\r\n");
        if let Some(mime) = &self.mime {
            buf.put_slice(b"Content-Type: ");
            buf.put_slice(mime.as_ref().as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
    }
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("name", &self.name)
            .field("file_name", &self.file_name)
            .finish()
    }
}

fn percent_escape(value: &str) -> Cow<'_, str> {
    percent_encoding::utf8_percent_encode(value, ATTR_CHAR_ENCODE_SET).into()
}

// xor-shift
fn fast_random() -> u64 {
    use std::cell::Cell;
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::num::Wrapping;

    thread_local! {
        static RNG: Cell<Wrapping<u64>> = Cell::new(Wrapping(seed()));
    }

    fn seed() -> u64 {
        let seed = RandomState::new();

        let mut out = 0;
        let mut cnt = 0;
        while out == 0 {
            cnt += 1;
            let mut hasher = seed.build_hasher();
            hasher.write_usize(cnt);
            out = hasher.finish();
        }
        out
    }

    RNG.with(|rng| {
        let mut n = rng.get();
        debug_assert_ne!(n.0, 0);
        n ^= n >> 12;
        n ^= n << 25;
        n ^= n >> 27;
        rng.set(n);
        n.0.wrapping_mul(0x2545_f491_4f6c_dd1d)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multipart_body_has_boundary_and_parts() {
        let form = Form::new().text("key", "value").bytes("raw", "abc");
        let boundary = form.boundary().to_owned();
        let body = form.encode().await.unwrap();
        let body = std::str::from_utf8(&body).unwrap();

        assert!(body.starts_with(&format!("--{boundary}\r\n")));
        assert!(body.contains("Content-Disposition: form-data; name=\"key\""));
        assert!(body.contains("value"));
        assert!(body.contains("name=\"raw\""));
        assert!(body.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[tokio::test]
    async fn urlencoded_fallback_without_file_parts() {
        let form = Form::new()
            .text("foo", "bar")
            .text("baz", "qu ux")
            .multipart_encoded(false);
        assert_eq!(form.content_type(), "application/x-www-form-urlencoded");
        let body = form.encode().await.unwrap();
        assert_eq!(body.as_ref(), b"foo=bar&baz=qu+ux");
    }

    #[tokio::test]
    async fn file_parts_force_multipart() {
        let form = Form::new()
            .text("foo", "bar")
            .file("data", "/does/not/matter")
            .multipart_encoded(false);
        assert!(form.content_type().starts_with("multipart/form-data"));
    }

    #[tokio::test]
    async fn missing_file_fails_before_encoding() {
        let form = Form::new().file("data", "/definitely/not/here.bin");
        let err = form.encode().await.unwrap_err();
        assert!(format!("{err}").contains("i/o error"));
    }

    #[test]
    fn boundaries_are_unique() {
        assert_ne!(Form::new().boundary(), Form::new().boundary());
    }
}
