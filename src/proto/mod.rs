pub(crate) mod h1;
pub(crate) mod h2;
pub(crate) mod handle;

use http::{
    header::{self, HeaderMap, HeaderValue},
    Method,
};

/// Parses every `Content-Length` value; returns `None` unless all values are
/// valid and agree.
pub(crate) fn content_length_parse_all(headers: &HeaderMap) -> Option<u64> {
    let mut parsed = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let len = value.to_str().ok()?.trim().parse::<u64>().ok()?;
        match parsed {
            Some(prev) if prev != len => return None,
            _ => parsed = Some(len),
        }
    }
    parsed
}

pub(crate) fn set_content_length_if_missing(headers: &mut HeaderMap, len: u64) {
    headers
        .entry(header::CONTENT_LENGTH)
        .or_insert_with(|| HeaderValue::from(len));
}

fn connection_has(value: &HeaderValue, needle: &str) -> bool {
    if let Ok(s) = value.to_str() {
        for token in s.split(',') {
            if token.trim().eq_ignore_ascii_case(needle) {
                return true;
            }
        }
    }
    false
}

pub(crate) fn connection_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .any(|v| connection_has(v, "close"))
}

pub(crate) fn connection_keep_alive(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .any(|v| connection_has(v, "keep-alive"))
}

pub(crate) fn transfer_encoding_is_chunked(headers: &HeaderMap) -> bool {
    // The last listed transfer-coding must be chunked.
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .last()
        .map(|v| {
            v.to_str()
                .ok()
                .and_then(|s| s.split(',').next_back())
                .map(|token| token.trim().eq_ignore_ascii_case("chunked"))
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

/// Whether requests with this method conventionally carry a body.
pub(crate) fn method_has_defined_payload_semantics(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD && *method != Method::CONNECT
}

/// Removes connection-level headers that must not travel over HTTP/2.
pub(crate) fn strip_connection_headers(headers: &mut HeaderMap) {
    for name in [
        "connection",
        "keep-alive",
        "proxy-connection",
        "transfer-encoding",
        "upgrade",
        "http2-settings",
    ] {
        headers.remove(name);
    }

    if headers
        .get(header::TE)
        .map(|te| !connection_has(te, "trailers"))
        .unwrap_or(false)
    {
        headers.remove(header::TE);
    }

    // The authority pseudo-header carries this instead.
    headers.remove(header::HOST);
}
