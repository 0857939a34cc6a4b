use super::{FilterStep, SniffError};

/// Methods the sniffer treats as the start of an HTTP request,
/// including the WebDAV set.
const HTTP_METHODS: &[&str] = &[
    "GET", "PUT", "POST", "COPY", "MOVE", "LOCK", "HEAD", "MKCOL", "PATCH", "TRACE", "DELETE",
    "UNLOCK", "OPTIONS", "PROPFIND", "PROPPATCH",
];

/// Length of the longest recognized method ("PROPPATCH").
const LONGEST_METHOD_LEN: usize = 9;

const MAX_HEADERS: usize = 64;

/// Inspects buffered bytes for an HTTP request and extracts the Host
/// header. On success the whole request head is reported as consumed so
/// the pipeline replays it verbatim to the upstream.
pub fn inspect(buf: &[u8]) -> FilterStep {
    let Some(&first) = buf.first() else {
        return FilterStep::Again(1);
    };

    if !(first.is_ascii_uppercase() || first == b'_' || first == b'-') {
        return FilterStep::Continue;
    }

    // Enough bytes to hold the longest method plus the following space.
    if buf.len() < LONGEST_METHOD_LEN + 1 {
        return FilterStep::Again(LONGEST_METHOD_LEN + 1);
    }

    let prefix = &buf[..LONGEST_METHOD_LEN + 1];
    let Some(space) = prefix.iter().position(|&b| b == b' ') else {
        return FilterStep::Continue;
    };
    let method = &prefix[..space];
    if !HTTP_METHODS.iter().any(|m| m.as_bytes() == method) {
        return FilterStep::Continue;
    }

    // Recognized method: commit to a full request-head parse.
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => match host_header(&headers) {
            Some(host) => FilterStep::Stop {
                host,
                consumed: head_len,
            },
            None => FilterStep::Fail(SniffError::MissingHost),
        },
        Ok(httparse::Status::Partial) => FilterStep::Again(buf.len() + 512),
        Err(e) => FilterStep::Fail(SniffError::Http(e)),
    }
}

/// Returns the Host header value with any `:port` suffix stripped.
fn host_header(headers: &[httparse::Header<'_>]) -> Option<String> {
    let value = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| h.value)?;
    let value = std::str::from_utf8(value).ok()?.trim();
    if value.is_empty() {
        return None;
    }
    // IPv6 literals keep their brackets; only strip a port after them.
    let host = if let Some(rest) = value.strip_prefix('[') {
        let end = rest.find(']')?;
        &value[..end + 2]
    } else {
        value.split(':').next()?
    };
    Some(host.to_string())
}
