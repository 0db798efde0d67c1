//! Inline HTTP/1.x request decoding and the gateway's fixed JSON response.

use paumiot_core::{
    constants::GATEWAY_VERSION,
    error::{DecodingErrorKind, ErrorKind, Result},
};
use serde_json::json;

/// Request methods the gateway recognises.
pub const METHODS: [&str; 9] =
    ["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT"];

/// Longest escaped URI echoed back in a response body.
pub const MAX_ECHOED_URI: usize = 256;

/// Upper bound on the size of a response from [`build_response`].
pub const MAX_RESPONSE_LEN: usize = 640;

/// Length-bounded subslice search.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Returns the length of the header block including its `\r\n\r\n` terminator.
pub fn header_block_len(bytes: &[u8]) -> Option<usize> {
    find(bytes, b"\r\n\r\n").map(|pos| pos + 4)
}

/// Request line and the subset of headers the gateway looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method, e.g. `GET`
    pub method: String,
    /// Request target as sent
    pub uri: String,
    /// Protocol version, e.g. `HTTP/1.1`
    pub version: String,
    /// `Host` header
    pub host: Option<String>,
    /// `User-Agent` header
    pub user_agent: Option<String>,
    /// `Connection` header
    pub connection: Option<String>,
    /// `Content-Length` header; bodies are not framed
    pub content_length: Option<usize>,
}

impl HttpRequest {
    /// Parses the request line and headers of `bytes`.
    ///
    /// A missing blank line is tolerated; headers are read up to the end of the buffer.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let head_len = header_block_len(bytes).unwrap_or(bytes.len());
        let head = std::str::from_utf8(&bytes[..head_len])
            .map_err(|_| ErrorKind::MalformedPacket(DecodingErrorKind::Utf8))?;

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_ascii_whitespace();
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(uri), Some(version)) if version.starts_with("HTTP/") => {
                (method, uri, version)
            }
            _ => return Err(ErrorKind::MalformedPacket(DecodingErrorKind::Header)),
        };
        if !METHODS.contains(&method) {
            return Err(ErrorKind::NotSupported("HTTP method"));
        }

        let mut request = HttpRequest {
            method: method.to_owned(),
            uri: uri.to_owned(),
            version: version.to_owned(),
            ..Default::default()
        };

        for line in lines.take_while(|line| !line.is_empty()) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.eq_ignore_ascii_case("host") {
                request.host = Some(value.to_owned());
            } else if name.eq_ignore_ascii_case("user-agent") {
                request.user_agent = Some(value.to_owned());
            } else if name.eq_ignore_ascii_case("connection") {
                request.connection = Some(value.to_owned());
            } else if name.eq_ignore_ascii_case("content-length") {
                request.content_length = value.parse().ok();
            }
        }
        Ok(request)
    }

    /// Returns true if the connection should close after the response.
    pub fn wants_close(&self) -> bool {
        match self.connection.as_deref() {
            Some(value) if value.eq_ignore_ascii_case("close") => true,
            Some(value) if value.eq_ignore_ascii_case("keep-alive") => false,
            _ => self.version == "HTTP/1.0",
        }
    }
}

/// Longest prefix of `uri` whose JSON-escaped form fits in [`MAX_ECHOED_URI`] bytes.
fn echoed_uri(uri: &str) -> &str {
    let mut escaped = 0;
    for (at, c) in uri.char_indices() {
        escaped += match c {
            '"' | '\\' => 2,
            c if (c as u32) < 0x20 => 6,
            c => c.len_utf8(),
        };
        if escaped > MAX_ECHOED_URI {
            return &uri[..at];
        }
    }
    uri
}

/// Appends the `200 OK` JSON response for `request` to `out`.
///
/// Long request targets are truncated in the body, so the response never
/// exceeds [`MAX_RESPONSE_LEN`].
pub fn build_response(
    request: &HttpRequest,
    detection_confidence: u8,
    timestamp: &str,
    out: &mut Vec<u8>,
) -> usize {
    let body = json!({
        "status": "success",
        "protocol": "HTTP",
        "method": request.method,
        "uri": echoed_uri(&request.uri),
        "detection_confidence": detection_confidence,
        "timestamp": timestamp,
    })
    .to_string();
    let connection = if request.wants_close() { "close" } else { "keep-alive" };

    let start = out.len();
    out.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    out.extend_from_slice(b"Content-Type: application/json\r\n");
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(format!("Server: PaumIoT/{}\r\n", GATEWAY_VERSION).as_bytes());
    out.extend_from_slice(b"Access-Control-Allow-Origin: *\r\n");
    out.extend_from_slice(format!("Connection: {}\r\n\r\n", connection).as_bytes());
    out.extend_from_slice(body.as_bytes());
    out.len() - start
}
