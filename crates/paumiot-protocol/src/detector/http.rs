use crate::{
    http::{find, METHODS},
    protocol::Transport,
};

const MIN_LEN: usize = 14;

pub(super) fn validate(bytes: &[u8], _transport: Transport) -> Option<u8> {
    if bytes.len() < MIN_LEN {
        return None;
    }
    let method = METHODS.iter().find(|method| {
        bytes.len() > method.len()
            && bytes.starts_with(method.as_bytes())
            && bytes[method.len()] == b' '
    })?;

    let version_at = find(bytes, b"HTTP/")?;
    let version = bytes.get(version_at + 5..version_at + 8)?;
    if !(version[0].is_ascii_digit() && version[1] == b'.' && version[2].is_ascii_digit()) {
        return None;
    }
    find(bytes, b"\r\n")?;

    let mut confidence: u8 = 80;
    if has_host_header(bytes) {
        confidence += 10;
    }
    if find(bytes, b"\r\n\r\n").is_some() {
        confidence += 5;
    }
    if version == b"1.1" || version == b"1.0" {
        confidence += 5;
    }
    tracing::trace!("[DETECTION] HTTP method {} accepted", method);
    Some(confidence.min(100))
}

fn has_host_header(bytes: &[u8]) -> bool {
    bytes
        .windows(7)
        .any(|window| window[..2] == *b"\r\n" && window[2..].eq_ignore_ascii_case(b"host:"))
}
