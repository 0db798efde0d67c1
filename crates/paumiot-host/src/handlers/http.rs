use paumiot_core::error::Result;
use paumiot_protocol::{
    http::{build_response, HttpRequest},
    message::iso8601_now,
};
use tracing::info;

use crate::{
    connection::{ConnectionRecord, HttpData, ProtocolData, SessionFlags, SessionState},
    event_types::Action,
};

/// Answers one HTTP request header block with the JSON status document.
pub fn handle(record: &mut ConnectionRecord, frame: &[u8]) -> Result<Vec<Action>> {
    let request = HttpRequest::parse(frame)?;
    let close = request.wants_close();
    info!("[HTTP] {} {} {} from {}", request.method, request.uri, request.version, record.peer());

    let mut reply = Vec::new();
    build_response(&request, record.confidence, &iso8601_now(), &mut reply);

    record.session_state = SessionState::Active;
    record.flags.set(SessionFlags::HTTP_KEEP_ALIVE, !close);
    if let ProtocolData::Http(data) = record.data_mut() {
        *data = HttpData {
            method: request.method,
            uri: request.uri,
            version: request.version,
            host: request.host,
            user_agent: request.user_agent,
            content_length: request.content_length,
            close,
        };
    }

    let mut actions = vec![Action::Reply(reply)];
    if close {
        actions.push(Action::Close);
    }
    Ok(actions)
}
