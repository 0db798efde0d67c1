use paumiot_core::error::Result;
use paumiot_protocol::{
    pal::coap::{CoapPacket, CoapType, CODE_CONTENT, MAX_TOKEN_LEN, OPTION_OBSERVE, PAYLOAD_MARKER},
    EnumConverter, Protocol,
};
use serde_json::json;
use tracing::{debug, trace};

use super::HandlerContext;
use crate::{
    connection::{ConnectionRecord, ProtocolData, SessionFlags, SessionState},
    event_types::Action,
};

/// Upper bound on [`content_reply`] and [`reset_reply`] sizes.
pub const MAX_REPLY_LEN: usize = 64;

/// Builds the piggybacked `2.05 Content` reply to `request`.
pub fn content_reply(request: &CoapPacket) -> Vec<u8> {
    let body = json!({ "status": "ok", "protocol": "CoAP" }).to_string();
    let mut reply = Vec::with_capacity(4 + request.token.len() + 1 + body.len());
    reply.push((1 << 6) | (CoapType::Acknowledgement.to_u8() << 4) | request.token.len() as u8);
    reply.push(CODE_CONTENT);
    reply.extend_from_slice(&request.message_id.to_be_bytes());
    reply.extend_from_slice(&request.token);
    reply.push(PAYLOAD_MARKER);
    reply.extend_from_slice(body.as_bytes());
    reply
}

/// Builds a RST for `message_id`.
pub fn reset_reply(message_id: u16) -> Vec<u8> {
    let [hi, lo] = message_id.to_be_bytes();
    vec![(1 << 6) | (CoapType::Reset.to_u8() << 4), 0x00, hi, lo]
}

fn respond(
    packet: &CoapPacket,
    bytes: &[u8],
    ctx: &mut HandlerContext<'_>,
) -> Result<Vec<Action>> {
    if packet.is_empty() {
        if packet.kind == CoapType::Confirmable {
            trace!("[COAP] ping, mid {:#06x}", packet.message_id);
            return Ok(vec![Action::Reply(reset_reply(packet.message_id))]);
        }
        return Ok(Vec::new());
    }
    if !packet.is_request() {
        trace!("[COAP] ignoring {}.{:02} message", packet.code_class(), packet.code_detail());
        return Ok(Vec::new());
    }

    debug!(
        "[COAP] request {}.{:02} for {:?}, mid {:#06x}",
        packet.code_class(),
        packet.code_detail(),
        packet.uri_path(),
        packet.message_id
    );
    let message = ctx.pal.decode_packet(Protocol::Coap, bytes)?;
    Ok(vec![Action::Reply(content_reply(packet)), Action::Forward(message)])
}

/// Handles a CoAP message that arrived over TCP.
pub fn handle(
    record: &mut ConnectionRecord,
    frame: &[u8],
    ctx: &mut HandlerContext<'_>,
) -> Result<Vec<Action>> {
    let packet = CoapPacket::parse(frame)?;
    let observe = packet.option(OPTION_OBSERVE).map(|option| option.as_uint());
    if let ProtocolData::Coap(data) = record.data_mut() {
        data.message_id = packet.message_id;
        let len = packet.token.len().min(MAX_TOKEN_LEN);
        data.token[..len].copy_from_slice(&packet.token[..len]);
        data.token_len = len as u8;
        if let Some(sequence) = observe {
            data.observe_seq = sequence;
        }
    }
    if observe.is_some() {
        record.flags.insert(SessionFlags::OBSERVE_ACTIVE);
    }

    let mut actions = respond(&packet, frame, ctx)?;
    if packet.is_request() {
        record.session_state = SessionState::Active;
    }
    for action in actions.iter_mut() {
        if let Action::Forward(message) = action {
            message.source = Some(record.session_id().to_owned());
        }
    }
    Ok(actions)
}

/// Handles a CoAP datagram.
pub fn handle_datagram(datagram: &[u8], ctx: &mut HandlerContext<'_>) -> Result<Vec<Action>> {
    let packet = CoapPacket::parse(datagram)?;
    respond(&packet, datagram, ctx)
}
