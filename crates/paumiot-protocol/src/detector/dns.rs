use crate::{
    dns::{parse_question, strip_tcp_prefix, DnsHeader, HEADER_LEN},
    protocol::Transport,
};

const MAX_SECTION_COUNT: u16 = 100;

pub(super) fn validate(bytes: &[u8], _transport: Transport) -> Option<u8> {
    let (msg, _) = strip_tcp_prefix(bytes);
    let header = DnsHeader::parse(msg).ok()?;

    if header.opcode() > 2 {
        return None;
    }
    if header.is_response() && header.rcode() > 5 {
        return None;
    }
    if [header.qd, header.an, header.ns, header.ar].iter().any(|count| *count > MAX_SECTION_COUNT) {
        return None;
    }

    let mut confidence: u8 = 60;
    if header.qd >= 1 {
        let question = parse_question(msg, HEADER_LEN).ok()?;
        if question.qclass != 1 && question.qclass != 255 {
            return None;
        }
        confidence += 15;

        let trailing_records = header.an > 0 || header.ns > 0 || header.ar > 0;
        if question.end == msg.len() || (trailing_records && question.end < msg.len()) {
            confidence += 5;
        }
    }
    if !header.is_response() && header.rcode() == 0 {
        confidence += 10;
    }
    if header.is_response() || (header.an == 0 && header.ns == 0) {
        confidence += 10;
    }
    Some(confidence.min(100))
}
