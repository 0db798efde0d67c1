use paumiot_core::error::Result;
use paumiot_protocol::dns::{build_response, strip_tcp_prefix, DnsQuery};
use tracing::{debug, trace};

use crate::{
    connection::{ConnectionRecord, ProtocolData, SessionFlags, SessionState},
    event_types::Action,
};

const FLAG_RD: u16 = 0x0100;

/// Bytes a response adds to its query: the answer record and a TCP length prefix.
pub const ANSWER_OVERHEAD: usize = 16 + 2;

fn answer(query: &DnsQuery, msg: &[u8], tcp_prefix: bool) -> Result<Vec<Action>> {
    if query.header.is_response() {
        trace!("[DNS] ignoring response {:#06x}", query.header.id);
        return Ok(Vec::new());
    }
    debug!(
        "[DNS] query {:#06x} for {:?}",
        query.header.id,
        query.question.as_ref().map(|question| question.name.as_str())
    );
    let mut reply = Vec::new();
    build_response(msg, tcp_prefix, &mut reply)?;
    Ok(vec![Action::Reply(reply)])
}

/// Answers a DNS query that arrived over TCP, with or without a length prefix.
pub fn handle(record: &mut ConnectionRecord, frame: &[u8]) -> Result<Vec<Action>> {
    let (msg, tcp_prefix) = strip_tcp_prefix(frame);
    let query = DnsQuery::parse(msg)?;

    record.session_state = SessionState::Active;
    record.flags.set(SessionFlags::DNS_RECURSIVE, query.header.flags & FLAG_RD != 0);
    if let ProtocolData::Dns(data) = record.data_mut() {
        data.xid = query.header.id;
        data.flags = query.header.flags;
        data.qd = query.header.qd;
        data.an = query.header.an;
        if let Some(question) = &query.question {
            data.qname = question.name.clone();
            data.qtype = question.qtype;
        }
    }
    answer(&query, msg, tcp_prefix)
}

/// Answers a DNS datagram.
pub fn handle_datagram(datagram: &[u8]) -> Result<Vec<Action>> {
    let query = DnsQuery::parse(datagram)?;
    answer(&query, datagram, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use paumiot_protocol::Protocol;

    const QUERY: [u8; 29] = [
        0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, b'e', b'x',
        b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01, 0x00, 0x01,
    ];

    #[test]
    fn test_datagram_answer() {
        let actions = handle_datagram(&QUERY).unwrap();
        let Action::Reply(reply) = &actions[0] else { panic!("expected a reply") };
        assert_eq!(&reply[..2], &[0x00, 0x01]);
        assert_eq!(reply[2] & 0x80, 0x80);
        assert_eq!(&reply[6..8], &[0x00, 0x01]);
        assert_eq!(&reply[reply.len() - 10..reply.len() - 6], &[0x00, 0x00, 0x01, 0x2C]);
        assert_eq!(&reply[reply.len() - 4..], &[0x7F, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_tcp_answer_keeps_prefix() {
        let mut record = ConnectionRecord::detached(Protocol::Dns);
        let mut framed = vec![0x00, QUERY.len() as u8];
        framed.extend_from_slice(&QUERY);

        let actions = handle(&mut record, &framed).unwrap();
        let Action::Reply(reply) = &actions[0] else { panic!("expected a reply") };
        assert_eq!(u16::from_be_bytes([reply[0], reply[1]]) as usize, reply.len() - 2);
        assert!(record.flags.contains(SessionFlags::DNS_RECURSIVE));
        match record.data() {
            ProtocolData::Dns(data) => {
                assert_eq!(data.qname, "example.com");
                assert_eq!(data.qtype, 1);
                assert_eq!(data.xid, 1);
            }
            other => panic!("unexpected data {:?}", other),
        }
    }

    #[test]
    fn test_responses_are_not_answered() {
        let mut response = QUERY;
        response[2] |= 0x80;
        assert!(handle_datagram(&response).unwrap().is_empty());
        assert!(handle_datagram(&QUERY[..8]).is_err());
    }
}
