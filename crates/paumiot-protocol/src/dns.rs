//! Inline DNS decoding and the synthetic single-A-record response.

use byteorder::{BigEndian, ByteOrder};
use paumiot_core::error::{DecodingErrorKind, ErrorKind, Result};

/// Size of the fixed DNS header.
pub const HEADER_LEN: usize = 12;
/// TTL of the synthetic answer, in seconds.
pub const ANSWER_TTL: u32 = 300;
/// Address returned for every query.
pub const ANSWER_ADDR: [u8; 4] = [127, 0, 0, 1];

const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 8;

/// Fixed 12-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    /// Transaction id
    pub id: u16,
    /// Flags word (QR, OPCODE, AA, TC, RD, RA, Z, RCODE)
    pub flags: u16,
    /// Question count
    pub qd: u16,
    /// Answer count
    pub an: u16,
    /// Authority count
    pub ns: u16,
    /// Additional count
    pub ar: u16,
}

impl DnsHeader {
    /// Parses the header at the start of `msg`.
    pub fn parse(msg: &[u8]) -> Result<Self> {
        if msg.len() < HEADER_LEN {
            return Err(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated));
        }
        Ok(Self {
            id: BigEndian::read_u16(&msg[0..2]),
            flags: BigEndian::read_u16(&msg[2..4]),
            qd: BigEndian::read_u16(&msg[4..6]),
            an: BigEndian::read_u16(&msg[6..8]),
            ns: BigEndian::read_u16(&msg[8..10]),
            ar: BigEndian::read_u16(&msg[10..12]),
        })
    }

    /// True for a response (QR bit set).
    pub fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// OPCODE field.
    pub fn opcode(&self) -> u8 {
        ((self.flags >> 11) & 0x0F) as u8
    }

    /// RCODE field.
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x0F) as u8
    }
}

/// First entry of the question section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    /// Dotted name, e.g. `example.com`
    pub name: String,
    /// QTYPE
    pub qtype: u16,
    /// QCLASS
    pub qclass: u16,
    /// Offset just past QCLASS
    pub end: usize,
}

/// Parses the question starting at `offset` of `msg`.
///
/// Labels must be at most 63 bytes and every byte read stays inside `msg`.
pub fn parse_question(msg: &[u8], offset: usize) -> Result<DnsQuestion> {
    let malformed = || ErrorKind::MalformedPacket(DecodingErrorKind::QuestionName);

    let mut name = String::new();
    let mut pos = offset;
    let mut end_of_name = None;
    let mut hops = 0;

    loop {
        let len = *msg.get(pos).ok_or_else(malformed)? as usize;
        match len & 0xC0 {
            0x00 if len == 0 => {
                end_of_name.get_or_insert(pos + 1);
                break;
            }
            0x00 => {
                let label = msg.get(pos + 1..pos + 1 + len).ok_or_else(malformed)?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.extend(label.iter().map(|b| *b as char));
                if name.len() > MAX_NAME_LEN {
                    return Err(malformed());
                }
                pos += 1 + len;
            }
            0xC0 => {
                let low = *msg.get(pos + 1).ok_or_else(malformed)? as usize;
                end_of_name.get_or_insert(pos + 2);
                hops += 1;
                let target = ((len & 0x3F) << 8) | low;
                if hops > MAX_POINTER_HOPS || target >= msg.len() {
                    return Err(malformed());
                }
                pos = target;
            }
            _ => return Err(malformed()),
        }
    }

    let name_end = end_of_name.ok_or_else(malformed)?;
    let fixed = msg
        .get(name_end..name_end + 4)
        .ok_or(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated))?;
    Ok(DnsQuestion {
        name,
        qtype: BigEndian::read_u16(&fixed[0..2]),
        qclass: BigEndian::read_u16(&fixed[2..4]),
        end: name_end + 4,
    })
}

/// Strips an RFC 1035 TCP length prefix if it matches the buffer.
pub fn strip_tcp_prefix(bytes: &[u8]) -> (&[u8], bool) {
    if bytes.len() >= HEADER_LEN + 2 && BigEndian::read_u16(&bytes[0..2]) as usize == bytes.len() - 2 {
        (&bytes[2..], true)
    } else {
        (bytes, false)
    }
}

/// Decoded query: header plus the first question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    /// Fixed header
    pub header: DnsHeader,
    /// First question, when QDCOUNT > 0
    pub question: Option<DnsQuestion>,
}

impl DnsQuery {
    /// Parses a message without a TCP length prefix.
    pub fn parse(msg: &[u8]) -> Result<Self> {
        let header = DnsHeader::parse(msg)?;
        let question = if header.qd > 0 { Some(parse_question(msg, HEADER_LEN)?) } else { None };
        Ok(Self { header, question })
    }
}

/// Appends a response to `msg` answering its first question with `127.0.0.1`.
///
/// With `tcp_prefix` the response carries a two-byte length prefix.
pub fn build_response(msg: &[u8], tcp_prefix: bool, out: &mut Vec<u8>) -> Result<usize> {
    let query = DnsQuery::parse(msg)?;
    let start = out.len();
    if tcp_prefix {
        out.extend_from_slice(&[0, 0]);
    }

    let header_at = out.len();
    out.extend_from_slice(&msg[..HEADER_LEN]);
    out[header_at + 2] |= 0x80; // QR
    out[header_at + 3] &= 0xF0; // RCODE = NOERROR
    let answers: u16 = if query.question.is_some() { 1 } else { 0 };
    BigEndian::write_u16(&mut out[header_at + 4..header_at + 6], answers);
    BigEndian::write_u16(&mut out[header_at + 6..header_at + 8], answers);
    BigEndian::write_u16(&mut out[header_at + 8..header_at + 10], 0);
    BigEndian::write_u16(&mut out[header_at + 10..header_at + 12], 0);

    if let Some(question) = &query.question {
        out.extend_from_slice(&msg[HEADER_LEN..question.end]);
        // Name pointer to offset 12, TYPE A, CLASS IN
        out.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
        out.extend_from_slice(&ANSWER_TTL.to_be_bytes());
        out.extend_from_slice(&(ANSWER_ADDR.len() as u16).to_be_bytes());
        out.extend_from_slice(&ANSWER_ADDR);
    }

    if tcp_prefix {
        let len = (out.len() - start - 2) as u16;
        BigEndian::write_u16(&mut out[start..start + 2], len);
    }
    Ok(out.len() - start)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_QUERY: [u8; 29] = [
        0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, b'e', b'x',
        b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01, 0x00, 0x01,
    ];

    #[test]
    fn test_parse_example_query() {
        let query = DnsQuery::parse(&EXAMPLE_QUERY).unwrap();
        assert_eq!(query.header.id, 1);
        assert!(!query.header.is_response());
        assert_eq!(query.header.opcode(), 0);
        let question = query.question.unwrap();
        assert_eq!(question.name, "example.com");
        assert_eq!(question.qtype, 1);
        assert_eq!(question.qclass, 1);
        assert_eq!(question.end, EXAMPLE_QUERY.len());
    }

    #[test]
    fn test_response_answers_localhost() {
        let mut out = Vec::new();
        let written = build_response(&EXAMPLE_QUERY, false, &mut out).unwrap();
        assert_eq!(written, EXAMPLE_QUERY.len() + 16);

        assert_eq!(&out[0..2], &[0x00, 0x01]);
        assert_eq!(out[2] & 0x80, 0x80);
        assert_eq!(&out[6..8], &[0x00, 0x01]);
        assert_eq!(&out[12..29], &EXAMPLE_QUERY[12..29]);
        assert_eq!(
            &out[29..],
            &[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01, 0x2C, 0x00, 0x04, 0x7F, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn test_tcp_prefix() {
        let mut framed = vec![0x00, EXAMPLE_QUERY.len() as u8];
        framed.extend_from_slice(&EXAMPLE_QUERY);
        let (msg, prefixed) = strip_tcp_prefix(&framed);
        assert!(prefixed);
        assert_eq!(msg, &EXAMPLE_QUERY);

        let mut out = Vec::new();
        build_response(msg, true, &mut out).unwrap();
        assert_eq!(BigEndian::read_u16(&out[0..2]) as usize, out.len() - 2);
        assert_eq!(&out[2..4], &[0x00, 0x01]);
    }

    #[test]
    fn test_question_bounds() {
        // Label runs past the buffer
        let mut truncated = EXAMPLE_QUERY[..16].to_vec();
        truncated[12] = 0x3F;
        assert!(parse_question(&truncated, 12).is_err());

        // Reserved label type 0x40
        let mut reserved = EXAMPLE_QUERY.to_vec();
        reserved[12] = 0x47;
        assert!(parse_question(&reserved, 12).is_err());

        // Self-referencing pointer loop is cut off
        let mut looping = EXAMPLE_QUERY[..12].to_vec();
        looping.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
        assert!(parse_question(&looping, 12).is_err());
    }
}
