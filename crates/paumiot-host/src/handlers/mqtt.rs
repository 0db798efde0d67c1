use byteorder::{BigEndian, ByteOrder};
use paumiot_core::error::{DecodingErrorKind, ErrorKind, Result};
use paumiot_protocol::{
    pal::{
        mqtt::{flags_valid, packet_id, ConnectPacket, MqttVersion, PacketType},
        Adapter, MqttAdapter,
    },
    varint, EnumConverter, InternalMessage, Protocol, QoS,
};
use tracing::{debug, info, trace};

use super::HandlerContext;
use crate::{
    connection::{ConnectionRecord, MqttData, ProtocolData, SessionFlags, SessionState},
    event_types::Action,
};

/// CONNACK, session not present, connection accepted.
pub const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
/// PINGRESP.
pub const PINGRESP: [u8; 2] = [0xD0, 0x00];
/// Longest control reply (SUBACK with one return code).
pub const MAX_REPLY_LEN: usize = 5;

fn ack(kind: PacketType, flags: u8, id: u16) -> Vec<u8> {
    let [hi, lo] = id.to_be_bytes();
    vec![(kind.to_u8() << 4) | flags, 0x02, hi, lo]
}

fn mqtt_data(record: &mut ConnectionRecord) -> Result<&mut MqttData> {
    match record.data_mut() {
        ProtocolData::Mqtt(data) => Ok(data),
        _ => Err(ErrorKind::Internal("MQTT handler on a non-MQTT record")),
    }
}

/// Handles one complete MQTT control packet.
pub fn handle(
    record: &mut ConnectionRecord,
    frame: &[u8],
    ctx: &mut HandlerContext<'_>,
) -> Result<Vec<Action>> {
    let first = *frame.first().ok_or(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated))?;
    let kind = PacketType::from_nibble(first >> 4)
        .ok_or(ErrorKind::MalformedPacket(DecodingErrorKind::PacketType))?;
    if !flags_valid(kind, first & 0x0F) {
        return Err(ErrorKind::MalformedPacket(DecodingErrorKind::PacketType));
    }
    let (remaining, len) = varint::decode_complete(&frame[1..])?;
    let body = frame
        .get(1 + len..1 + len + remaining)
        .ok_or(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated))?;
    trace!("[MQTT] {:?} with {} byte body from {}", kind, remaining, record.peer());

    match kind {
        PacketType::Connect => {
            let connect = ConnectPacket::parse(body)?;
            info!(
                "[MQTT] CONNECT from {} (level {}, keep-alive {}s, client {:?})",
                record.peer(),
                connect.level,
                connect.keep_alive,
                connect.client_id
            );
            record.session_state = SessionState::Authenticated;
            record.flags.insert(SessionFlags::AUTHENTICATED);
            record.flags.set(SessionFlags::CLEAN_SESSION, connect.clean_session());
            record.flags.set(SessionFlags::KEEP_ALIVE, connect.keep_alive > 0);
            let data = mqtt_data(record)?;
            data.version = connect.level;
            data.keep_alive = connect.keep_alive;
            data.client_id = connect.client_id;
            Ok(vec![Action::Reply(CONNACK_ACCEPTED.to_vec())])
        }
        PacketType::Publish => {
            let qos = QoS::try_from((first >> 1) & 0x03)?;
            let message = decode_publish(record, frame, ctx)?;
            debug!(
                "[MQTT] PUBLISH {:?} ({} bytes, {:?}) from {}",
                message.destination,
                message.payload_len(),
                qos,
                record.peer()
            );
            record.session_state = SessionState::Active;
            mqtt_data(record)?.qos = qos.to_u8();

            let mut actions = vec![Action::Forward(message)];
            if qos != QoS::AtMostOnce {
                let topic_len = BigEndian::read_u16(body) as usize;
                let id = packet_id(&body[2 + topic_len..])?;
                let reply = match qos {
                    QoS::AtLeastOnce => ack(PacketType::Puback, 0, id),
                    _ => ack(PacketType::Pubrec, 0, id),
                };
                actions.push(Action::Reply(reply));
            }
            Ok(actions)
        }
        PacketType::Pubrel => {
            Ok(vec![Action::Reply(ack(PacketType::Pubcomp, 0, packet_id(body)?))])
        }
        PacketType::Subscribe => {
            let [hi, lo] = packet_id(body)?.to_be_bytes();
            debug!("[MQTT] SUBSCRIBE from {}", record.peer());
            Ok(vec![Action::Reply(vec![0x90, 0x03, hi, lo, 0x00])])
        }
        PacketType::Unsubscribe => {
            Ok(vec![Action::Reply(ack(PacketType::Unsuback, 0, packet_id(body)?))])
        }
        PacketType::Pingreq => Ok(vec![Action::Reply(PINGRESP.to_vec())]),
        PacketType::Disconnect => {
            info!("[MQTT] DISCONNECT from {}", record.peer());
            record.session_state = SessionState::Disconnecting;
            Ok(vec![Action::Close])
        }
        PacketType::Puback | PacketType::Pubrec | PacketType::Pubcomp => Ok(Vec::new()),
        PacketType::Connack | PacketType::Suback | PacketType::Unsuback | PacketType::Pingresp => {
            Err(ErrorKind::ProtocolError("server-to-client MQTT packet sent by client"))
        }
    }
}

// The registry adapter speaks 3.1.1; v5 sessions carry a properties block.
fn decode_publish(
    record: &ConnectionRecord,
    frame: &[u8],
    ctx: &mut HandlerContext<'_>,
) -> Result<InternalMessage> {
    let level = match record.data() {
        ProtocolData::Mqtt(data) => data.version,
        _ => 0,
    };
    let mut message = if level == MqttVersion::V5 as u8 {
        MqttAdapter::new(MqttVersion::V5).decode(frame)?
    } else {
        ctx.pal.decode_packet(Protocol::Mqtt, frame)?
    };
    message.source = Some(record.session_id().to_owned());
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use paumiot_protocol::PalRegistry;

    const CONNECT: [u8; 20] = [
        0x10, 0x12, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x06, b't',
        b'e', b's', b't', b'e', b'r',
    ];

    fn run(record: &mut ConnectionRecord, frame: &[u8]) -> Result<Vec<Action>> {
        let mut pal = PalRegistry::with_default_adapters();
        handle(record, frame, &mut HandlerContext { pal: &mut pal })
    }

    #[test]
    fn test_connect_then_ping() {
        let mut record = ConnectionRecord::detached(Protocol::Mqtt);
        let actions = run(&mut record, &CONNECT).unwrap();
        assert_eq!(actions, vec![Action::Reply(CONNACK_ACCEPTED.to_vec())]);
        assert_eq!(record.session_state, SessionState::Authenticated);
        assert!(record.flags.contains(SessionFlags::AUTHENTICATED | SessionFlags::CLEAN_SESSION));
        match record.data() {
            ProtocolData::Mqtt(data) => {
                assert_eq!(data.keep_alive, 60);
                assert_eq!(data.version, 4);
                assert_eq!(data.client_id.as_deref(), Some("tester"));
            }
            other => panic!("unexpected data {:?}", other),
        }

        assert_eq!(run(&mut record, &[0xC0, 0x00]).unwrap(), vec![Action::Reply(vec![0xD0, 0x00])]);
    }

    #[test]
    fn test_publish_qos1_is_forwarded_and_acked() {
        let mut record = ConnectionRecord::detached(Protocol::Mqtt);
        let publish = [0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x07, b'h', b'i'];
        let actions = run(&mut record, &publish).unwrap();

        assert_eq!(actions.len(), 2);
        match &actions[0] {
            Action::Forward(message) => {
                assert_eq!(message.destination.as_deref(), Some("a/b"));
                assert_eq!(message.payload, b"hi");
                assert_eq!(message.qos, QoS::AtLeastOnce);
                assert_eq!(message.source.as_deref(), Some(record.session_id()));
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(actions[1], Action::Reply(vec![0x40, 0x02, 0x00, 0x07]));
        assert_eq!(record.session_state, SessionState::Active);
    }

    #[test]
    fn test_publish_qos2_gets_pubrec_and_pubrel_gets_pubcomp() {
        let mut record = ConnectionRecord::detached(Protocol::Mqtt);
        let publish = [0x34, 0x07, 0x00, 0x01, b't', 0x01, 0x02, b'x', b'y'];
        let actions = run(&mut record, &publish).unwrap();
        assert_eq!(actions[1], Action::Reply(vec![0x50, 0x02, 0x01, 0x02]));

        let pubrel = [0x62, 0x02, 0x01, 0x02];
        let actions = run(&mut record, &pubrel).unwrap();
        assert_eq!(actions, vec![Action::Reply(vec![0x70, 0x02, 0x01, 0x02])]);
    }

    #[test]
    fn test_subscribe_unsubscribe_disconnect() {
        let mut record = ConnectionRecord::detached(Protocol::Mqtt);
        let subscribe = [0x82, 0x06, 0x00, 0x0A, 0x00, 0x01, b'#', 0x00];
        assert_eq!(
            run(&mut record, &subscribe).unwrap(),
            vec![Action::Reply(vec![0x90, 0x03, 0x00, 0x0A, 0x00])]
        );
        let unsubscribe = [0xA2, 0x05, 0x00, 0x0B, 0x00, 0x01, b'#'];
        assert_eq!(
            run(&mut record, &unsubscribe).unwrap(),
            vec![Action::Reply(vec![0xB0, 0x02, 0x00, 0x0B])]
        );
        assert_eq!(run(&mut record, &[0xE0, 0x00]).unwrap(), vec![Action::Close]);
        assert_eq!(record.session_state, SessionState::Disconnecting);
    }

    #[test]
    fn test_bad_packets() {
        let mut record = ConnectionRecord::detached(Protocol::Mqtt);
        // SUBSCRIBE with reserved flags 0
        assert!(matches!(
            run(&mut record, &[0x80, 0x02, 0x00, 0x01]),
            Err(ErrorKind::MalformedPacket(DecodingErrorKind::PacketType))
        ));
        // CONNACK is never sent by a client
        assert!(matches!(
            run(&mut record, &[0x20, 0x02, 0x00, 0x00]),
            Err(ErrorKind::ProtocolError(_))
        ));
        // Reserved type 0
        assert!(run(&mut record, &[0x00, 0x00]).is_err());
    }
}
