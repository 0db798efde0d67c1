//! Classification tests across all validators.

#[cfg(test)]
mod tests {
    use super::super::{ConfidenceTier, Detection, ProtocolDetector};
    use crate::protocol::{Protocol, Transport};

    const MQTT_CONNECT: [u8; 20] = [
        0x10, 0x12, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x06, b't',
        b'e', b's', b't', b'e', b'r',
    ];
    const COAP_GET: [u8; 8] = [0x40, 0x01, 0x12, 0x34, 0xB3, b'f', b'o', b'o'];
    const DNS_QUERY: [u8; 29] = [
        0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, b'e', b'x',
        b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01, 0x00, 0x01,
    ];

    fn client_hello_record() -> Vec<u8> {
        let mut record = vec![0x16, 0x03, 0x01, 0x00, 0x04];
        record.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
        record
    }

    #[test]
    fn test_mqtt_connect() {
        let detection = ProtocolDetector::default().detect(&MQTT_CONNECT, Transport::Tcp);
        assert_eq!(detection.protocol, Protocol::Mqtt);
        assert_eq!(detection.confidence, 100);
        assert!(detection.tier() >= ConfidenceTier::Medium);
    }

    #[test]
    fn test_mqtt_pingreq_and_partial() {
        let detector = ProtocolDetector::default();
        assert_eq!(detector.detect(&[0xC0, 0x00], Transport::Tcp).protocol, Protocol::Mqtt);

        // First half of a CONNECT still classifies
        let partial = detector.detect(&MQTT_CONNECT[..9], Transport::Tcp);
        assert_eq!(partial.protocol, Protocol::Mqtt);
        assert!(partial.confidence < 100);

        // Unknown protocol name in a complete CONNECT is rejected
        let mut wrong = MQTT_CONNECT;
        wrong[4] = b'X';
        assert_ne!(detector.detect(&wrong, Transport::Tcp).protocol, Protocol::Mqtt);
    }

    #[test]
    fn test_coap_get() {
        let detection = ProtocolDetector::default().detect(&COAP_GET, Transport::Udp);
        assert_eq!(detection.protocol, Protocol::Coap);
        assert_eq!(detection.confidence, 95);

        let fast = ProtocolDetector::default().detect_fast(&COAP_GET, Transport::Udp);
        assert_eq!(fast.protocol, Protocol::Coap);
    }

    #[test]
    fn test_http_get() {
        let bytes = b"GET /api/status HTTP/1.1\r\nHost: x\r\n\r\n";
        let detection = ProtocolDetector::default().detect(bytes, Transport::Tcp);
        assert_eq!(detection.protocol, Protocol::Http);
        assert_eq!(detection.tier(), ConfidenceTier::High);
    }

    #[test]
    fn test_http_outranks_mqtt_path() {
        let bytes = b"GET /mqtt/connect HTTP/1.1\r\nHost: x\r\n\r\n";
        let detection = ProtocolDetector::default().detect(bytes, Transport::Tcp);
        assert_eq!(detection.protocol, Protocol::Http);
    }

    #[test]
    fn test_http_requires_version_and_crlf() {
        let detector = ProtocolDetector::default();
        let not_http = [
            &b"GET /index.html XTTP/1.1\r\n"[..],
            &b"GET /index.html HTTP/1.1  "[..],
            &b"GET /index.html HTTP/x.1\r\n"[..],
        ];
        for bytes in not_http {
            assert_ne!(detector.detect(bytes, Transport::Tcp).protocol, Protocol::Http);
        }
    }

    #[test]
    fn test_dns_query() {
        let detector = ProtocolDetector::default();
        let detection = detector.detect(&DNS_QUERY, Transport::Udp);
        assert_eq!(detection.protocol, Protocol::Dns);
        assert_eq!(detection.confidence, 100);
        assert_eq!(detector.detect_fast(&DNS_QUERY, Transport::Udp).protocol, Protocol::Dns);

        let mut framed = vec![0x00, DNS_QUERY.len() as u8];
        framed.extend_from_slice(&DNS_QUERY);
        assert_eq!(detector.detect(&framed, Transport::Tcp).protocol, Protocol::Dns);
    }

    #[test]
    fn test_dns_rejects_bad_class_and_counts() {
        let detector = ProtocolDetector::default();
        let mut bad_class = DNS_QUERY;
        bad_class[28] = 0x03;
        assert_ne!(detector.detect(&bad_class, Transport::Udp).protocol, Protocol::Dns);

        let mut many_questions = DNS_QUERY;
        many_questions[4] = 0x01;
        assert_ne!(detector.detect(&many_questions, Transport::Udp).protocol, Protocol::Dns);
    }

    #[test]
    fn test_short_buffers_are_unknown() {
        let detector = ProtocolDetector::new(true);
        assert_eq!(detector.detect(&[], Transport::Tcp), Detection::UNKNOWN);
        assert_eq!(detector.detect(&[0x10], Transport::Tcp), Detection::UNKNOWN);
        assert_eq!(detector.detect_fast(&[0x40], Transport::Udp), Detection::UNKNOWN);
    }

    #[test]
    fn test_detection_is_idempotent() {
        let detector = ProtocolDetector::new(true);
        let inputs: [&[u8]; 5] = [
            &MQTT_CONNECT,
            &COAP_GET,
            &DNS_QUERY,
            b"POST /x HTTP/1.0\r\n\r\n",
            &[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11],
        ];
        for input in inputs {
            for transport in [Transport::Tcp, Transport::Udp] {
                let first = detector.detect(input, transport);
                assert_eq!(first, detector.detect(input, transport));
                assert!(first.confidence <= 100);
            }
        }
    }

    #[test]
    fn test_encrypted_requires_opt_in() {
        let hello = client_hello_record();
        assert_ne!(ProtocolDetector::default().detect(&hello, Transport::Tcp).protocol, Protocol::Tls);

        let detection = ProtocolDetector::new(true).detect(&hello, Transport::Tcp);
        assert_eq!(detection.protocol, Protocol::Tls);
        assert_eq!(detection.confidence, 100);
    }

    #[test]
    fn test_quic_initial() {
        let mut packet = vec![0xC0, 0x00, 0x00, 0x00, 0x01, 0x08];
        packet.extend_from_slice(&[0x11; 8]);
        packet.extend_from_slice(&[0x00; 16]);

        assert!(!ProtocolDetector::default().detect(&packet, Transport::Udp).is_known());
        let detection = ProtocolDetector::new(true).detect_fast(&packet, Transport::Udp);
        assert_eq!(detection.protocol, Protocol::Quic);
        assert_eq!(detection.confidence, 100);
    }

    #[test]
    fn test_tiers() {
        assert_eq!(ConfidenceTier::from_confidence(95), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::from_confidence(70), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::from_confidence(50), ConfidenceTier::Low);
        assert_eq!(ConfidenceTier::from_confidence(49), ConfidenceTier::None);
    }
}
