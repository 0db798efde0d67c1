//! Integration tests for the gateway event loop.
//!
//! Each test binds a real gateway on loopback, talks to it through plain std
//! sockets and drives the loop by hand between writes and reads.

use std::{
    io::{ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, TcpStream, UdpSocket},
    sync::Arc,
    thread,
    time::Duration,
};

use paumiot_core::config::Config;
use paumiot_host::{Gateway, GatewayEvent, MessageHandler, SocketState};
use paumiot_protocol::{http::MAX_RESPONSE_LEN, InternalMessage, Protocol};
use parking_lot::Mutex;

const CONNECT: [u8; 20] = [
    0x10, 0x12, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x06, b't', b'e',
    b's', b't', b'e', b'r',
];
const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const DNS_QUERY: [u8; 29] = [
    0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, b'e', b'x', b'a',
    b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01, 0x00, 0x01,
];

fn loopback_config() -> Config {
    Config {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        max_connections: 16,
        poll_timeout: Duration::from_millis(10),
        ..Config::default()
    }
}

fn connect(gateway: &mut Gateway) -> TcpStream {
    let client = TcpStream::connect(gateway.local_addr().unwrap()).unwrap();
    client.set_nonblocking(true).unwrap();
    for _ in 0..5 {
        gateway.manual_poll().unwrap();
    }
    client
}

/// Pumps the loop until `len` bytes arrived on `client`, the peer closed, or
/// the reply went quiet.
fn read_reply(gateway: &mut Gateway, client: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut reply = Vec::new();
    let mut buf = [0u8; 4096];
    let mut quiet = 0;
    for _ in 0..200 {
        gateway.manual_poll().unwrap();
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                reply.extend_from_slice(&buf[..n]);
                quiet = 0;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if !reply.is_empty() {
                    quiet += 1;
                }
            }
            Err(err) => panic!("read failed: {}", err),
        }
        if reply.len() >= len || quiet >= 10 {
            break;
        }
    }
    reply
}

fn exchange_datagram(gateway: &mut Gateway, request: &[u8]) -> Vec<u8> {
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_nonblocking(true).unwrap();
    client.send_to(request, gateway.udp_local_addr().unwrap()).unwrap();

    let mut buf = [0u8; 2048];
    for _ in 0..200 {
        gateway.manual_poll().unwrap();
        match client.recv_from(&mut buf) {
            Ok((n, _)) => return buf[..n].to_vec(),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => panic!("recv failed: {}", err),
        }
    }
    panic!("no reply datagram");
}

#[test]
fn test_mqtt_connect_then_pingreq() {
    let mut gateway = Gateway::bind(loopback_config()).unwrap();
    let events = gateway.get_event_receiver();
    let mut client = connect(&mut gateway);

    client.write_all(&CONNECT).unwrap();
    assert_eq!(read_reply(&mut gateway, &mut client, 4), CONNACK);

    client.write_all(&[0xC0, 0x00]).unwrap();
    assert_eq!(read_reply(&mut gateway, &mut client, 2), [0xD0, 0x00]);

    let record = gateway.sessions().iter().next().unwrap();
    assert_eq!(record.protocol(), Protocol::Mqtt);
    assert!(record.confidence >= 70);
    assert!(record.session_id().starts_with("MQTT_"));
    assert!(events
        .try_iter()
        .any(|event| matches!(event, GatewayEvent::Classified { protocol: Protocol::Mqtt, .. })));
}

#[test]
fn test_coap_get_over_udp() {
    let mut gateway = Gateway::bind(loopback_config()).unwrap();
    let reply = exchange_datagram(&mut gateway, &[0x40, 0x01, 0x12, 0x34, 0xB3, b'f', b'o', b'o']);

    assert_eq!(&reply[..4], &[0x60, 0x45, 0x12, 0x34]);
    assert_eq!(reply[4], 0xFF);
    assert!(reply.len() > 5);
    assert_eq!(gateway.stats().detections[Protocol::Coap.index()], 1);
}

#[test]
fn test_http_get_status() {
    let mut gateway = Gateway::bind(loopback_config()).unwrap();
    let mut client = connect(&mut gateway);

    client.write_all(b"GET /api/status HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let mut reply = Vec::new();
    for _ in 0..10 {
        reply.extend(read_reply(&mut gateway, &mut client, 1));
        if reply.ends_with(b"}") {
            break;
        }
    }

    let text = String::from_utf8(reply).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Type: application/json"));
    assert!(text.contains("\"protocol\":\"HTTP\""));
    assert_eq!(gateway.sessions().iter().next().unwrap().protocol(), Protocol::Http);
}

#[test]
fn test_http_close_is_honoured() {
    let mut gateway = Gateway::bind(loopback_config()).unwrap();
    let mut client = connect(&mut gateway);

    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").unwrap();
    let reply = read_reply(&mut gateway, &mut client, usize::MAX);

    assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(gateway.sessions().is_empty());
    assert_eq!(gateway.stats().connections_closed, 1);
}

#[test]
fn test_long_uri_still_gets_a_reply() {
    let mut gateway = Gateway::bind(loopback_config()).unwrap();
    let mut client = connect(&mut gateway);

    let request = format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", "a".repeat(3900));
    client.write_all(request.as_bytes()).unwrap();
    let reply = read_reply(&mut gateway, &mut client, usize::MAX);

    assert!(!reply.is_empty());
    assert!(reply.len() <= MAX_RESPONSE_LEN);
    let text = String::from_utf8(reply).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("\"uri\":\"/aaaa"));
    assert_eq!(gateway.sessions().len(), 1);
}

#[test]
fn test_pipelined_requests_wait_for_write_space() {
    let config = Config { write_buffer_size: 800, ..loopback_config() };
    let mut gateway = Gateway::bind(config).unwrap();
    let mut client = connect(&mut gateway);

    let request = "GET /one HTTP/1.1\r\nHost: x\r\n\r\nGET /two HTTP/1.1\r\nHost: x\r\n\r\n";
    client.write_all(request.as_bytes()).unwrap();
    let mut reply = Vec::new();
    for _ in 0..10 {
        reply.extend(read_reply(&mut gateway, &mut client, usize::MAX));
        if String::from_utf8_lossy(&reply).matches("HTTP/1.1 200 OK").count() == 2 {
            break;
        }
    }

    let text = String::from_utf8(reply).unwrap();
    assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
    assert!(text.find("\"uri\":\"/one\"").unwrap() < text.find("\"uri\":\"/two\"").unwrap());
    assert_eq!(gateway.sessions().len(), 1);
}

#[test]
fn test_reply_larger_than_write_buffer_closes() {
    let config = Config { write_buffer_size: 128, ..loopback_config() };
    let mut gateway = Gateway::bind(config).unwrap();
    let mut client = connect(&mut gateway);

    client.write_all(b"GET /api/status HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let reply = read_reply(&mut gateway, &mut client, usize::MAX);

    assert!(reply.is_empty());
    assert!(gateway.sessions().is_empty());
    assert_eq!(gateway.stats().protocol_errors, 1);
}

#[test]
fn test_dns_query_over_udp() {
    let mut gateway = Gateway::bind(loopback_config()).unwrap();
    let reply = exchange_datagram(&mut gateway, &DNS_QUERY);

    assert_eq!(&reply[..2], &[0x00, 0x01]);
    assert_eq!(reply[2] & 0x80, 0x80);
    assert_eq!(&reply[6..8], &[0x00, 0x01]);
    assert_eq!(&reply[reply.len() - 10..reply.len() - 6], &[0x00, 0x00, 0x01, 0x2C]);
    assert_eq!(&reply[reply.len() - 4..], &[0x7F, 0x00, 0x00, 0x01]);
}

#[test]
fn test_unsupported_datagram_gets_error_text() {
    let mut gateway = Gateway::bind(loopback_config()).unwrap();
    let reply = exchange_datagram(&mut gateway, b"\x00hello");

    assert_eq!(reply, b"ERROR: Unsupported UDP protocol");
    assert_eq!(gateway.stats().protocol_errors, 1);
}

#[test]
fn test_ping_burst_is_rate_limited() {
    let mut gateway = Gateway::bind(loopback_config()).unwrap();
    let events = gateway.get_event_receiver();
    let mut client = connect(&mut gateway);

    client.write_all(&CONNECT).unwrap();
    assert_eq!(read_reply(&mut gateway, &mut client, 4), CONNACK);

    let burst: Vec<u8> = [0xC0, 0x00].repeat(200);
    client.write_all(&burst).unwrap();
    let reply = read_reply(&mut gateway, &mut client, 2 * 200);

    // CONNECT took one slot of the first second
    assert_eq!(reply.len(), 2 * 99);
    let stats = gateway.stats();
    assert_eq!(stats.messages_admitted, 100);
    assert!(stats.messages_dropped >= 1);
    assert_eq!(stats.throttle_events, 1);

    let record = gateway.sessions().iter().next().unwrap();
    assert_eq!(record.state(), SocketState::Throttled);
    assert!(record.congestion.window() <= 32);
    assert!(!record.congestion.in_slow_start());
    assert!(events.try_iter().any(|event| matches!(event, GatewayEvent::Throttled { .. })));
}

#[test]
fn test_throttled_connection_resumes_next_window() {
    let mut gateway = Gateway::bind(loopback_config()).unwrap();
    let mut client = connect(&mut gateway);
    client.write_all(&CONNECT).unwrap();
    read_reply(&mut gateway, &mut client, 4);

    client.write_all(&[0xC0, 0x00].repeat(120)).unwrap();
    let first = read_reply(&mut gateway, &mut client, 2 * 120);
    assert_eq!(first.len(), 2 * 99);

    thread::sleep(Duration::from_millis(1100));
    let rest = read_reply(&mut gateway, &mut client, 2 * 21);
    assert_eq!(rest.len(), 2 * 21);
    let record = gateway.sessions().iter().next().unwrap();
    assert_ne!(record.state(), SocketState::Throttled);
}

#[test]
fn test_publish_reaches_message_handler() {
    let config = Config { dispatch_workers: 1, ..loopback_config() };
    let received = Arc::new(Mutex::new(Vec::<InternalMessage>::new()));
    let sink = Arc::clone(&received);
    let handler: Arc<dyn MessageHandler> =
        Arc::new(move |message: InternalMessage| sink.lock().push(message));
    let mut gateway = Gateway::bind(config).unwrap().with_message_handler(handler).unwrap();
    let mut client = connect(&mut gateway);

    let mut publish = vec![0x32, 0x11, 0x00, 0x09];
    publish.extend_from_slice(b"sensors/t");
    publish.extend_from_slice(&[0x00, 0x01]);
    publish.extend_from_slice(b"21.5");
    client.write_all(&CONNECT).unwrap();
    client.write_all(&publish).unwrap();

    let reply = read_reply(&mut gateway, &mut client, 8);
    assert_eq!(&reply[..4], &CONNACK);
    assert_eq!(&reply[4..], &[0x40, 0x02, 0x00, 0x01]);

    gateway.shutdown();
    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].destination.as_deref(), Some("sensors/t"));
    assert_eq!(received[0].payload, b"21.5");
    assert!(received[0].source.as_deref().unwrap().starts_with("MQTT_"));
    assert_eq!(gateway.stats().messages_forwarded, 1);
}

#[test]
fn test_one_bad_connection_leaves_others_alone() {
    let mut gateway = Gateway::bind(loopback_config()).unwrap();
    let mut good = connect(&mut gateway);
    let mut bad = connect(&mut gateway);

    good.write_all(&CONNECT).unwrap();
    assert_eq!(read_reply(&mut gateway, &mut good, 4), CONNACK);

    // CONNACK is server-to-client only
    bad.write_all(&CONNECT).unwrap();
    read_reply(&mut gateway, &mut bad, 4);
    bad.write_all(&CONNACK).unwrap();
    read_reply(&mut gateway, &mut bad, usize::MAX);

    good.write_all(&[0xC0, 0x00]).unwrap();
    assert_eq!(read_reply(&mut gateway, &mut good, 2), [0xD0, 0x00]);
    assert_eq!(gateway.sessions().len(), 1);
    assert_eq!(gateway.stats().protocol_errors, 1);
}
