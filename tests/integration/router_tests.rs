//! Reporting, polling and heartbeats through the engine.

use std::sync::Arc;

use vgstack::app::ports::ConfigPort;
use vgstack::config::{StackConfig, keys};
use vgstack::proto::codec::{self, Packet, RESULT_OK};
use vgstack::proto::engine::ProtocolEngine;
use vgstack::proto::router::{DataSource, Outbound};
use vgstack::proto::sync::SyncBridge;
use vgstack::proto::transport::TransportId;

use crate::mock_ports::{DeviceCall, MockTerminal};

const RS485: i64 = 1 << 1;
const NETWORK: i64 = 1 << 6;
const TCP_RAW: i64 = 4;

fn engine() -> ProtocolEngine {
    ProtocolEngine::new(StackConfig::default(), Arc::new(SyncBridge::new()))
}

fn request(command: u8, payload: &[u8]) -> Vec<u8> {
    codec::encode(command, None, payload).unwrap()
}

fn decode_reply(out: &Outbound) -> Packet {
    codec::decode(&out.bytes, true).unwrap()
}

#[test]
fn split_request_is_answered_once_complete() {
    let mut engine = engine();
    let mut term = MockTerminal::new();
    let frame = request(0x01, &[]);

    let (head, tail) = frame.split_at(3);
    assert!(engine.receive(TransportId::Rs485, head, 0, &mut term.ports()).is_empty());
    let out = engine.receive(TransportId::Rs485, tail, 10, &mut term.ports());
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dest, TransportId::Rs485);
    let reply = decode_reply(&out[0]);
    assert_eq!(reply.result, Some(RESULT_OK));
    assert_eq!(reply.payload, vec![0x55, 0xAA]);
}

#[test]
fn noise_between_frames_is_skipped() {
    let mut engine = engine();
    let mut term = MockTerminal::new();
    let mut raw = vec![0x00, 0x13, 0xaa];
    raw.extend(request(0x01, &[]));
    raw.extend([0xff, 0xfe]);
    raw.extend(request(0x37, &[]));
    let out = engine.receive(TransportId::Tcp, &raw, 0, &mut term.ports());
    let commands: Vec<u8> = out.iter().map(|o| decode_reply(o).command).collect();
    assert_eq!(commands, vec![0x01, 0x37]);
}

#[test]
fn stale_partial_frame_expires_on_tick() {
    let mut engine = engine();
    let mut term = MockTerminal::new();
    let frame = request(0x01, &[]);
    engine.receive(TransportId::Rs485, &frame[..4], 0, &mut term.ports());
    engine.tick(1_000, &mut term.ports());
    // The tail alone is not a frame once the head has been dropped.
    assert!(
        engine
            .receive(TransportId::Rs485, &frame[4..], 1_001, &mut term.ports())
            .is_empty()
    );
    let out = engine.receive(TransportId::Rs485, &frame, 1_002, &mut term.ports());
    assert_eq!(out.len(), 1);
}

#[test]
fn poll_mode_round_trip_over_the_wire() {
    let mut engine = engine();
    let mut term = MockTerminal::new();
    term.config.insert(keys::REPORT_MODE, "0");

    assert!(
        engine
            .report(DataSource::Code, b"QR-42", 0, &mut term.ports())
            .is_empty()
    );
    let out = engine.receive(TransportId::Rs485, &request(0x30, &[]), 5, &mut term.ports());
    assert_eq!(decode_reply(&out[0]).payload, b"QR-42".to_vec());

    let out = engine.receive(TransportId::Rs485, &request(0x30, &[]), 6, &mut term.ports());
    assert!(decode_reply(&out[0]).payload.is_empty());
}

#[test]
fn report_mode_change_takes_effect_without_restart() {
    let mut engine = engine();
    let mut term = MockTerminal::new();
    term.config.insert(keys::OUTPUT_CHANNEL, RS485);

    let pushed = engine.report(DataSource::Code, b"A", 0, &mut term.ports());
    assert_eq!(pushed.len(), 1);

    engine.receive(TransportId::Rs485, &request(0x31, &[0x80]), 1, &mut term.ports());
    assert!(
        engine
            .report(DataSource::Password, b"1234", 2, &mut term.ports())
            .is_empty()
    );
    let out = engine.receive(TransportId::Rs485, &request(0x33, &[]), 3, &mut term.ports());
    assert_eq!(decode_reply(&out[0]).payload, b"\xa01234".to_vec());
}

#[test]
fn network_heartbeat_follows_stored_settings() {
    let mut engine = engine();
    let mut term = MockTerminal::new();
    term.config.insert(keys::OUTPUT_CHANNEL, RS485 | NETWORK);
    term.config.insert(keys::NETWORK_OUTPUT, TCP_RAW);

    let body = br#"{"heart_en":1,"heart_time":5,"heart_data":"alive"}"#;
    engine.receive(TransportId::Tcp, &request(0x2b, body), 0, &mut term.ports());
    assert_eq!(term.config.get_i64(keys::HEART_ENABLED), Some(1));
    assert_eq!(term.config.get_i64(keys::HEART_PERIOD), Some(5));

    let out = engine.tick(100, &mut term.ports());
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dest, TransportId::Tcp);
    let beat = decode_reply(&out[0]);
    assert_eq!(beat.command, 0x2b);
    assert_eq!(beat.payload, b"alive".to_vec());

    // The 30 s floor applies to the stored 5 s period.
    assert!(engine.tick(10_100, &mut term.ports()).is_empty());
    assert_eq!(engine.tick(30_100, &mut term.ports()).len(), 1);
}

#[test]
fn link_heartbeat_stays_in_memory() {
    let mut engine = engine();
    let mut term = MockTerminal::new();

    let body = br#"{"heart_en":1,"heart_time":60,"heart_data":"ping"}"#;
    let out = engine.receive(TransportId::Rs485, &request(0x2b, body), 0, &mut term.ports());
    assert_eq!(decode_reply(&out[0]).result, Some(RESULT_OK));
    assert!(term.config.get(keys::HEART_ENABLED).is_none());

    let out = engine.tick(1, &mut term.ports());
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dest, TransportId::Rs485);
    assert_eq!(decode_reply(&out[0]).payload, b"ping".to_vec());

    assert!(engine.tick(59_000, &mut term.ports()).is_empty());
    assert_eq!(engine.tick(60_001, &mut term.ports()).len(), 1);

    let off = br#"{"heart_en":0}"#;
    engine.receive(TransportId::Rs485, &request(0x2b, off), 60_002, &mut term.ports());
    assert!(engine.tick(200_000, &mut term.ports()).is_empty());
}

#[test]
fn link_heartbeat_period_is_capped_at_one_day() {
    let mut engine = engine();
    let mut term = MockTerminal::new();

    let body = br#"{"heart_en":1,"heart_time":100000000000000000,"heart_data":"x"}"#;
    let out = engine.receive(TransportId::Rs485, &request(0x2b, body), 0, &mut term.ports());
    assert_eq!(decode_reply(&out[0]).result, Some(RESULT_OK));

    assert_eq!(engine.tick(1_000, &mut term.ports()).len(), 1);
    assert!(engine.tick(2_000, &mut term.ports()).is_empty());
    assert!(engine.tick(86_400_999, &mut term.ports()).is_empty());
    assert_eq!(engine.tick(86_401_000, &mut term.ports()).len(), 1);
}

#[test]
fn negative_link_heartbeat_period_uses_the_floor() {
    let mut engine = engine();
    let mut term = MockTerminal::new();

    let body = br#"{"heart_en":1,"heart_time":-5,"heart_data":"x"}"#;
    engine.receive(TransportId::Rs485, &request(0x2b, body), 0, &mut term.ports());
    assert_eq!(engine.tick(1, &mut term.ports()).len(), 1);
    assert!(engine.tick(29_000, &mut term.ports()).is_empty());
    assert_eq!(engine.tick(30_001, &mut term.ports()).len(), 1);
}

#[test]
fn network_heartbeat_period_is_clamped_when_stored() {
    let mut engine = engine();
    let mut term = MockTerminal::new();
    term.config.insert(keys::OUTPUT_CHANNEL, NETWORK);
    term.config.insert(keys::NETWORK_OUTPUT, TCP_RAW);

    let body = br#"{"heart_en":1,"heart_time":100000000000000000,"heart_data":"x"}"#;
    engine.receive(TransportId::Tcp, &request(0x2b, body), 0, &mut term.ports());
    assert_eq!(term.config.get_i64(keys::HEART_PERIOD), Some(86_400));

    let body = br#"{"heart_en":1,"heart_time":-5}"#;
    engine.receive(TransportId::Tcp, &request(0x2b, body), 0, &mut term.ports());
    assert_eq!(term.config.get_i64(keys::HEART_PERIOD), Some(0));
}

#[test]
fn oversized_stored_heartbeat_period_does_not_stall_the_tick() {
    let mut engine = engine();
    let mut term = MockTerminal::new();
    term.config.insert(keys::OUTPUT_CHANNEL, NETWORK);
    term.config.insert(keys::NETWORK_OUTPUT, TCP_RAW);
    term.config.insert(keys::HEART_ENABLED, 1i64);
    term.config.insert(keys::HEART_PERIOD, i64::MAX);

    assert_eq!(engine.tick(1_000, &mut term.ports()).len(), 1);
    assert!(engine.tick(2_000, &mut term.ports()).is_empty());
    assert_eq!(engine.tick(86_401_000, &mut term.ports()).len(), 1);
}

#[test]
fn sub_controller_user_data_is_reported() {
    let mut engine = engine();
    let mut term = MockTerminal::new();
    term.config.insert(keys::BLE_OUTPUT_CHANNEL, RS485);
    term.config.insert(keys::BLE_AFFIX_MODE, 1i64);
    term.config.insert(keys::BLE_PREFIX, "<");
    term.config.insert(keys::BLE_SUFFIX, ">");
    term.config.insert(keys::BEEP_ON_SCAN, 1i64);

    let frame = codec::encode(0x0f, Some(RESULT_OK), b"\x00\x00\x00\x00\x00ABC\x02").unwrap();
    let out = engine.receive(TransportId::SubController, &frame, 0, &mut term.ports());
    assert_eq!(out.len(), 2);

    assert_eq!(out[0].dest, TransportId::SubController);
    assert_eq!(codec::decode(&out[0].bytes, true).unwrap().payload, vec![0x02]);

    assert_eq!(out[1].dest, TransportId::Rs485);
    let report = decode_reply(&out[1]);
    assert_eq!(report.command, 0x30);
    assert_eq!(report.payload, b"<ABC>".to_vec());
    assert_eq!(
        term.device.calls,
        vec![DeviceCall::Beep {
            on_ms: 50,
            off_ms: 0,
            count: 1
        }]
    );
}

#[test]
fn http_body_goes_through_the_same_dispatcher() {
    let mut engine = engine();
    let mut term = MockTerminal::new();
    let frame = hex::encode(request(0x0a, &[]));
    let packet = vgstack::proto::http::parse_body(frame.as_bytes()).unwrap();
    let (reply, _) = engine.exchange(TransportId::Http, &packet, 0, &mut term.ports());
    assert_eq!(reply.unwrap().payload, b"VG0001".to_vec());
}
