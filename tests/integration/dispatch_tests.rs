//! Command dispatcher behaviour against recording ports.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use vgstack::app::ports::{ConfigPort, PageContent, RelayAction};
use vgstack::config::{StackConfig, keys};
use vgstack::proto::codec::{Packet, RESULT_FAIL, RESULT_NO_SENSOR, RESULT_OK};
use vgstack::proto::config_code::{self, DEFAULT_PASSWORD};
use vgstack::proto::dispatch::{CommandDispatcher, bridge_keys};
use vgstack::proto::sync::SyncBridge;
use vgstack::proto::transport::TransportId;

use crate::mock_ports::{DeviceCall, DisplayCall, MockTerminal, OsCall};

struct Rig {
    dispatcher: CommandDispatcher,
    bridge: Arc<SyncBridge>,
    term: MockTerminal,
}

impl Rig {
    fn new() -> Self {
        let bridge = Arc::new(SyncBridge::new());
        Self {
            dispatcher: CommandDispatcher::new(StackConfig::default(), Arc::clone(&bridge)),
            bridge,
            term: MockTerminal::new(),
        }
    }

    fn send_from(&mut self, source: TransportId, command: u8, payload: &[u8]) -> Option<Packet> {
        let packet = Packet::request(command, payload.to_vec());
        self.dispatcher
            .handle(source, &packet, 0, &mut self.term.ports())
    }

    fn send(&mut self, command: u8, payload: &[u8]) -> Option<Packet> {
        self.send_from(TransportId::Rs485, command, payload)
    }

    fn result(&mut self, command: u8, payload: &[u8]) -> u8 {
        self.send(command, payload)
            .and_then(|p| p.result)
            .expect("a reply with a result byte")
    }
}

// ── Gate ─────────────────────────────────────────────────────

#[test]
fn status_answers_55_aa() {
    let mut rig = Rig::new();
    let reply = rig.send(0x01, &[]).unwrap();
    assert_eq!(reply.command, 0x01);
    assert_eq!(reply.result, Some(RESULT_OK));
    assert_eq!(reply.payload, vec![0x55, 0xAA]);
}

#[test]
fn unknown_command_fails_in_protocol_mode() {
    let mut rig = Rig::new();
    let reply = rig.send(0x99, &[1, 2]).unwrap();
    assert_eq!(reply.command, 0x99);
    assert_eq!(reply.result, Some(RESULT_FAIL));
}

#[test]
fn pass_through_mode_only_answers_service_commands() {
    let mut rig = Rig::new();
    rig.term.config.insert(keys::WORK_MODE, 1i64);

    assert!(rig.send(0x01, &[]).is_none());
    assert!(rig.send(0x99, &[]).is_none());
    let version = rig.send(0x37, &[]).unwrap();
    assert_eq!(version.result, Some(RESULT_OK));
    assert_eq!(version.payload, env!("CARGO_PKG_VERSION").as_bytes());
}

#[test]
fn non_protocol_data_channel_closes_the_gate() {
    let mut rig = Rig::new();
    rig.term.config.insert(keys::DATA_CHANNEL, 2i64);
    assert!(rig.send(0x2a, &[0x01]).is_none());
    assert!(rig.term.device.calls.is_empty());
}

#[test]
fn sub_controller_commands_rejected_on_host_links() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x60, &[0x03, 0x01, 0x80, 0x01, 0x00, 0x00]), RESULT_FAIL);
    assert_eq!(rig.result(0x0f, &[0x00; 6]), RESULT_FAIL);
}

// ── Device commands ──────────────────────────────────────────

#[test]
fn device_number_is_little_endian() {
    let mut rig = Rig::new();
    assert_eq!(rig.send(0x02, &[]).unwrap().payload, vec![0, 0, 0, 0]);
    rig.term.config.insert(keys::DEVICE_NUMBER, 258i64);
    assert_eq!(rig.send(0x02, &[]).unwrap().payload, vec![0x02, 0x01, 0, 0]);
}

#[test]
fn time_read_reboot_and_set() {
    let mut rig = Rig::new();
    rig.term.os.now_ms = 0x0102;
    let reply = rig.send(0x03, &[]).unwrap();
    assert_eq!(reply.payload, 0x0102u64.to_le_bytes().to_vec());

    assert_eq!(rig.result(0x03, &[0x00]), RESULT_OK);
    assert_eq!(rig.term.os.reboots(), vec![2]);

    assert_eq!(rig.result(0x03, &[0x02, 0x10, 0x27, 0x00, 0x00]), RESULT_OK);
    assert_eq!(rig.term.os.calls.last(), Some(&OsCall::SetTime(10_000)));

    assert_eq!(rig.result(0x03, &[0x07]), RESULT_FAIL);
}

#[test]
fn beep_uses_50ms_units() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x04, &[0x08, 2, 4, 2]), RESULT_OK);
    assert_eq!(
        rig.term.device.calls,
        vec![DeviceCall::Beep {
            on_ms: 200,
            off_ms: 100,
            count: 2
        }]
    );

    // LED-only control byte: no beep.
    assert_eq!(rig.result(0x04, &[0x01, 1, 1, 1]), RESULT_OK);
    assert_eq!(rig.term.device.beeps(), 1);

    // Beep bit set but fields missing.
    assert_eq!(rig.result(0x04, &[0x08]), RESULT_FAIL);
}

#[test]
fn code_switch_inverts_wire_value() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x05, &[0x00]), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::CODE_SWITCH), Some(1));
    assert_eq!(rig.result(0x05, &[0x01]), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::CODE_SWITCH), Some(0));
    assert_eq!(rig.result(0x05, &[0x02]), RESULT_FAIL);
}

#[test]
fn door_sensor_reports_state_or_no_sensor() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x09, &[]), RESULT_NO_SENSOR);

    for (open, byte) in [(true, 0x01), (false, 0x00)] {
        rig.term.device.door = Some(open);
        let reply = rig.send(0x09, &[]).unwrap();
        assert_eq!(reply.command, 0x09);
        assert_eq!(reply.result, Some(RESULT_OK));
        assert_eq!(reply.payload, vec![byte], "open = {open}");
    }
}

#[test]
fn serial_number_read_and_write() {
    let mut rig = Rig::new();
    assert_eq!(rig.send(0x0a, &[]).unwrap().payload, b"VG0001".to_vec());

    let reply = rig.send(0x0a, b"VG0099").unwrap();
    assert_eq!(reply.result, Some(RESULT_OK));
    assert_eq!(reply.payload, b"VG0099".to_vec());
    assert_eq!(rig.term.device.identity.serial_number, "VG0099");
    assert_eq!(rig.term.os.reboots(), vec![2]);
}

#[test]
fn identity_commands() {
    let mut rig = Rig::new();
    assert_eq!(rig.send(0x0b, &[]).unwrap().payload, b"uuid-0001".to_vec());
    assert_eq!(rig.send(0x0c, &[]).unwrap().payload, b"chip-0001".to_vec());
    assert_eq!(rig.send(0x10, &[]).unwrap().payload, b"00:11:22:33:44:55".to_vec());
}

#[test]
fn relay_states() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x2a, &[0x00]), RESULT_OK);
    assert_eq!(rig.result(0x2a, &[0x01]), RESULT_OK);
    assert_eq!(rig.result(0x2a, &[0x01, 0x05]), RESULT_OK);
    assert_eq!(rig.result(0x2a, &[0x02]), RESULT_FAIL);
    assert_eq!(
        rig.term.device.calls,
        vec![
            DeviceCall::Relay(RelayAction::Close),
            DeviceCall::Relay(RelayAction::AlwaysOpen),
            DeviceCall::Relay(RelayAction::OpenFor(250)),
        ]
    );
}

#[test]
fn play_audio_needs_the_file() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x29, &[0x03]), RESULT_FAIL);

    let path = format!("{}/3.wav", StackConfig::default().audio_dir);
    rig.term.storage.files.insert(path, vec![0; 4]);
    assert_eq!(rig.result(0x29, &[0x03]), RESULT_OK);
    assert_eq!(rig.term.device.calls, vec![DeviceCall::PlayAudio(3)]);
}

// ── Scanner settings ─────────────────────────────────────────

#[test]
fn scan_mode_variants() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x22, &[0x02]), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::SCAN_MODE), Some(1));
    assert_eq!(rig.result(0x22, &[0x01]), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::SCAN_MODE), Some(2));

    assert_eq!(rig.result(0x22, &[0x03, 0x05, 0x00]), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::SCAN_MODE), Some(0));
    assert_eq!(rig.term.config.get_i64(keys::SCAN_INTERVAL), Some(5000));

    assert_eq!(rig.result(0x22, &[0x04]), RESULT_FAIL);
}

#[test]
fn scan_interval_capped_at_6000() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x23, &[0x70, 0x17]), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::SCAN_INTERVAL), Some(6000));
    assert_eq!(rig.result(0x23, &[0x71, 0x17]), RESULT_FAIL);
    assert_eq!(rig.result(0x23, &[]), RESULT_FAIL);
}

#[test]
fn scan_interval_doubles_as_door_poll_in_safe_mode() {
    let mut rig = Rig::new();
    rig.term.config.insert(keys::SAFE_OPEN, 1i64);

    // The safe-mode poll inverts the 0x09 encoding; no sensor reads as closed.
    for (door, byte) in [(Some(true), 0x00), (Some(false), 0x01), (None, 0x01)] {
        rig.term.device.door = door;
        let reply = rig.send(0x23, &[0x10]).unwrap();
        assert_eq!(reply.command, 0x09);
        assert_eq!(reply.result, Some(RESULT_OK));
        assert_eq!(reply.payload, vec![byte], "door = {door:?}");
    }
    // The poll does not touch the stored scan interval.
    assert!(rig.term.config.get(keys::SCAN_INTERVAL).is_none());
}

#[test]
fn decoder_types_enable_all_and_reboot() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x21, &[0x04]), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::DECODER_TYPES), Some(64510));
    assert_eq!(rig.term.os.reboots(), vec![2]);

    assert_eq!(rig.result(0x21, &[0x00]), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::DECODER_TYPES), Some(0));
}

#[test]
fn beep_on_read_toggles_low_bit() {
    let mut rig = Rig::new();
    rig.term.config.insert(keys::BEEP_ON_SCAN, 2i64);
    assert_eq!(rig.result(0x25, &[0x01]), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::BEEP_ON_SCAN), Some(3));
    assert_eq!(rig.term.config.get_i64(keys::BEEP_ON_NFC), Some(1));
    assert_eq!(rig.result(0x25, &[0x00]), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::BEEP_ON_SCAN), Some(2));
}

#[test]
fn report_mode_stores_mode_and_timeout() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x31, &[0x80, 0x04]), RESULT_OK);
    assert_eq!(rig.term.config.get_text(keys::REPORT_MODE).as_deref(), Some("80"));
    assert_eq!(rig.term.config.get_i64(keys::REPORT_TIMEOUT), Some(200));
    assert_eq!(rig.result(0x31, &[0x05]), RESULT_FAIL);
    assert_eq!(rig.result(0x31, &[]), RESULT_FAIL);
}

#[test]
fn version_prefers_device_config() {
    let mut rig = Rig::new();
    rig.term.config.insert(keys::VERSION, "2.1.0");
    assert_eq!(rig.send(0x37, &[]).unwrap().payload, b"2.1.0".to_vec());
}

// ── Secure module replies ────────────────────────────────────

#[test]
fn random_reply_feeds_the_bridge() {
    let mut rig = Rig::new();
    let ticket = rig.bridge.register(bridge_keys::RANDOM);
    assert!(rig.send(0x07, &[1, 2, 3, 4]).is_none());
    assert_eq!(ticket.wait(Duration::ZERO), Ok(vec![1, 2, 3, 4]));
}

#[test]
fn safe_mode_routes_uuid_and_decoder_replies() {
    let mut rig = Rig::new();
    rig.term.config.insert(keys::SAFE_OPEN, 1i64);

    let ticket = rig.bridge.register(bridge_keys::UPDATE_KEY);
    let packet = Packet::reply(0x0b, 0x00, Vec::new());
    let reply = rig
        .dispatcher
        .handle(TransportId::Rs485, &packet, 0, &mut rig.term.ports());
    assert!(reply.is_none());
    assert_eq!(ticket.wait(Duration::ZERO), Ok(vec![0x00]));

    let ticket = rig.bridge.register(bridge_keys::OPEN_DOOR);
    assert!(rig.send(0x21, &[0x01]).is_none());
    assert_eq!(ticket.wait(Duration::ZERO), Ok(vec![0x01]));
    assert!(rig.term.os.reboots().is_empty());
}

// ── Card reader ──────────────────────────────────────────────

fn block_read(key_type: u8, block: u8, key: [u8; 6]) -> Vec<u8> {
    let mut p = vec![key_type, block];
    p.extend_from_slice(&key);
    p
}

#[test]
fn card_block_read_checks_key_and_range() {
    let mut rig = Rig::new();
    let reply = rig.send(0x51, &block_read(0x60, 4, [0xff; 6])).unwrap();
    assert_eq!(reply.result, Some(RESULT_OK));
    assert_eq!(reply.payload, vec![0; 16]);

    assert_eq!(rig.result(0x51, &block_read(0x60, 4, [0x01; 6])), RESULT_FAIL);
    assert_eq!(rig.result(0x51, &block_read(0x61, 60, [0x01; 6])), RESULT_FAIL);
    assert_eq!(rig.result(0x51, &[0x60, 4, 0xff]), RESULT_FAIL);

    rig.term.card.absent = true;
    assert_eq!(rig.result(0x51, &block_read(0x60, 4, [0xff; 6])), RESULT_FAIL);
}

#[test]
fn card_block_write_then_sector_read() {
    let mut rig = Rig::new();
    let mut write = block_read(0x61, 5, [0x11; 6]);
    write.extend_from_slice(&[0xab; 16]);
    assert_eq!(rig.result(0x52, &write), RESULT_OK);

    // task, key type, sector 1, logical block 1, count 1, key
    let mut sector = vec![0x00, 0x61, 0x01, 0x01, 0x01];
    sector.extend_from_slice(&[0x11; 6]);
    let reply = rig.send(0xa0, &sector).unwrap();
    assert_eq!(reply.result, Some(RESULT_OK));
    assert_eq!(reply.payload, vec![0xab; 16]);

    assert_eq!(rig.result(0xa1, &sector), RESULT_FAIL);
}

#[test]
fn card_report_toggles_nfc_report() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x53, &[0x02]), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::NFC_REPORT), Some(1));
    assert_eq!(rig.result(0x53, &[0x03]), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::NFC_REPORT), Some(0));
    assert_eq!(rig.result(0x53, &[0x09]), RESULT_FAIL);
}

// ── Screen ───────────────────────────────────────────────────

#[test]
fn ack_shows_message() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x61, br#"{"ack":"OK","msg":"Welcome"}"#), RESULT_OK);
    assert_eq!(
        rig.term.display.calls,
        vec![DisplayCall::Message("OK\nWelcome".into())]
    );
    assert_eq!(rig.result(0x61, b"not json"), RESULT_FAIL);
}

#[test]
fn display_text_and_qr_pages() {
    let mut rig = Rig::new();
    let mut text = vec![0x01];
    text.extend_from_slice(br#"{"page_data":"Hello","key_left":"Back"}"#);
    assert_eq!(rig.result(0x62, &text), RESULT_OK);

    let mut qr = vec![0x02];
    qr.extend_from_slice(br#"{"dynamic_qr_str":"https://x"}"#);
    assert_eq!(rig.result(0x62, &qr), RESULT_OK);

    assert_eq!(
        rig.term.display.calls,
        vec![
            DisplayCall::Page(PageContent::Text {
                center: "Hello".into(),
                left: Some("Back".into()),
                middle: None,
                right: None,
            }),
            DisplayCall::Page(PageContent::Qr("https://x".into())),
        ]
    );
}

#[test]
fn show_image_needs_the_file() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x63, &[0x00, 0x03]), RESULT_FAIL);
    let path = format!("{}/3.png", StackConfig::default().image_dir);
    rig.term.storage.files.insert(path, vec![0x89]);
    assert_eq!(rig.result(0x63, &[0x00, 0x03]), RESULT_OK);
    assert_eq!(rig.term.display.calls, vec![DisplayCall::Image(3)]);
}

#[test]
fn window_toggles_system_info() {
    let mut rig = Rig::new();
    assert_eq!(rig.result(0x64, &[0x01, 0x00]), RESULT_OK);
    assert_eq!(rig.result(0x64, &[0x02, 0x00]), RESULT_OK);
    assert_eq!(rig.result(0x64, &[0x03, 0x00]), RESULT_FAIL);
    assert_eq!(
        rig.term.display.calls,
        vec![DisplayCall::SystemInfo(false), DisplayCall::SystemInfo(true)]
    );
}

#[test]
fn popup_requires_all_fields() {
    let mut rig = Rig::new();
    let body = br#"{"msg":"Door open","isCloseEnable":true,"msgTimeoutMs":"3000"}"#;
    assert_eq!(rig.result(0x65, body), RESULT_OK);
    assert_eq!(
        rig.term.display.calls,
        vec![DisplayCall::Popup {
            text: "Door open".into(),
            timeout_ms: 3000,
            closable: true
        }]
    );
    assert_eq!(rig.result(0x65, br#"{"msg":"x","isCloseEnable":0}"#), RESULT_FAIL);
    assert_eq!(rig.result(0x65, br#"{"msg":"","isCloseEnable":0,"msgTimeoutMs":1}"#), RESULT_FAIL);
}

#[test]
fn resource_delete_removes_existing_file() {
    let mut rig = Rig::new();
    let path = format!("{}/7.wav", StackConfig::default().audio_dir);
    rig.term.storage.files.insert(path.clone(), vec![0]);
    assert_eq!(rig.result(0x8a, &[0x02, 0x00, 0x07]), RESULT_OK);
    assert!(!rig.term.storage.files.contains_key(&path));
    assert_eq!(rig.result(0x8a, &[0x02, 0x00, 0x07]), RESULT_FAIL);
    assert_eq!(rig.result(0x8a, &[0x03, 0x07]), RESULT_FAIL);
}

// ── Device config (0xb0) ─────────────────────────────────────

fn signed(entries: &[(&str, vgstack::app::ports::ConfigValue)]) -> Vec<u8> {
    let mut p = vec![0x01];
    p.extend_from_slice(config_code::build(entries, DEFAULT_PASSWORD).as_bytes());
    p
}

#[test]
fn device_config_snapshot() {
    let mut rig = Rig::new();
    rig.term.config.insert(keys::DEVICE_NUMBER, 12i64);
    let reply = rig.send(0xb0, &[0x00]).unwrap();
    assert_eq!(reply.result, Some(RESULT_OK));
    let json: Value = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(json["sysInfo.devnum"], 12);
}

#[test]
fn signed_config_code_applies_entries() {
    let mut rig = Rig::new();
    let code = signed(&[("devnum", 12i64.into()), ("heart_data", "ping".into())]);
    assert_eq!(rig.result(0xb0, &code), RESULT_OK);
    assert_eq!(rig.term.config.get_i64(keys::DEVICE_NUMBER), Some(12));
    assert_eq!(rig.term.config.get_text(keys::HEART_DATA).as_deref(), Some("ping"));
    assert_eq!(
        rig.term.device.calls,
        vec![DeviceCall::Beep {
            on_ms: 50,
            off_ms: 0,
            count: 1
        }]
    );
    assert!(rig.term.os.reboots().is_empty());
}

#[test]
fn config_code_sn_and_reboot_are_not_stored() {
    let mut rig = Rig::new();
    let code = signed(&[("sn", "VG7".into()), ("reboot", 1i64.into())]);
    assert_eq!(rig.result(0xb0, &code), RESULT_OK);
    assert_eq!(rig.term.device.identity.serial_number, "VG7");
    assert_eq!(rig.term.os.reboots(), vec![2, 1]);
    assert!(rig.term.config.get("sysInfo.sn").is_none());
    assert!(rig.term.config.get("sysInfo.reboot").is_none());
}

#[test]
fn bad_signature_is_silent_but_signalled() {
    let mut rig = Rig::new();
    let mut code = signed(&[("devnum", 12i64.into())]);
    code.push(b'x');
    assert!(rig.send(0xb0, &code).is_none());
    assert!(rig.term.config.get(keys::DEVICE_NUMBER).is_none());
    assert_eq!(
        rig.term.device.calls,
        vec![DeviceCall::Beep {
            on_ms: 50,
            off_ms: 50,
            count: 2
        }]
    );
}

#[test]
fn custom_password_is_honoured() {
    let mut rig = Rig::new();
    rig.term.config.insert(keys::CONFIG_PASSWORD, "secret");
    let default_signed = signed(&[("devnum", 3i64.into())]);
    assert!(rig.send(0xb0, &default_signed).is_none());

    let mut code = vec![0x01];
    code.extend_from_slice(config_code::build(&[("devnum", 3i64.into())], "secret").as_bytes());
    assert_eq!(rig.result(0xb0, &code), RESULT_OK);
}

// ── Sub-controller link ──────────────────────────────────────

#[test]
fn sub_controller_ack_reaches_the_bridge() {
    let mut rig = Rig::new();
    let ticket = rig.bridge.register("subctl.upgrade.1");
    let body = [0x03, 0x01, 0x80, 0x01, 0x00, 0x00];
    let packet = Packet::reply(0x60, RESULT_OK, body.to_vec());
    let reply = rig
        .dispatcher
        .handle(TransportId::SubController, &packet, 0, &mut rig.term.ports());
    assert!(reply.is_none());
    assert_eq!(ticket.wait(Duration::ZERO), Ok(body.to_vec()));
}

#[test]
fn sub_controller_data_echoes_index() {
    let mut rig = Rig::new();
    let reply = rig
        .send_from(TransportId::SubController, 0x0f, b"\x00\x00\x00\x00\x00ABC\x07")
        .unwrap();
    assert_eq!(reply.result, Some(RESULT_OK));
    assert_eq!(reply.payload, vec![0x07]);

    let short = rig
        .send_from(TransportId::SubController, 0x0f, &[0x00, 0x09])
        .unwrap();
    assert_eq!(short.result, Some(RESULT_FAIL));
    assert_eq!(short.payload, vec![0x09]);
}
