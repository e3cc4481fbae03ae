//! Firmware (`0x54..0x5a`) and resource (`0x81..0x83`) upgrades driven
//! through the dispatcher, watchdog included.

use std::sync::Arc;

use vgstack::app::events::{StackEvent, UpgradeTarget};
use vgstack::config::StackConfig;
use vgstack::error::{IntegrityError, UpgradeError};
use vgstack::proto::codec::{Packet, RESULT_FAIL, RESULT_OK};
use vgstack::proto::dispatch::CommandDispatcher;
use vgstack::proto::sync::SyncBridge;
use vgstack::proto::transport::TransportId;
use vgstack::proto::upgrade::UpgradeState;

use crate::mock_ports::{DeviceCall, MockTerminal, OsCall};

struct Rig {
    dispatcher: CommandDispatcher,
    term: MockTerminal,
    config: StackConfig,
}

impl Rig {
    fn new() -> Self {
        let config = StackConfig::default();
        Self {
            dispatcher: CommandDispatcher::new(config.clone(), Arc::new(SyncBridge::new())),
            term: MockTerminal::new(),
            config,
        }
    }

    fn at(&mut self, now_ms: u64, command: u8, payload: &[u8]) -> u8 {
        let packet = Packet::request(command, payload.to_vec());
        self.dispatcher
            .handle(TransportId::Tcp, &packet, now_ms, &mut self.term.ports())
            .and_then(|p| p.result)
            .expect("a reply with a result byte")
    }

    fn tick(&mut self, now_ms: u64) {
        self.dispatcher.tick(now_ms, &mut self.term.ports());
    }

    fn firmware_state(&self) -> UpgradeState {
        self.dispatcher.firmware_session().state()
    }

    fn staged(&self) -> Option<&Vec<u8>> {
        self.term.storage.files.get(&self.config.firmware_staging_path)
    }
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn start_payload(total: u32) -> Vec<u8> {
    total.to_le_bytes().to_vec()
}

/// The digest an upgrade host sends for a staged image.
fn host_md5(img: &[u8]) -> [u8; 16] {
    md5::compute(img).0
}

// ── Firmware ─────────────────────────────────────────────────

#[test]
fn firmware_upgrade_end_to_end() {
    let mut rig = Rig::new();
    let img = image(3000);

    assert_eq!(rig.at(0, 0x54, &start_payload(3000)), RESULT_OK);
    for (i, chunk) in img.chunks(1024).enumerate() {
        assert_eq!(rig.at(100 * (i as u64 + 1), 0x58, chunk), RESULT_OK);
    }
    assert_eq!(rig.staged(), Some(&img));

    assert_eq!(rig.at(400, 0x5a, &host_md5(&img)), RESULT_OK);
    assert_eq!(rig.firmware_state(), UpgradeState::Verifying);
    assert_eq!(rig.at(500, 0x57, &[]), RESULT_OK);
    assert_eq!(rig.firmware_state(), UpgradeState::Idle);

    assert_eq!(
        rig.term.os.calls,
        vec![
            OsCall::Unpack {
                archive: rig.config.firmware_staging_path.clone(),
                dest: format!("{}/temp", rig.config.ota_root),
            },
            OsCall::RunInstaller {
                script_path: rig.config.installer_script.clone(),
            },
            OsCall::Reboot(2),
        ]
    );

    let fw = UpgradeTarget::Firmware;
    assert_eq!(
        rig.term.events.events,
        vec![
            StackEvent::UpgradeStarted { target: fw, total: 3000 },
            StackEvent::UpgradeProgress { target: fw, percent: 34 },
            StackEvent::UpgradeProgress { target: fw, percent: 68 },
            StackEvent::UpgradeProgress { target: fw, percent: 100 },
            StackEvent::UpgradeInstalled { target: fw },
        ]
    );
}

#[test]
fn raw_md5_from_host_verifies() {
    let mut rig = Rig::new();
    let img = image(1536);
    assert_eq!(rig.at(0, 0x54, &start_payload(1536)), RESULT_OK);
    for chunk in img.chunks(512) {
        assert_eq!(rig.at(1, 0x58, chunk), RESULT_OK);
    }
    let digest = host_md5(&img);
    assert_eq!(digest.len(), 16);
    assert_eq!(rig.at(2, 0x5a, &digest), RESULT_OK);
    assert_eq!(rig.firmware_state(), UpgradeState::Verifying);
}

#[test]
fn hex_md5_is_accepted() {
    let mut rig = Rig::new();
    let img = image(64);
    assert_eq!(rig.at(0, 0x54, &start_payload(64)), RESULT_OK);
    assert_eq!(rig.at(1, 0x58, &img), RESULT_OK);
    let digest = hex::encode(host_md5(&img));
    assert_eq!(rig.at(2, 0x5a, digest.as_bytes()), RESULT_OK);
    assert_eq!(rig.firmware_state(), UpgradeState::Verifying);
}

#[test]
fn sha256_digest_is_not_a_storage_digest() {
    let mut rig = Rig::new();
    let img = image(64);
    assert_eq!(rig.at(0, 0x54, &start_payload(64)), RESULT_OK);
    assert_eq!(rig.at(1, 0x58, &img), RESULT_OK);
    assert_eq!(rig.at(2, 0x5a, &hmac_sha256::Hash::hash(&img)), RESULT_FAIL);
    // The malformed verify leaves the image staged for a retry.
    assert_eq!(rig.firmware_state(), UpgradeState::Transferring);
    assert_eq!(rig.at(3, 0x5a, &host_md5(&img)), RESULT_OK);
}

#[test]
fn digest_mismatch_discards_staging() {
    let mut rig = Rig::new();
    assert_eq!(rig.at(0, 0x54, &start_payload(16)), RESULT_OK);
    assert_eq!(rig.at(1, 0x58, &image(16)), RESULT_OK);
    assert_eq!(rig.at(2, 0x5a, &[0u8; 16]), RESULT_FAIL);

    assert_eq!(rig.firmware_state(), UpgradeState::Idle);
    assert!(rig.staged().is_none());
    assert_eq!(
        rig.term.events.events.last(),
        Some(&StackEvent::UpgradeFailed {
            target: UpgradeTarget::Firmware,
            error: UpgradeError::Integrity(IntegrityError::DigestMismatch),
        })
    );
    // Nothing left to install.
    assert_eq!(rig.at(3, 0x57, &[]), RESULT_FAIL);
    assert!(rig.term.os.calls.is_empty());
}

#[test]
fn short_image_fails_size_check() {
    let mut rig = Rig::new();
    let img = image(32);
    assert_eq!(rig.at(0, 0x54, &start_payload(32)), RESULT_OK);
    assert_eq!(rig.at(1, 0x58, &img[..20]), RESULT_OK);
    assert_eq!(rig.at(2, 0x5a, &host_md5(&img)), RESULT_FAIL);
    assert_eq!(
        rig.term.events.events.last(),
        Some(&StackEvent::UpgradeFailed {
            target: UpgradeTarget::Firmware,
            error: UpgradeError::Integrity(IntegrityError::SizeMismatch {
                expected: 32,
                actual: 20,
            }),
        })
    );
}

#[test]
fn overflowing_chunk_is_refused_but_session_survives() {
    let mut rig = Rig::new();
    assert_eq!(rig.at(0, 0x54, &start_payload(10)), RESULT_OK);
    assert_eq!(rig.at(1, 0x58, &image(11)), RESULT_FAIL);
    assert!(rig.dispatcher.firmware_session().is_active());
    assert_eq!(rig.at(2, 0x58, &image(10)), RESULT_OK);
    assert_eq!(rig.dispatcher.firmware_session().transferred(), 10);
}

#[test]
fn start_validates_size() {
    let mut rig = Rig::new();
    assert_eq!(rig.at(0, 0x54, &start_payload(0)), RESULT_FAIL);
    assert_eq!(rig.at(0, 0x54, &[]), RESULT_FAIL);
    let too_big = rig.config.max_image_size + 1;
    assert_eq!(rig.at(0, 0x54, &too_big.to_le_bytes()), RESULT_FAIL);
    assert_eq!(rig.firmware_state(), UpgradeState::Idle);
}

#[test]
fn second_start_refused_until_idle_expiry() {
    let mut rig = Rig::new();
    assert_eq!(rig.at(0, 0x54, &start_payload(100)), RESULT_OK);
    assert_eq!(rig.at(500, 0x54, &start_payload(100)), RESULT_FAIL);
    assert_eq!(rig.at(2500, 0x54, &start_payload(200)), RESULT_OK);
    assert_eq!(rig.dispatcher.firmware_session().total(), 200);
    assert!(rig.term.events.events.contains(&StackEvent::UpgradeInterrupted {
        target: UpgradeTarget::Firmware
    }));
}

#[test]
fn idle_watchdog_interrupts_after_2000ms() {
    let mut rig = Rig::new();
    assert_eq!(rig.at(0, 0x54, &start_payload(100)), RESULT_OK);
    assert_eq!(rig.at(1000, 0x58, &image(10)), RESULT_OK);

    rig.tick(3000);
    assert!(rig.dispatcher.firmware_session().is_active());
    assert!(rig.term.device.calls.is_empty());

    rig.tick(3001);
    assert_eq!(rig.firmware_state(), UpgradeState::Idle);
    assert!(rig.staged().is_none());
    assert_eq!(
        rig.term.device.calls,
        vec![DeviceCall::Beep {
            on_ms: 50,
            off_ms: 0,
            count: 1
        }]
    );
    let interrupts = rig
        .term
        .events
        .events
        .iter()
        .filter(|e| matches!(e, StackEvent::UpgradeInterrupted { .. }))
        .count();
    assert_eq!(interrupts, 1);

    // Already idle: later ticks do nothing.
    rig.tick(10_000);
    assert_eq!(rig.term.device.beeps(), 1);
}

#[test]
fn stop_abandons_transfer() {
    let mut rig = Rig::new();
    assert_eq!(rig.at(0, 0x54, &start_payload(100)), RESULT_OK);
    assert_eq!(rig.at(1, 0x58, &image(10)), RESULT_OK);
    assert_eq!(rig.at(2, 0x56, &[]), RESULT_OK);
    assert_eq!(rig.firmware_state(), UpgradeState::Idle);
    assert!(rig.staged().is_none());
    assert_eq!(rig.at(3, 0x58, &image(10)), RESULT_FAIL);
}

#[test]
fn install_failure_is_reported() {
    let mut rig = Rig::new();
    rig.term.os.fail_install = true;
    let img = image(8);
    assert_eq!(rig.at(0, 0x54, &start_payload(8)), RESULT_OK);
    assert_eq!(rig.at(1, 0x58, &img), RESULT_OK);
    assert_eq!(rig.at(2, 0x5a, &host_md5(&img)), RESULT_OK);
    assert_eq!(rig.at(3, 0x57, &[]), RESULT_FAIL);
    assert_eq!(rig.firmware_state(), UpgradeState::Idle);
    assert!(rig.term.os.reboots().is_empty());
    assert_eq!(
        rig.term.events.events.last(),
        Some(&StackEvent::UpgradeFailed {
            target: UpgradeTarget::Firmware,
            error: UpgradeError::InstallFailed,
        })
    );
}

#[test]
fn storage_failure_aborts_session() {
    let mut rig = Rig::new();
    assert_eq!(rig.at(0, 0x54, &start_payload(16)), RESULT_OK);
    rig.term.storage.fail_writes = true;
    assert_eq!(rig.at(1, 0x58, &image(8)), RESULT_FAIL);
    assert_eq!(rig.firmware_state(), UpgradeState::Idle);
}

// ── Resources ────────────────────────────────────────────────

fn resource_start(count: u16, total: u32) -> Vec<u8> {
    let mut p = vec![0x01];
    p.extend_from_slice(&count.to_le_bytes());
    p.extend_from_slice(&total.to_le_bytes());
    p
}

fn resource_chunk(index: u16, data: &[u8]) -> Vec<u8> {
    let mut p = index.to_le_bytes().to_vec();
    p.extend_from_slice(data);
    p
}

#[test]
fn resource_bundle_installs_without_reboot() {
    let mut rig = Rig::new();
    let img = image(700);

    assert_eq!(rig.at(0, 0x81, &resource_start(2, 700)), RESULT_OK);
    assert_eq!(
        rig.dispatcher.resource_session().expected_chunks(),
        Some(2)
    );
    assert_eq!(rig.at(1, 0x82, &resource_chunk(0, &img[..512])), RESULT_OK);
    assert_eq!(rig.at(2, 0x82, &resource_chunk(1, &img[512..])), RESULT_OK);

    let mut finish = vec![0x00, 0x00];
    finish.extend_from_slice(&host_md5(&img));
    assert_eq!(rig.at(3, 0x83, &finish), RESULT_OK);

    assert_eq!(rig.dispatcher.resource_session().state(), UpgradeState::Idle);
    assert!(rig.term.os.reboots().is_empty());
    assert!(matches!(rig.term.os.calls[0], OsCall::Unpack { .. }));
    assert_eq!(
        rig.term.events.events.last(),
        Some(&StackEvent::UpgradeInstalled {
            target: UpgradeTarget::Resource
        })
    );
}

#[test]
fn resource_finish_accepts_hex_md5() {
    let mut rig = Rig::new();
    let img = image(300);
    assert_eq!(rig.at(0, 0x81, &resource_start(1, 300)), RESULT_OK);
    assert_eq!(rig.at(1, 0x82, &resource_chunk(0, &img)), RESULT_OK);
    let mut finish = vec![0x00, 0x00];
    finish.extend_from_slice(hex::encode(host_md5(&img)).as_bytes());
    assert_eq!(rig.at(2, 0x83, &finish), RESULT_OK);
    assert_eq!(
        rig.term.events.events.last(),
        Some(&StackEvent::UpgradeInstalled {
            target: UpgradeTarget::Resource
        })
    );
}

#[test]
fn resource_and_firmware_sessions_are_independent() {
    let mut rig = Rig::new();
    assert_eq!(rig.at(0, 0x54, &start_payload(100)), RESULT_OK);
    assert_eq!(rig.at(1, 0x81, &resource_start(1, 50)), RESULT_OK);
    assert!(rig.dispatcher.firmware_session().is_active());
    assert!(rig.dispatcher.resource_session().is_active());
}

#[test]
fn resource_commands_validate_length() {
    let mut rig = Rig::new();
    assert_eq!(rig.at(0, 0x81, &[0x01, 0x02]), RESULT_FAIL);
    assert_eq!(rig.at(0, 0x82, &[0x00]), RESULT_FAIL);
    assert_eq!(rig.at(0, 0x83, &[0x00, 0x00, 0x01]), RESULT_FAIL);
}
