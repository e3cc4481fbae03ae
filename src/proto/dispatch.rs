//! Control-channel command dispatcher.
//!
//! ```text
//!  Packet ─▶ gate ─▶ handler ─┬─▶ reply Packet (same command code)
//!                             ├─▶ ports (config, device, card, display, os)
//!                             ├─▶ SyncBridge (secure-module / sub-controller replies)
//!                             └─▶ outbox (reports, heartbeats)
//! ```
//!
//! The gate drops everything but the service commands while the terminal
//! is outside protocol mode. Frames from the sub-controller link skip the
//! gate and only ever carry `0x60` replies and `0x0f` user data.
//!
//! Handlers never panic on short payloads: a malformed request is answered
//! with result `0x90`. Commands that feed the [`SyncBridge`] get no reply.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{Map, Value};

use super::codec::{Packet, RESULT_FAIL, RESULT_NO_SENSOR, RESULT_OK};
use super::command::Command;
use super::config_code;
use super::router::{
    ChannelRouter, DataFormat, DataSource, Outbound, OutputChannelConfig, ReportMode, WorkMode,
};
use super::subctl;
use super::sync::SyncBridge;
use super::transport::TransportId;
use super::upgrade::{DigestKind, ImageDigest, StagingLayout, StorageUpload, UpgradeSession};
use crate::app::events::UpgradeTarget;
use crate::app::ports::{
    CardKey, ConfigError, ConfigPort, ConfigValue, EventSink, PageContent, Ports, RelayAction,
    SectorRequest,
};
use crate::config::{StackConfig, keys};
use crate::error::DispatchError;

/// Bridge keys the secure module's replies are delivered under.
pub mod bridge_keys {
    pub const RANDOM: &str = "getRandom";
    pub const UPDATE_KEY: &str = "updateKey";
    pub const OPEN_DOOR: &str = "openDoor";
    pub const RELAY_DURATION: &str = "updateRelayd";
}

const REBOOT_DELAY_SECS: u32 = 2;
const MESSAGE_MS: u32 = 2000;
const IMAGE_MS: u32 = 2000;
/// Beep, relay and report-timeout fields count in 50 ms units.
const TIME_UNIT_MS: u32 = 50;
const MAX_SCAN_INTERVAL_MS: u64 = 6000;
/// Longest heartbeat period accepted from a host, one day.
const MAX_HEARTBEAT_SECS: i64 = 86_400;
const MAX_CARD_BLOCK: u8 = 59;
const KEY_TYPE_A: u8 = 0x60;
const KEY_TYPE_B: u8 = 0x61;
const CARD_BLOCK_LEN: usize = 16;
const SECTOR_HEADER_LEN: usize = 11;
/// `de_type` with every barcode decoder enabled.
const ALL_DECODERS: i64 = 64510;
const DEFAULT_BEEP_MS: i64 = 50;

/// `de_type` bit for each bit of the first `0x21` control byte.
/// Bits 1..3 (DM, barcode enable, NFC) have no decoder bit of their own.
const PRIMARY_DECODER_BITS: [Option<u8>; 8] =
    [Some(0), None, None, None, Some(1), Some(2), Some(3), Some(4)];
const SECONDARY_DECODER_BITS: [u8; 8] = [5, 6, 7, 8, 9, 11, 12, 13];

type Reply = Result<Option<Packet>, DispatchError>;

// ── Upgrade slots ────────────────────────────────────────────

/// A storage-backed upgrade session and where it stages.
struct UpgradeSlot {
    session: UpgradeSession,
    layout: StagingLayout,
}

impl UpgradeSlot {
    /// Lend the session a storage strategy built from the borrowed ports.
    fn run<R>(
        &mut self,
        ports: &mut Ports<'_>,
        op: impl FnOnce(&mut UpgradeSession, &mut StorageUpload<'_>, &mut dyn EventSink) -> R,
    ) -> R {
        let mut strategy = StorageUpload::new(&mut *ports.storage, &mut *ports.os, &self.layout);
        op(&mut self.session, &mut strategy, &mut *ports.events)
    }
}

/// Heartbeat configured over RS-485 with `0x2b`. Lives only in memory.
#[derive(Debug, Clone, Default)]
struct LinkHeartbeat {
    enabled: bool,
    period_secs: u64,
    data: String,
    last_ms: Option<u64>,
}

fn heartbeat_due(last_ms: Option<u64>, period_secs: u64, now_ms: u64) -> bool {
    last_ms.is_none_or(|t| now_ms.saturating_sub(t) >= period_secs.saturating_mul(1000))
}

// ── Dispatcher ───────────────────────────────────────────────

pub struct CommandDispatcher {
    config: StackConfig,
    bridge: Arc<SyncBridge>,
    router: ChannelRouter,
    firmware: UpgradeSlot,
    resource: UpgradeSlot,
    link_heartbeat: LinkHeartbeat,
    last_network_heartbeat: Option<u64>,
    outbox: Vec<Outbound>,
}

impl CommandDispatcher {
    pub fn new(config: StackConfig, bridge: Arc<SyncBridge>) -> Self {
        let temp = format!("{}/temp", config.ota_root);
        let firmware = UpgradeSlot {
            session: UpgradeSession::new(
                UpgradeTarget::Firmware,
                config.upgrade_idle_ms,
                config.max_image_size,
            ),
            layout: StagingLayout {
                staging_path: config.firmware_staging_path.clone(),
                unpack_dir: temp.clone(),
                script_path: config.installer_script.clone(),
                script: format!(
                    "cp -r {}/* {}\nrm -rf {}\n",
                    temp, config.app_dir, config.ota_root
                ),
                reboot_after_secs: Some(REBOOT_DELAY_SECS),
            },
        };
        let resource = UpgradeSlot {
            session: UpgradeSession::new(
                UpgradeTarget::Resource,
                config.upgrade_idle_ms,
                config.max_image_size,
            ),
            layout: StagingLayout {
                staging_path: config.resource_staging_path.clone(),
                unpack_dir: temp.clone(),
                script_path: config.installer_script.clone(),
                script: format!(
                    "cp -r {t}/vgapp/res/image/* {img}/ 2>/dev/null\n\
                     cp {t}/vgapp/wav/*.wav {wav}/ 2>/dev/null\n\
                     rm -rf {root}\n",
                    t = temp,
                    img = config.image_dir,
                    wav = config.audio_dir,
                    root = config.ota_root
                ),
                reboot_after_secs: None,
            },
        };
        let link_heartbeat = LinkHeartbeat {
            period_secs: u64::from(config.heartbeat_floor_secs),
            ..LinkHeartbeat::default()
        };
        Self {
            config,
            bridge,
            router: ChannelRouter::new(),
            firmware,
            resource,
            link_heartbeat,
            last_network_heartbeat: None,
            outbox: Vec::new(),
        }
    }

    pub fn firmware_session(&self) -> &UpgradeSession {
        &self.firmware.session
    }

    pub fn resource_session(&self) -> &UpgradeSession {
        &self.resource.session
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.router
    }

    /// Frames produced outside a direct reply (reports, heartbeats).
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        core::mem::take(&mut self.outbox)
    }

    /// Route fresh business data (scan, card, password) per report mode.
    pub fn report(
        &mut self,
        config: &dyn ConfigPort,
        source: DataSource,
        data: &[u8],
        now_ms: u64,
    ) -> Vec<Outbound> {
        self.router.report(config, source, data, now_ms)
    }

    /// Handle one decoded packet. Returns the reply for the source, if any.
    pub fn handle(
        &mut self,
        source: TransportId,
        packet: &Packet,
        now_ms: u64,
        ports: &mut Ports<'_>,
    ) -> Option<Packet> {
        let code = packet.command;
        if source == TransportId::SubController {
            let Ok(command) = Command::try_from(code) else {
                debug!("VG[{}]: unknown cmd 0x{:02x} ignored", source, code);
                return None;
            };
            return self.handle_subcontroller(command, packet, now_ms, ports);
        }

        let protocol = OutputChannelConfig::load(ports.config).protocol_enabled();
        let Ok(command) = Command::try_from(code) else {
            if !protocol {
                return None;
            }
            warn!("VG[{}]: {}", source, DispatchError::UnknownCommand(code));
            return Some(Packet::fail(code));
        };
        if !protocol && !command.is_service_command() {
            debug!("VG[{}]: {:?} ignored outside protocol mode", source, command);
            return None;
        }
        if command.is_subcontroller_only() {
            warn!("VG[{}]: {:?} only valid on the sub-controller link", source, command);
            return Some(Packet::fail(code));
        }

        if command.is_bulk() {
            debug!("VG[{}]: {:?} ({} bytes)", source, command, packet.payload.len());
        } else {
            info!("VG[{}]: {:?} ({} bytes)", source, command, packet.payload.len());
        }
        match self.dispatch(command, source, packet, now_ms, ports) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("VG[{}]: {:?} rejected: {}", source, command, e);
                Some(Packet::fail(code))
            }
        }
    }

    /// Periodic work: upgrade idle watchdogs and heartbeats. Returns every
    /// frame queued since the last drain.
    pub fn tick(&mut self, now_ms: u64, ports: &mut Ports<'_>) -> Vec<Outbound> {
        for slot in [&mut self.firmware, &mut self.resource] {
            if slot.run(ports, |session, strategy, events| {
                session.tick(strategy, events, now_ms)
            }) {
                ports.device.beep(TIME_UNIT_MS, 0, 1);
            }
        }
        self.network_heartbeat(now_ms, ports.config);
        self.link_heartbeat(now_ms, ports.config);
        self.take_outbound()
    }

    fn dispatch(
        &mut self,
        command: Command,
        source: TransportId,
        packet: &Packet,
        now_ms: u64,
        ports: &mut Ports<'_>,
    ) -> Reply {
        let code = u8::from(command);
        let p = packet.payload.as_slice();
        let safe_mode = ports.config.get_i64(keys::SAFE_OPEN) == Some(1);
        match command {
            Command::Status => Ok(Some(Packet::ok_with(code, [0x55, 0xAA]))),
            Command::DeviceNumber => {
                let devnum = ports
                    .config
                    .get_i64(keys::DEVICE_NUMBER)
                    .filter(|&n| n > 0)
                    .map_or([0; 4], |n| (n as u32).to_le_bytes());
                Ok(Some(Packet::ok_with(code, devnum)))
            }
            Command::Time => self.time(p, ports),
            Command::BeepLed => {
                if p.first().is_some_and(|&b| b >> 3 & 1 == 1) {
                    let [_, count, on, off] = first_n::<4>(p)?;
                    ports.device.beep(
                        u32::from(on) * TIME_UNIT_MS,
                        u32::from(off) * TIME_UNIT_MS,
                        count,
                    );
                }
                Ok(Some(Packet::ok(code)))
            }
            Command::CodeSwitch => {
                let enabled = match p {
                    [0x00] => 1i64,
                    [0x01] => 0,
                    _ => return Err(DispatchError::InvalidPayload("switch must be 00 or 01")),
                };
                done(command, ports.config.set(keys::CODE_SWITCH, enabled.into()))
            }
            Command::KeyReport
            | Command::Backlight
            | Command::Gpio0
            | Command::Gpio1
            | Command::GpioLevel
            | Command::KeyValue
            | Command::Apdu => Ok(Some(Packet::ok(code))),
            Command::Random => {
                self.bridge.respond(bridge_keys::RANDOM, p);
                Ok(None)
            }
            Command::RelayDuration => {
                self.bridge
                    .respond(bridge_keys::RELAY_DURATION, &secure_reply(packet));
                Ok(None)
            }
            Command::DoorSensor => Ok(Some(match ports.device.door_open() {
                Some(open) => Packet::ok_with(code, [door_state(open)]),
                None => Packet::reply(code, RESULT_NO_SENSOR, Vec::new()),
            })),
            Command::SerialNumber => {
                if p.is_empty() {
                    let sn = ports.device.identity().serial_number;
                    return Ok(Some(Packet::ok_with(code, sn.into_bytes())));
                }
                let sn = String::from_utf8_lossy(p).into_owned();
                if let Err(e) = ports.device.write_serial_number(&sn) {
                    warn!("VG: serial number write failed: {}", e);
                    return Ok(Some(Packet::fail(code)));
                }
                ports.os.reboot(REBOOT_DELAY_SECS);
                Ok(Some(Packet::ok_with(code, sn.into_bytes())))
            }
            Command::Uuid => {
                if safe_mode {
                    self.bridge
                        .respond(bridge_keys::UPDATE_KEY, &secure_reply(packet));
                    return Ok(None);
                }
                let uuid = ports.device.identity().uuid;
                Ok(Some(Packet::ok_with(code, uuid.into_bytes())))
            }
            Command::ChipId => {
                let id = ports.device.identity().chip_id;
                Ok(Some(Packet::ok_with(code, id.into_bytes())))
            }
            Command::Mac => {
                let mac = ports.device.identity().mac;
                Ok(Some(Packet::ok_with(code, mac.into_bytes())))
            }
            Command::DecoderTypes => {
                if safe_mode {
                    self.bridge
                        .respond(bridge_keys::OPEN_DOOR, &secure_reply(packet));
                    return Ok(None);
                }
                self.decoder_types(p, ports)
            }
            Command::ScanMode => {
                let entries: Vec<(&str, ConfigValue)> = match p {
                    [0x02] => vec![(keys::SCAN_MODE, 1i64.into())],
                    [0x01] => vec![(keys::SCAN_MODE, 2i64.into())],
                    [0x03, secs @ ..] if secs.len() == 2 => vec![
                        (keys::SCAN_MODE, 0i64.into()),
                        (keys::SCAN_INTERVAL, (le_uint(secs) as i64 * 1000).into()),
                    ],
                    _ => return Err(DispatchError::InvalidPayload("unknown scan mode")),
                };
                done(command, save_all(ports.config, entries))
            }
            Command::ScanInterval => {
                if safe_mode {
                    // The secure module polls the door with this code and
                    // reads the inverse encoding; no sensor reads as closed.
                    let state = ports.device.door_open().map_or(0x01, |open| door_state(!open));
                    return Ok(Some(Packet::ok_with(Command::DoorSensor.into(), [state])));
                }
                if p.is_empty() {
                    return Err(DispatchError::InvalidPayload("missing interval"));
                }
                let interval = le_uint(p);
                if interval > MAX_SCAN_INTERVAL_MS {
                    return Err(DispatchError::InvalidPayload("interval above 6000 ms"));
                }
                done(
                    command,
                    ports.config.set(keys::SCAN_INTERVAL, (interval as i64).into()),
                )
            }
            Command::BeepOnRead => {
                let scan = ports.config.get_i64(keys::BEEP_ON_SCAN).unwrap_or(0);
                let nfc = ports.config.get_i64(keys::BEEP_ON_NFC).unwrap_or(0);
                let (scan, nfc) = match p {
                    [0x01] => (scan | 1, nfc | 1),
                    [0x00] => (scan & !1, nfc & !1),
                    _ => return Ok(Some(Packet::ok(code))),
                };
                done(
                    command,
                    save_all(
                        ports.config,
                        [(keys::BEEP_ON_SCAN, scan.into()), (keys::BEEP_ON_NFC, nfc.into())],
                    ),
                )
            }
            Command::PlayAudio => {
                let index = be_uint(p) as u32;
                let path = format!("{}/{}.wav", self.config.audio_dir, index);
                if !ports.storage.exists(&path) {
                    warn!("VG: no audio file {}", path);
                    return Ok(Some(Packet::fail(code)));
                }
                ports.device.play_audio(index);
                Ok(Some(Packet::ok(code)))
            }
            Command::Relay => {
                let action = match p {
                    [0x00, ..] => RelayAction::Close,
                    [0x01] => RelayAction::AlwaysOpen,
                    [0x01, units, ..] => RelayAction::OpenFor(u32::from(*units) * TIME_UNIT_MS),
                    _ => return Err(DispatchError::InvalidPayload("relay state must be 00 or 01")),
                };
                ports.device.relay(action);
                Ok(Some(Packet::ok(code)))
            }
            Command::Heartbeat => self.heartbeat_setup(source, p, ports.config),
            Command::PollResult => Ok(Some(self.router.poll(ports.config, false, now_ms))),
            Command::PollTaggedResult => Ok(Some(self.router.poll(ports.config, true, now_ms))),
            Command::ReportMode => {
                let (mode, timeout_ms) = match p {
                    [mode] => (*mode, 0),
                    [mode, units] => (*mode, u32::from((*units).max(1)) * TIME_UNIT_MS),
                    _ => return Err(DispatchError::InvalidPayload("report mode is 1 or 2 bytes")),
                };
                let mode = ReportMode::from_code(mode)
                    .ok_or(DispatchError::InvalidPayload("unknown report mode"))?;
                done(
                    command,
                    save_all(
                        ports.config,
                        [
                            (keys::REPORT_MODE, mode.as_str().into()),
                            (keys::REPORT_TIMEOUT, i64::from(timeout_ms).into()),
                        ],
                    ),
                )
            }
            Command::Version => {
                let version = ports
                    .config
                    .get_text(keys::VERSION)
                    .unwrap_or_else(|| self.config.firmware_version.clone());
                Ok(Some(Packet::ok_with(code, version.into_bytes())))
            }
            Command::CardReadBlock => {
                if p.len() < 8 {
                    return Err(DispatchError::InvalidPayload("block read needs 8 bytes"));
                }
                let key = card_key(p[0], &p[2..8])?;
                if matches!(key, CardKey::A(k) if k != [0xff; 6]) {
                    return Err(DispatchError::InvalidPayload("key A must be ff ff ff ff ff ff"));
                }
                let block = p[1];
                if block > MAX_CARD_BLOCK {
                    return Err(DispatchError::InvalidPayload("block above 59"));
                }
                let task = p.get(8).copied().unwrap_or(0);
                Ok(Some(match ports.card.read_block(task, block, key) {
                    Ok(data) => Packet::ok_with(code, data),
                    Err(e) => {
                        warn!("VG: block {} read failed: {}", block, e);
                        Packet::fail(code)
                    }
                }))
            }
            Command::CardWriteBlock => {
                if p.len() < 8 + CARD_BLOCK_LEN {
                    return Err(DispatchError::InvalidPayload("block write needs 24 bytes"));
                }
                let key = card_key(p[0], &p[2..8])?;
                let mut data = [0u8; CARD_BLOCK_LEN];
                data.copy_from_slice(&p[8..8 + CARD_BLOCK_LEN]);
                let task = p.get(8 + CARD_BLOCK_LEN).copied().unwrap_or(0);
                done(command, ports.card.write_block(task, p[1], key, &data))
            }
            Command::CardReport => {
                match p {
                    [0x00] | [0x01] => {}
                    [0x02] => ports.config.set(keys::NFC_REPORT, 1i64.into()).map_err(reject)?,
                    [0x03] => ports.config.set(keys::NFC_REPORT, 0i64.into()).map_err(reject)?,
                    _ => return Err(DispatchError::InvalidPayload("unknown card report mode")),
                }
                Ok(Some(Packet::ok(code)))
            }
            Command::CardReadSector => {
                let req = sector_request(p)?;
                Ok(Some(match ports.card.read_sector(&req) {
                    Ok(data) => Packet::ok_with(code, data),
                    Err(e) => {
                        warn!("VG: sector {} read failed: {}", req.sector, e);
                        Packet::fail(code)
                    }
                }))
            }
            Command::CardWriteSector => {
                let req = sector_request(p)?;
                let end = SECTOR_HEADER_LEN + usize::from(req.count) * CARD_BLOCK_LEN;
                let data = p
                    .get(SECTOR_HEADER_LEN..end)
                    .ok_or(DispatchError::InvalidPayload("sector data shorter than count"))?;
                done(command, ports.card.write_sector(&req, data))
            }
            Command::UpgradeStart => {
                if p.is_empty() {
                    return Err(DispatchError::InvalidPayload("missing image size"));
                }
                let total = le_uint(p);
                let outcome = self.firmware.run(ports, |session, strategy, events| {
                    session.start(strategy, events, total, None, None, now_ms)
                });
                done(command, outcome)
            }
            Command::UpgradeChunk => {
                let index = self.firmware.session.chunks_received();
                let outcome = self.firmware.run(ports, |session, strategy, events| {
                    session.chunk(strategy, events, index, p, now_ms)
                });
                done(command, outcome.map(|_| ()))
            }
            Command::UpgradeStop => {
                self.firmware
                    .run(ports, |session, strategy, events| session.abort(strategy, events));
                Ok(Some(Packet::ok(code)))
            }
            Command::UpgradeVerify => {
                let digest = storage_digest(p)?;
                let outcome = self.firmware.run(ports, |session, strategy, events| {
                    session.finish(strategy, events, Some(digest), now_ms)
                });
                done(command, outcome)
            }
            Command::UpgradeInstall => {
                let outcome = self.firmware.run(ports, |session, strategy, events| {
                    session.install(strategy, events)
                });
                done(command, outcome)
            }
            Command::ResourceStart => {
                if p.len() < 4 {
                    return Err(DispatchError::InvalidPayload("resource start needs 4 bytes"));
                }
                let count = le_uint(&p[1..3]) as u32;
                let total = le_uint(&p[3..]);
                let outcome = self.resource.run(ports, |session, strategy, events| {
                    session.start(strategy, events, total, None, Some(count), now_ms)
                });
                done(command, outcome)
            }
            Command::ResourceChunk => {
                if p.len() < 2 {
                    return Err(DispatchError::InvalidPayload("missing chunk index"));
                }
                let index = le_uint(&p[..2]) as u32;
                let outcome = self.resource.run(ports, |session, strategy, events| {
                    session.chunk(strategy, events, index, &p[2..], now_ms)
                });
                done(command, outcome.map(|_| ()))
            }
            Command::ResourceFinish => {
                let digest = storage_digest(p.get(2..).unwrap_or_default())?;
                let outcome = self.resource.run(ports, |session, strategy, events| {
                    session
                        .finish(strategy, events, Some(digest), now_ms)
                        .and_then(|()| session.install(strategy, events))
                });
                done(command, outcome)
            }
            Command::ResourceDelete => {
                let (dir, ext) = match p.first() {
                    Some(0x01) => (&self.config.image_dir, "png"),
                    Some(0x02) => (&self.config.audio_dir, "wav"),
                    _ => return Err(DispatchError::InvalidPayload("type must be 01 or 02")),
                };
                let path = format!("{}/{}.{}", dir, be_uint(&p[1..]), ext);
                if !ports.storage.exists(&path) {
                    warn!("VG: nothing to delete at {}", path);
                    return Ok(Some(Packet::fail(code)));
                }
                done(command, ports.storage.remove(&path))
            }
            Command::Ack => {
                let json = json_object(p)?;
                let text = format!(
                    "{}\n{}",
                    json_text(json.get("ack")).unwrap_or_default(),
                    json_text(json.get("msg")).unwrap_or_default()
                );
                ports.display.show_message(&text, MESSAGE_MS);
                Ok(Some(Packet::ok(code)))
            }
            Command::Display => {
                let Some((&mode, body)) = p.split_first() else {
                    return Err(DispatchError::InvalidPayload("missing display mode"));
                };
                let json = json_object(body)?;
                match mode {
                    0x01 => {
                        if let Some(center) = json_text(json.get("page_data")) {
                            ports.display.show_page(&PageContent::Text {
                                center,
                                left: json_text(json.get("key_left")),
                                middle: json_text(json.get("key_mid")),
                                right: json_text(json.get("key_right")),
                            });
                        }
                    }
                    0x02 => {
                        let qr = json_text(json.get("dynamic_qr_str")).unwrap_or_default();
                        ports.display.show_page(&PageContent::Qr(qr));
                    }
                    other => debug!("VG: display mode {:02x} ignored", other),
                }
                Ok(Some(Packet::ok(code)))
            }
            Command::ShowImage => {
                let index = be_uint(p) as u32;
                let path = format!("{}/{}.png", self.config.image_dir, index);
                if !ports.storage.exists(&path) {
                    warn!("VG: no image file {}", path);
                    return Ok(Some(Packet::fail(code)));
                }
                ports.display.show_image(index, IMAGE_MS);
                Ok(Some(Packet::ok(code)))
            }
            Command::Window => {
                match p {
                    [0x01, 0x00] => ports.display.show_system_info(false),
                    [0x02, 0x00] => ports.display.show_system_info(true),
                    _ => return Err(DispatchError::InvalidPayload("window must be 0100 or 0200")),
                }
                Ok(Some(Packet::ok(code)))
            }
            Command::Popup => {
                let json = json_object(p)?;
                let msg = json_text(json.get("msg")).filter(|m| !m.is_empty());
                let closable = json_int(json.get("isCloseEnable"));
                let timeout = json_int(json.get("msgTimeoutMs"));
                let (Some(msg), Some(closable), Some(timeout)) = (msg, closable, timeout) else {
                    return Err(DispatchError::InvalidPayload(
                        "popup needs msg, isCloseEnable and msgTimeoutMs",
                    ));
                };
                ports
                    .display
                    .popup(&msg, timeout.clamp(0, i64::from(u32::MAX)) as u32, closable != 0);
                Ok(Some(Packet::ok(code)))
            }
            Command::DeviceConfig => self.device_config(p, ports),
            Command::SubControllerReply | Command::SubControllerData => {
                Ok(Some(Packet::fail(code)))
            }
        }
    }

    // ── Handlers with more than a few lines ──────────────────

    fn time(&mut self, p: &[u8], ports: &mut Ports<'_>) -> Reply {
        let code = Command::Time.into();
        match p {
            [] => Ok(Some(Packet::ok_with(code, ports.os.now_ms().to_le_bytes()))),
            [0x00, ..] => {
                ports.os.reboot(REBOOT_DELAY_SECS);
                Ok(Some(Packet::ok(code)))
            }
            [0x01, ..] => Ok(Some(Packet::ok(code))),
            [0x02, secs @ ..] if !secs.is_empty() => {
                done(Command::Time, ports.os.set_time(le_uint(secs)))
            }
            _ => Err(DispatchError::InvalidPayload("unknown time operation")),
        }
    }

    fn decoder_types(&mut self, p: &[u8], ports: &mut Ports<'_>) -> Reply {
        let first = p.first().copied().unwrap_or(0);
        let second = p.get(1).copied().unwrap_or(0);
        let mut de_type = if p == [0x00] {
            0
        } else {
            ports.config.get_i64(keys::DECODER_TYPES).unwrap_or(0)
        };
        for bit in 0..8 {
            if first & (1 << bit) != 0 {
                match PRIMARY_DECODER_BITS[bit] {
                    Some(target) => de_type |= 1 << target,
                    None => debug!("VG: control bit {} has no decoder", bit),
                }
            }
            if second & (1 << bit) != 0 {
                de_type |= 1 << SECONDARY_DECODER_BITS[bit];
            }
        }
        if first >> 2 & 1 == 1 {
            de_type = ALL_DECODERS;
        }
        let mut entries = vec![(keys::DECODER_TYPES, ConfigValue::from(de_type))];
        if first >> 3 & 1 == 1 {
            entries.push((keys::NFC_ENABLED, 1i64.into()));
        }
        save_all(ports.config, entries).map_err(reject)?;
        ports.os.reboot(REBOOT_DELAY_SECS);
        Ok(Some(Packet::ok(Command::DecoderTypes.into())))
    }

    fn heartbeat_setup(
        &mut self,
        source: TransportId,
        p: &[u8],
        config: &mut dyn ConfigPort,
    ) -> Reply {
        let json = json_object(p)?;
        let enabled = json_int(json.get("heart_en"))
            .ok_or(DispatchError::InvalidPayload("heart_en missing"))?;
        let period = json_int(json.get("heart_time")).filter(|&t| t != 0);
        let data = json_text(json.get("heart_data")).filter(|d| !d.is_empty());

        if source == TransportId::Rs485 {
            let floor = u64::from(self.config.heartbeat_floor_secs);
            let hb = &mut self.link_heartbeat;
            hb.enabled = enabled == 1;
            if let Some(secs) = period {
                hb.period_secs = (secs.clamp(0, MAX_HEARTBEAT_SECS) as u64).max(floor);
            }
            if let Some(data) = data {
                hb.data = data;
            }
            info!(
                "VG[{}]: link heartbeat {} every {} s",
                source,
                if hb.enabled { "on" } else { "off" },
                hb.period_secs
            );
            return Ok(Some(Packet::ok(Command::Heartbeat.into())));
        }

        let mut entries = vec![(keys::HEART_ENABLED, ConfigValue::from(enabled))];
        if let Some(secs) = period {
            entries.push((keys::HEART_PERIOD, secs.clamp(0, MAX_HEARTBEAT_SECS).into()));
        }
        if let Some(data) = data {
            entries.push((keys::HEART_DATA, data.into()));
        }
        done(Command::Heartbeat, save_all(config, entries))
    }

    fn device_config(&mut self, p: &[u8], ports: &mut Ports<'_>) -> Reply {
        let code = Command::DeviceConfig.into();
        let Some(&mode) = p.first() else {
            return Ok(None);
        };
        if mode == 0x00 {
            let snapshot = Value::Object(ports.config.snapshot()).to_string();
            return Ok(Some(Packet::ok_with(code, snapshot.into_bytes())));
        }
        if p.len() <= 1 {
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&p[1..]);
        let password = ports
            .config
            .get_text(keys::CONFIG_PASSWORD)
            .filter(|pw| !pw.is_empty())
            .unwrap_or_else(|| config_code::DEFAULT_PASSWORD.to_owned());
        let Some(head) = config_code::verify(&text, &password) else {
            warn!("VG: config code signature mismatch");
            ports.device.signal(false);
            return Ok(None);
        };
        let Some(entries) = config_code::parse_entries(head) else {
            warn!("VG: config code body malformed");
            ports.device.signal(false);
            return Ok(Some(Packet::fail(code)));
        };

        let mut reboot = false;
        let mut updates = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match key.as_str() {
                "sn" => {
                    if let Err(e) = ports.device.write_serial_number(&value.as_text()) {
                        warn!("VG: serial number write failed: {}", e);
                        return Ok(Some(Packet::fail(code)));
                    }
                    ports.os.reboot(REBOOT_DELAY_SECS);
                }
                "reboot" => reboot = value.as_i64() == Some(1),
                _ => updates.push((format!("{}{}", keys::SECTION, key), value)),
            }
        }
        if let Err(e) = save_all(ports.config, updates) {
            warn!("VG: config code rejected: {}", e);
            ports.device.signal(false);
            return Ok(Some(Packet::fail(code)));
        }
        ports.device.signal(true);
        if reboot {
            ports.os.reboot(1);
        }
        Ok(Some(Packet::ok(code)))
    }

    // ── Sub-controller link ──────────────────────────────────

    fn handle_subcontroller(
        &mut self,
        command: Command,
        packet: &Packet,
        now_ms: u64,
        ports: &mut Ports<'_>,
    ) -> Option<Packet> {
        match command {
            Command::SubControllerReply => {
                let body = packet.payload.as_slice();
                if let Some((op, status)) = subctl::parse_reply(body) {
                    debug!("VG[subctl]: step {} status {:02x}", op, status);
                    self.bridge.respond(&subctl::reply_key(op), body);
                } else if subctl::is_config_reply(body) {
                    self.bridge.respond(subctl::CONFIG_REPLY_KEY, body);
                } else {
                    debug!("VG[subctl]: unrecognised 0x60 body ({} bytes)", body.len());
                }
                None
            }
            Command::SubControllerData => self.subcontroller_data(packet, now_ms, ports),
            other => {
                debug!("VG[subctl]: {:?} ignored", other);
                None
            }
        }
    }

    /// `0x0f`: user data from the sub-controller. The last byte is a
    /// sequence index echoed in the reply.
    fn subcontroller_data(
        &mut self,
        packet: &Packet,
        now_ms: u64,
        ports: &mut Ports<'_>,
    ) -> Option<Packet> {
        let code = packet.command;
        let p = packet.payload.as_slice();
        let &index = p.last()?;
        if p.len() < 4 {
            return Some(Packet::reply(code, RESULT_FAIL, vec![index]));
        }
        let user = String::from_utf8_lossy(p.get(5..p.len() - 1).unwrap_or_default());
        info!("VG[subctl]: user data '{}'", user);
        match DataFormat::load(ports.config).encode(&user) {
            Some(data) => {
                let out = self
                    .router
                    .report(ports.config, DataSource::Ble, &data, now_ms);
                self.outbox.extend(out);
                if ports.config.get_i64(keys::BEEP_ON_SCAN).unwrap_or(0) & 1 == 1 {
                    let ms = ports
                        .config
                        .get_i64(keys::BEEP_DURATION)
                        .unwrap_or(DEFAULT_BEEP_MS);
                    ports.device.beep(ms.clamp(0, i64::from(u32::MAX)) as u32, 0, 1);
                }
            }
            None => debug!("VG[subctl]: data does not fit the configured format"),
        }
        Some(Packet::reply(code, RESULT_OK, vec![index]))
    }

    // ── Heartbeats ───────────────────────────────────────────

    fn network_heartbeat(&mut self, now_ms: u64, config: &dyn ConfigPort) {
        if config.get_i64(keys::HEART_ENABLED) != Some(1) {
            self.last_network_heartbeat = None;
            return;
        }
        let floor = i64::from(self.config.heartbeat_floor_secs);
        let period = config
            .get_i64(keys::HEART_PERIOD)
            .unwrap_or(floor)
            .max(floor)
            .min(MAX_HEARTBEAT_SECS) as u64;
        if !heartbeat_due(self.last_network_heartbeat, period, now_ms) {
            return;
        }
        self.last_network_heartbeat = Some(now_ms);
        let data = config.get_text(keys::HEART_DATA).unwrap_or_default();
        let out = self.router.heartbeat(config, data.as_bytes());
        self.outbox.extend(out);
    }

    fn link_heartbeat(&mut self, now_ms: u64, config: &dyn ConfigPort) {
        let hb = &mut self.link_heartbeat;
        if !hb.enabled || !heartbeat_due(hb.last_ms, hb.period_secs, now_ms) {
            return;
        }
        hb.last_ms = Some(now_ms);
        let out = match OutputChannelConfig::load(config).work_mode {
            WorkMode::PassThrough => Some(Outbound::new(
                TransportId::Rs485,
                hb.data.clone().into_bytes(),
            )),
            WorkMode::Protocol => Outbound::packet(
                TransportId::Rs485,
                &Packet::ok_with(Command::Heartbeat.into(), hb.data.as_bytes()),
            ),
        };
        self.outbox.extend(out);
    }
}

// ── Helpers ──────────────────────────────────────────────────

/// `00` on success, `90` (logged) on failure.
fn done<E: core::fmt::Display>(command: Command, outcome: Result<(), E>) -> Reply {
    match outcome {
        Ok(()) => Ok(Some(Packet::ok(command.into()))),
        Err(e) => {
            warn!("VG: {:?} failed: {}", command, e);
            Ok(Some(Packet::fail(command.into())))
        }
    }
}

fn reject(e: ConfigError) -> DispatchError {
    warn!("VG: config write failed: {}", e);
    DispatchError::InvalidPayload("config value rejected")
}

fn save_all<K: AsRef<str>>(
    config: &mut dyn ConfigPort,
    entries: impl IntoIterator<Item = (K, ConfigValue)>,
) -> Result<(), ConfigError> {
    for (key, value) in entries {
        config.set(key.as_ref(), value)?;
    }
    Ok(())
}

/// Secure-module replies carry their status in the result byte when the
/// link decodes one.
fn secure_reply(packet: &Packet) -> Vec<u8> {
    match packet.result {
        Some(result) => vec![result],
        None => packet.payload.clone(),
    }
}

fn first_n<const N: usize>(p: &[u8]) -> Result<[u8; N], DispatchError> {
    p.get(..N)
        .and_then(|s| s.try_into().ok())
        .ok_or(DispatchError::InvalidPayload("payload too short"))
}

/// Little-endian unsigned integer over at most the first 8 bytes.
pub fn le_uint(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .rev()
        .fold(0, |acc, &b| (acc << 8) | u64::from(b))
}

/// Big-endian unsigned integer over at most the last 8 bytes.
pub fn be_uint(bytes: &[u8]) -> u64 {
    let start = bytes.len().saturating_sub(8);
    bytes[start..]
        .iter()
        .fold(0, |acc, &b| (acc << 8) | u64::from(b))
}

/// MD5 of a storage upload, as 16 raw bytes or 32 hex characters.
fn storage_digest(p: &[u8]) -> Result<ImageDigest, DispatchError> {
    DigestKind::Md5
        .parse(p)
        .ok_or(DispatchError::InvalidPayload("digest must be 16 bytes or 32 hex chars"))
}

/// `0x09` door byte: `00` closed, `01` open.
fn door_state(open: bool) -> u8 {
    u8::from(open)
}

fn card_key(key_type: u8, key: &[u8]) -> Result<CardKey, DispatchError> {
    let key: [u8; 6] = key
        .try_into()
        .map_err(|_| DispatchError::InvalidPayload("card key must be 6 bytes"))?;
    match key_type {
        KEY_TYPE_A => Ok(CardKey::A(key)),
        KEY_TYPE_B => Ok(CardKey::B(key)),
        _ => Err(DispatchError::InvalidPayload("key type must be 60 or 61")),
    }
}

/// `[task, keyType, sector, logicalBlock, count, key(6)]`
fn sector_request(p: &[u8]) -> Result<SectorRequest, DispatchError> {
    if p.len() < SECTOR_HEADER_LEN {
        return Err(DispatchError::InvalidPayload("sector access needs 11 bytes"));
    }
    Ok(SectorRequest {
        task: p[0],
        key: card_key(p[1], &p[5..11])?,
        sector: p[2],
        logical_block: p[3],
        count: p[4],
    })
}

fn json_object(p: &[u8]) -> Result<Map<String, Value>, DispatchError> {
    let text =
        core::str::from_utf8(p).map_err(|_| DispatchError::InvalidPayload("payload is not UTF-8"))?;
    serde_json::from_str(text).map_err(|_| DispatchError::InvalidPayload("payload is not a JSON object"))
}

fn json_text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn json_int(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64(),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ── Tests ────────────────────────────────────────────────────
