//! Output routing for business data (scans, cards, passwords, BLE,
//! heartbeat).
//!
//! ```text
//!  scan / card / ble ──▶ report() ──┬─ poll modes ──▶ cache ──▶ 0x30/0x33 poll
//!                                   └─ push modes ──▶ broadcast()
//!                                                        │
//!                         ┌──────────────┬───────────────┼──────────────┐
//!                         ▼              ▼               ▼              ▼
//!                      RS-485       HTTP raw/netpro   TCP raw     TCP netpro
//! ```
//!
//! Routing settings are re-read from the config port on every send, so a
//! config change takes effect on the next report without a restart.

use log::{debug, warn};

use super::codec::Packet;
use super::command::Command;
use super::transport::TransportId;
use crate::app::ports::ConfigPort;
use crate::config::keys;

/// Output channel bit for the RS-485 line.
const CHANNEL_RS485: i64 = 1 << 1;
/// Output channel bit for the wired network.
const CHANNEL_NETWORK: i64 = 1 << 6;

/// `sysInfo.dchannel` value selecting the binary protocol.
pub const PROTOCOL_DATA_CHANNEL: i64 = 64;

// ── Settings snapshot ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkMode {
    /// Bare data, no framing (`w_mode` 1).
    PassThrough,
    /// Framed `55 AA` packets (`w_mode` 2).
    Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkOutput {
    None,
    HttpRaw,
    HttpNetPro,
    TcpRaw,
    TcpNetPro,
}

impl NetworkOutput {
    fn from_code(code: i64) -> Self {
        match code {
            1 => Self::HttpRaw,
            2 => Self::HttpNetPro,
            4 => Self::TcpRaw,
            8 => Self::TcpNetPro,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// `0`: cache for `0x30` polling.
    PollUntagged,
    /// `1`: push `0x30`.
    PushUntagged,
    /// `80`: cache for `0x33` polling.
    PollTagged,
    /// `81`: push `0x33` with a source tag.
    PushTagged,
}

impl ReportMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "0" => Some(Self::PollUntagged),
            "1" => Some(Self::PushUntagged),
            "80" => Some(Self::PollTagged),
            "81" => Some(Self::PushTagged),
            _ => None,
        }
    }

    /// Wire form carried in the first byte of `0x31`.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::PollUntagged),
            0x01 => Some(Self::PushUntagged),
            0x80 => Some(Self::PollTagged),
            0x81 => Some(Self::PushTagged),
            _ => None,
        }
    }

    /// Stored form, as written by `0x31`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PollUntagged => "0",
            Self::PushUntagged => "1",
            Self::PollTagged => "80",
            Self::PushTagged => "81",
        }
    }
}

/// Routing settings read from the config port at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChannelConfig {
    pub work_mode: WorkMode,
    pub data_channel: i64,
    pub code_channels: i64,
    pub nfc_channels: i64,
    pub ble_channels: i64,
    pub network: NetworkOutput,
    pub device_number: String,
    /// `None` when the stored mode is not recognised.
    pub report_mode: Option<ReportMode>,
    /// Cache lifetime in milliseconds; 0 keeps results until read.
    pub report_timeout_ms: u64,
}

impl OutputChannelConfig {
    pub fn load(config: &dyn ConfigPort) -> Self {
        let work_mode = match config.get_i64(keys::WORK_MODE) {
            Some(1) => WorkMode::PassThrough,
            _ => WorkMode::Protocol,
        };
        let report_mode = match config.get_text(keys::REPORT_MODE) {
            None => Some(ReportMode::PushUntagged),
            Some(text) => ReportMode::parse(&text),
        };
        Self {
            work_mode,
            data_channel: config
                .get_i64(keys::DATA_CHANNEL)
                .unwrap_or(PROTOCOL_DATA_CHANNEL),
            code_channels: config.get_i64(keys::OUTPUT_CHANNEL).unwrap_or(0),
            nfc_channels: config.get_i64(keys::NFC_OUTPUT_CHANNEL).unwrap_or(0),
            ble_channels: config.get_i64(keys::BLE_OUTPUT_CHANNEL).unwrap_or(0),
            network: NetworkOutput::from_code(config.get_i64(keys::NETWORK_OUTPUT).unwrap_or(0)),
            device_number: config.get_text(keys::DEVICE_NUMBER).unwrap_or_default(),
            report_mode,
            report_timeout_ms: config
                .get_i64(keys::REPORT_TIMEOUT)
                .map_or(0, |t| t.max(0) as u64),
        }
    }

    /// Full protocol mode: every command is dispatched.
    pub fn protocol_enabled(&self) -> bool {
        self.work_mode == WorkMode::Protocol && self.data_channel == PROTOCOL_DATA_CHANNEL
    }

    fn channels_for(&self, source: DataSource) -> i64 {
        match source {
            DataSource::Code | DataSource::Password | DataSource::Heartbeat => self.code_channels,
            DataSource::Nfc => self.nfc_channels,
            DataSource::Ble => self.ble_channels,
        }
    }
}

// ── Sources and outbound frames ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Code,
    Password,
    Nfc,
    Ble,
    Heartbeat,
}

impl DataSource {
    /// Source tag prefixed to `0x33` data.
    pub fn tag(self) -> u8 {
        match self {
            Self::Code | Self::Heartbeat => 0x11,
            Self::Password => 0xa0,
            Self::Nfc => 0x42,
            Self::Ble => 0x80,
        }
    }
}

/// Bytes ready to write to one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub dest: TransportId,
    pub bytes: Vec<u8>,
}

impl Outbound {
    pub fn new(dest: TransportId, bytes: Vec<u8>) -> Self {
        Self { dest, bytes }
    }

    /// Encode `packet` for `dest`. Oversized packets are dropped.
    pub fn packet(dest: TransportId, packet: &Packet) -> Option<Self> {
        match packet.encode() {
            Ok(bytes) => Some(Self::new(dest, bytes)),
            Err(e) => {
                warn!("ROUTE: cmd 0x{:02x} not encodable: {}", packet.command, e);
                None
            }
        }
    }
}

/// Result held for the host to poll with `0x30` / `0x33`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedReport {
    tag: u8,
    data: Vec<u8>,
    at_ms: u64,
}

// ── Router ───────────────────────────────────────────────────

#[derive(Default)]
pub struct ChannelRouter {
    cached: Option<CachedReport>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_cached(&self) -> bool {
        self.cached.is_some()
    }

    /// Apply the report mode to fresh business data.
    pub fn report(
        &mut self,
        config: &dyn ConfigPort,
        source: DataSource,
        data: &[u8],
        now_ms: u64,
    ) -> Vec<Outbound> {
        let cfg = OutputChannelConfig::load(config);
        let Some(mode) = cfg.report_mode else {
            warn!("ROUTE: unknown report mode, {:?} data dropped", source);
            return Vec::new();
        };
        let poll_result = Command::PollResult as u8;
        let poll_tagged = Command::PollTaggedResult as u8;
        match mode {
            ReportMode::PollUntagged | ReportMode::PollTagged => {
                if cfg.work_mode == WorkMode::PassThrough {
                    return self.send(&cfg, source, &Packet::ok_with(poll_result, data));
                }
                debug!("ROUTE: caching {} bytes from {:?}", data.len(), source);
                self.cached = Some(CachedReport {
                    tag: source.tag(),
                    data: data.to_vec(),
                    at_ms: now_ms,
                });
                Vec::new()
            }
            ReportMode::PushUntagged => self.send(&cfg, source, &Packet::ok_with(poll_result, data)),
            ReportMode::PushTagged => {
                let mut payload = Vec::with_capacity(data.len() + 1);
                if cfg.work_mode == WorkMode::Protocol {
                    payload.push(source.tag());
                }
                payload.extend_from_slice(data);
                self.send(&cfg, source, &Packet::ok_with(poll_tagged, payload))
            }
        }
    }

    /// Answer a `0x30` (`tagged == false`) or `0x33` poll. The cache is
    /// cleared on every read of the matching mode.
    pub fn poll(&mut self, config: &dyn ConfigPort, tagged: bool, now_ms: u64) -> Packet {
        let cfg = OutputChannelConfig::load(config);
        let (command, wanted) = if tagged {
            (Command::PollTaggedResult as u8, ReportMode::PollTagged)
        } else {
            (Command::PollResult as u8, ReportMode::PollUntagged)
        };
        if cfg.report_mode != Some(wanted) {
            return Packet::ok(command);
        }
        let Some(cached) = self.cached.take() else {
            return Packet::ok(command);
        };
        let fresh = cfg.report_timeout_ms == 0
            || now_ms.saturating_sub(cached.at_ms) <= cfg.report_timeout_ms;
        if !fresh {
            debug!("ROUTE: cached result expired");
            return Packet::ok(command);
        }
        let mut payload = Vec::with_capacity(cached.data.len() + 1);
        if tagged {
            payload.push(cached.tag);
        }
        payload.extend_from_slice(&cached.data);
        Packet::ok_with(command, payload)
    }

    /// Send the heartbeat packet to every enabled output except RS-485.
    pub fn heartbeat(&self, config: &dyn ConfigPort, data: &[u8]) -> Vec<Outbound> {
        let cfg = OutputChannelConfig::load(config);
        self.send(
            &cfg,
            DataSource::Heartbeat,
            &Packet::ok_with(Command::Heartbeat as u8, data),
        )
    }

    /// Fan `packet` out to the outputs enabled for `source`.
    pub fn broadcast(
        &self,
        config: &dyn ConfigPort,
        source: DataSource,
        packet: &Packet,
    ) -> Vec<Outbound> {
        let cfg = OutputChannelConfig::load(config);
        self.send(&cfg, source, packet)
    }

    fn send(&self, cfg: &OutputChannelConfig, source: DataSource, packet: &Packet) -> Vec<Outbound> {
        let channels = cfg.channels_for(source);
        let framed = || -> Option<Vec<u8>> {
            match cfg.work_mode {
                WorkMode::PassThrough => Some(packet.payload.clone()),
                WorkMode::Protocol => Outbound::packet(TransportId::Rs485, packet).map(|o| o.bytes),
            }
        };

        let mut out = Vec::new();
        if channels & CHANNEL_RS485 != 0 && source != DataSource::Heartbeat {
            if let Some(bytes) = framed() {
                out.push(Outbound::new(TransportId::Rs485, bytes));
            }
        }
        if channels & CHANNEL_NETWORK != 0 {
            let protocol = cfg.work_mode == WorkMode::Protocol;
            match cfg.network {
                // In protocol mode only RS-485 and raw TCP carry output.
                NetworkOutput::HttpRaw if !protocol => {
                    if let Some(bytes) = framed() {
                        out.push(Outbound::new(TransportId::Http, bytes));
                    }
                }
                NetworkOutput::HttpNetPro if !protocol => out.push(Outbound::new(
                    TransportId::Http,
                    net_protocol_wrap(&packet.payload, &cfg.device_number),
                )),
                NetworkOutput::TcpRaw => {
                    if let Some(bytes) = framed() {
                        out.push(Outbound::new(TransportId::Tcp, bytes));
                    }
                }
                NetworkOutput::TcpNetPro if !protocol => out.push(Outbound::new(
                    TransportId::Tcp,
                    net_protocol_wrap(&packet.payload, &cfg.device_number),
                )),
                _ => {}
            }
        }
        if out.is_empty() {
            debug!("ROUTE: no output enabled for {:?}", source);
        }
        out
    }
}

/// `vgdecoderesult=<data>&&devicenumber=<n>&&otherparams=`
pub fn net_protocol_wrap(data: &[u8], device_number: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 64);
    out.extend_from_slice(b"vgdecoderesult=");
    out.extend_from_slice(data);
    out.extend_from_slice(b"&&devicenumber=");
    out.extend_from_slice(device_number.as_bytes());
    out.extend_from_slice(b"&&otherparams=");
    out
}

// ── Sub-controller data encoding ─────────────────────────────

/// How sub-controller user data is rendered before reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFormat {
    pub format: i64,
    pub prefix: String,
    pub suffix: String,
    pub affix_mode: i64,
    pub append_cr: bool,
    pub append_lf: bool,
}

impl DataFormat {
    pub fn load(config: &dyn ConfigPort) -> Self {
        Self {
            format: config.get_i64(keys::BLE_FORMAT).unwrap_or(0),
            prefix: config.get_text(keys::BLE_PREFIX).unwrap_or_default(),
            suffix: config.get_text(keys::BLE_SUFFIX).unwrap_or_default(),
            affix_mode: config.get_i64(keys::BLE_AFFIX_MODE).unwrap_or(0),
            append_cr: config.get_i64(keys::BLE_APPEND_CR) == Some(1),
            append_lf: config.get_i64(keys::BLE_APPEND_LF) == Some(1),
        }
    }

    /// Render `msg`. `None` means the message does not fit the format and
    /// is dropped.
    pub fn encode(&self, msg: &str) -> Option<Vec<u8>> {
        let mut out = match self.format {
            1 => decimal_bytes(msg).map_or_else(|| vec![0x00], |mut b| {
                b.reverse();
                b
            }),
            2 => decimal_bytes(msg).unwrap_or_else(|| vec![0x00]),
            4 => even_hex(msg)?,
            8 => {
                let mut b = even_hex(msg)?;
                b.reverse();
                b
            }
            _ => msg.as_bytes().to_vec(),
        };

        match self.affix_mode {
            2 => {
                if let Some(mut p) = even_hex(&self.prefix) {
                    p.append(&mut out);
                    out = p;
                }
                if let Some(s) = even_hex(&self.suffix) {
                    out.extend(s);
                }
            }
            1 => {
                let mut p = self.prefix.as_bytes().to_vec();
                p.append(&mut out);
                out = p;
                out.extend_from_slice(self.suffix.as_bytes());
            }
            _ => {}
        }
        if self.append_cr {
            out.push(0x0d);
        }
        if self.append_lf {
            out.push(0x0a);
        }
        Some(out)
    }
}

/// Minimal big-endian bytes of a decimal string (`"258"` → `01 02`).
/// A fractional part is ignored.
fn decimal_bytes(msg: &str) -> Option<Vec<u8>> {
    let int_part = match msg.split_once('.') {
        Some((i, f)) if !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()) => i,
        Some(_) => return None,
        None => msg,
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = int_part.parse().ok()?;
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    Some(bytes[first..].to_vec())
}

fn even_hex(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    hex::decode(s).ok()
}

// ── Tests ────────────────────────────────────────────────────
