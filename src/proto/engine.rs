//! Protocol engine: per-transport decoding in front of the dispatcher.
//!
//! **Transport-decoupled**: the engine does not own a transport. Callers
//! feed `(source, bytes)` via [`ProtocolEngine::receive`] and get back the
//! frames to write, each tagged with its destination. The I/O task bridges
//! real transports to this engine over channels.
//!
//! ```text
//!  raw bytes ─▶ LinkDecoder[source] ─▶ Packet ─▶ CommandDispatcher
//!                                                      │
//!                 Vec<Outbound> ◀── reply + reports ◀──┘
//! ```

use std::sync::Arc;

use log::{debug, warn};

use super::codec::{DecodeEvent, FrameDecoder, Packet};
use super::dispatch::CommandDispatcher;
use super::router::{DataSource, Outbound};
use super::sync::SyncBridge;
use super::transport::TransportId;
use super::upgrade::UpgradeSession;
use crate::app::ports::Ports;
use crate::config::{StackConfig, TransportSettings};

// ── Per-link decoder ─────────────────────────────────────────

/// A [`FrameDecoder`] that forgets a half-received frame once the link
/// has been quiet for longer than the expiry window.
pub struct LinkDecoder {
    decoder: FrameDecoder,
    expiry_ms: u64,
    last_rx_ms: u64,
}

impl LinkDecoder {
    pub fn new(expects_result: bool, expiry_ms: u64) -> Self {
        Self {
            decoder: FrameDecoder::new(expects_result),
            expiry_ms,
            last_rx_ms: 0,
        }
    }

    /// Decode `data` received at `now_ms`. Checksum failures are logged
    /// and dropped; only good packets come back.
    pub fn feed(&mut self, source: TransportId, data: &[u8], now_ms: u64) -> Vec<Packet> {
        self.expire(source, now_ms);
        if !data.is_empty() {
            self.last_rx_ms = now_ms;
        }
        self.decoder
            .feed(data)
            .into_iter()
            .filter_map(|ev| match ev {
                DecodeEvent::Packet(p) => Some(p),
                DecodeEvent::ChecksumError { command } => {
                    warn!("IO[{}]: checksum mismatch on cmd 0x{:02x}, dropped", source, command);
                    None
                }
            })
            .collect()
    }

    /// Drop a stale partial frame. Called on every read, including empty
    /// ones, so a dead link does not hold a half-frame forever.
    pub fn expire(&mut self, source: TransportId, now_ms: u64) {
        if self.decoder.in_frame() && now_ms.saturating_sub(self.last_rx_ms) > self.expiry_ms {
            debug!("IO[{}]: partial frame expired", source);
            self.decoder.reset();
        }
    }

    pub fn reset(&mut self) {
        self.decoder.reset();
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }
}

/// Whether frames arriving on `source` carry a result byte.
pub fn expects_result(settings: &TransportSettings, source: TransportId) -> bool {
    match source {
        TransportId::Rs485 => settings.rs485_expects_result,
        TransportId::Tcp => settings.tcp_expects_result,
        TransportId::SubController => settings.subctl_expects_result,
        TransportId::Http => false,
    }
}

// ── Engine ───────────────────────────────────────────────────

pub struct ProtocolEngine {
    dispatcher: CommandDispatcher,
    decoders: [LinkDecoder; 4],
}

impl ProtocolEngine {
    pub fn new(config: StackConfig, bridge: Arc<SyncBridge>) -> Self {
        let expiry = config.partial_frame_expiry_ms;
        let decoders = TransportId::ALL
            .map(|id| LinkDecoder::new(expects_result(&config.transports, id), expiry));
        Self {
            dispatcher: CommandDispatcher::new(config, bridge),
            decoders,
        }
    }

    /// Feed raw bytes from `source`, dispatch every complete frame, and
    /// return the frames to send (replies first, then reports).
    pub fn receive(
        &mut self,
        source: TransportId,
        raw: &[u8],
        now_ms: u64,
        ports: &mut Ports<'_>,
    ) -> Vec<Outbound> {
        let packets = self.decoders[source.index()].feed(source, raw, now_ms);
        let mut out = Vec::new();
        for packet in packets {
            out.extend(self.receive_packet(source, &packet, now_ms, ports));
        }
        out
    }

    /// Dispatch one already-decoded packet.
    pub fn receive_packet(
        &mut self,
        source: TransportId,
        packet: &Packet,
        now_ms: u64,
        ports: &mut Ports<'_>,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        if let Some(reply) = self.dispatcher.handle(source, packet, now_ms, ports) {
            out.extend(Outbound::packet(source, &reply));
        }
        out.extend(self.dispatcher.take_outbound());
        out
    }

    /// Dispatch a packet and return the reply itself rather than its
    /// encoding. Used by the HTTP front end, which answers in JSON.
    pub fn exchange(
        &mut self,
        source: TransportId,
        packet: &Packet,
        now_ms: u64,
        ports: &mut Ports<'_>,
    ) -> (Option<Packet>, Vec<Outbound>) {
        let reply = self.dispatcher.handle(source, packet, now_ms, ports);
        (reply, self.dispatcher.take_outbound())
    }

    /// Route business data (scan result, card, password) to the outputs.
    pub fn report(
        &mut self,
        source: DataSource,
        data: &[u8],
        now_ms: u64,
        ports: &mut Ports<'_>,
    ) -> Vec<Outbound> {
        self.dispatcher.report(ports.config, source, data, now_ms)
    }

    /// Watchdogs, heartbeats and partial-frame expiry.
    pub fn tick(&mut self, now_ms: u64, ports: &mut Ports<'_>) -> Vec<Outbound> {
        for (decoder, id) in self.decoders.iter_mut().zip(TransportId::ALL) {
            decoder.expire(id, now_ms);
        }
        self.dispatcher.tick(now_ms, ports)
    }

    /// Forget partial input on `source` (reconnect).
    pub fn reset_link(&mut self, source: TransportId) {
        self.decoders[source.index()].reset();
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn firmware_session(&self) -> &UpgradeSession {
        self.dispatcher.firmware_session()
    }

    pub fn resource_session(&self) -> &UpgradeSession {
        self.dispatcher.resource_session()
    }
}
