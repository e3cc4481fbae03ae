//! `55 AA` control-channel frame codec.
//!
//! Wire format:
//! ```text
//! ┌──────┬──────┬─────┬──────────┬───────┬───────┬─────────────┬─────┐
//! │ 0x55 │ 0xAA │ cmd │ [result] │ lenLo │ lenHi │ payload (N) │ bcc │
//! └──────┴──────┴─────┴──────────┴───────┴───────┴─────────────┴─────┘
//! ```
//!
//! `result` is present on replies and absent on host requests; each
//! transport decides which direction it decodes. `bcc` is the XOR of every
//! preceding byte, with an absent result byte counted as zero.
//!
//! The streaming decoder keeps its header state across reads, so a single
//! `Transport::read` may carry part of a header, part of a payload, or
//! several frames back to back.

use crate::error::FrameError;

/// First sync byte.
pub const SYNC_0: u8 = 0x55;
/// Second sync byte.
pub const SYNC_1: u8 = 0xAA;

/// Reply result: success.
pub const RESULT_OK: u8 = 0x00;
/// Reply result: failure / unknown command / bad payload.
pub const RESULT_FAIL: u8 = 0x90;
/// Reply result: peripheral not fitted (door sensor query).
pub const RESULT_NO_SENSOR: u8 = 0x0e;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// XOR block check character over `bytes`.
pub fn bcc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

// ── Packet ───────────────────────────────────────────────────

/// One control-channel packet. The checksum is derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u8,
    pub result: Option<u8>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(command: u8, result: Option<u8>, payload: Vec<u8>) -> Self {
        Self {
            command,
            result,
            payload,
        }
    }

    /// Host-side request (no result byte).
    pub fn request(command: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(command, None, payload.into())
    }

    /// Reply with an explicit result byte.
    pub fn reply(command: u8, result: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(command, Some(result), payload.into())
    }

    /// Empty `0x00` reply.
    pub fn ok(command: u8) -> Self {
        Self::reply(command, RESULT_OK, Vec::new())
    }

    /// `0x00` reply carrying data.
    pub fn ok_with(command: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self::reply(command, RESULT_OK, payload)
    }

    /// Empty `0x90` reply.
    pub fn fail(command: u8) -> Self {
        Self::reply(command, RESULT_FAIL, Vec::new())
    }

    pub fn is_ok(&self) -> bool {
        self.result == Some(RESULT_OK)
    }

    /// Checksum this packet would carry on the wire.
    pub fn checksum(&self) -> u8 {
        let len = self.payload.len() as u16;
        let [lo, hi] = len.to_le_bytes();
        let header = [
            SYNC_0,
            SYNC_1,
            self.command,
            self.result.unwrap_or(0),
            lo,
            hi,
        ];
        bcc(&header) ^ bcc(&self.payload)
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode(self.command, self.result, &self.payload)
    }
}

/// Encode `55 AA cmd [result] lenLo lenHi payload bcc`.
pub fn encode(command: u8, result: Option<u8>, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&[SYNC_0, SYNC_1, command]);
    if let Some(r) = result {
        out.push(r);
    }
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out.push(bcc(&out));
    Ok(out)
}

/// Decode exactly one frame from the start of `bytes`.
///
/// Used for HTTP bodies and tests where a whole frame is already in hand.
/// Trailing bytes after the checksum are ignored.
pub fn decode(bytes: &[u8], expects_result: bool) -> Result<Packet, FrameError> {
    match bytes {
        [] | [SYNC_0] => return Err(FrameError::Incomplete),
        [SYNC_0, SYNC_1, ..] => {}
        _ => return Err(FrameError::Framing),
    }

    let header_len = if expects_result { 6 } else { 5 };
    if bytes.len() < header_len {
        return Err(FrameError::Incomplete);
    }
    let command = bytes[2];
    let result = expects_result.then_some(bytes[3]);
    let len = u16::from_le_bytes([bytes[header_len - 2], bytes[header_len - 1]]) as usize;
    let end = header_len + len;
    if bytes.len() <= end {
        return Err(FrameError::Incomplete);
    }

    let expected = bcc(&bytes[..end]);
    let actual = bytes[end];
    if expected != actual {
        return Err(FrameError::Checksum {
            command,
            expected,
            actual,
        });
    }
    Ok(Packet::new(command, result, bytes[header_len..end].to_vec()))
}

// ── Streaming decoder ────────────────────────────────────────

/// Output of [`FrameDecoder::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    Packet(Packet),
    /// A complete frame arrived with a bad BCC. Dropped by the caller.
    ChecksumError { command: u8 },
}

/// Counters kept across the decoder's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub packets: u32,
    pub checksum_errors: u32,
    pub garbage_bytes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Sync0,
    Sync1,
    Command,
    Result { command: u8 },
    LenLo { command: u8, result: Option<u8> },
    LenHi { command: u8, result: Option<u8>, lo: u8 },
    Payload { command: u8, result: Option<u8>, expected: usize },
    Checksum { command: u8, result: Option<u8> },
}

/// Byte-at-a-time frame decoder that survives split reads.
pub struct FrameDecoder {
    state: DecoderState,
    expects_result: bool,
    running: u8,
    payload: Vec<u8>,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// `expects_result` selects whether inbound frames carry a result byte.
    pub fn new(expects_result: bool) -> Self {
        Self {
            state: DecoderState::Sync0,
            expects_result,
            running: 0,
            payload: Vec::new(),
            stats: DecoderStats::default(),
        }
    }

    /// Feed bytes and collect every frame completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        for &byte in data {
            if let Some(ev) = self.push(byte) {
                events.push(ev);
            }
        }
        events
    }

    fn push(&mut self, byte: u8) -> Option<DecodeEvent> {
        match self.state {
            DecoderState::Sync0 => {
                if byte == SYNC_0 {
                    self.running = byte;
                    self.state = DecoderState::Sync1;
                } else {
                    self.stats.garbage_bytes += 1;
                }
            }
            DecoderState::Sync1 => {
                if byte == SYNC_1 {
                    self.running ^= byte;
                    self.state = DecoderState::Command;
                } else {
                    // No back-up: this byte is not reconsidered as a new 0x55.
                    self.stats.garbage_bytes += 2;
                    self.state = DecoderState::Sync0;
                }
            }
            DecoderState::Command => {
                self.running ^= byte;
                self.state = if self.expects_result {
                    DecoderState::Result { command: byte }
                } else {
                    DecoderState::LenLo {
                        command: byte,
                        result: None,
                    }
                };
            }
            DecoderState::Result { command } => {
                self.running ^= byte;
                self.state = DecoderState::LenLo {
                    command,
                    result: Some(byte),
                };
            }
            DecoderState::LenLo { command, result } => {
                self.running ^= byte;
                self.state = DecoderState::LenHi {
                    command,
                    result,
                    lo: byte,
                };
            }
            DecoderState::LenHi { command, result, lo } => {
                self.running ^= byte;
                let expected = u16::from_le_bytes([lo, byte]) as usize;
                self.payload.clear();
                self.payload.reserve(expected);
                self.state = if expected == 0 {
                    DecoderState::Checksum { command, result }
                } else {
                    DecoderState::Payload {
                        command,
                        result,
                        expected,
                    }
                };
            }
            DecoderState::Payload {
                command,
                result,
                expected,
            } => {
                self.running ^= byte;
                self.payload.push(byte);
                if self.payload.len() == expected {
                    self.state = DecoderState::Checksum { command, result };
                }
            }
            DecoderState::Checksum { command, result } => {
                self.state = DecoderState::Sync0;
                if byte != self.running {
                    self.stats.checksum_errors += 1;
                    self.payload.clear();
                    return Some(DecodeEvent::ChecksumError { command });
                }
                self.stats.packets += 1;
                let payload = core::mem::take(&mut self.payload);
                return Some(DecodeEvent::Packet(Packet::new(command, result, payload)));
            }
        }
        None
    }

    /// True while a frame is partially assembled.
    pub fn in_frame(&self) -> bool {
        self.state != DecoderState::Sync0
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Drop any partial frame (transport reconnect or stale half-frame).
    pub fn reset(&mut self) {
        if self.in_frame() {
            self.stats.garbage_bytes += 1;
        }
        self.state = DecoderState::Sync0;
        self.payload.clear();
        self.running = 0;
    }
}

// ── Tests ────────────────────────────────────────────────────
