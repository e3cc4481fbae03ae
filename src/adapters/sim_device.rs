//! Simulated terminal peripherals.
//!
//! Host-side stand-ins for the buzzer, relay, door sensor, NFC reader and
//! screen. Every action is logged; the card is an in-memory MIFARE
//! Classic 1K image so block and sector commands round-trip.

use log::{info, warn};

use super::device_id::{self, MacAddress};
use crate::app::ports::{
    CardKey, CardPort, DeviceError, DeviceIdentity, DevicePort, DisplayPort, PageContent,
    RelayAction, SectorRequest,
};

// ── Device ───────────────────────────────────────────────────

pub struct SimDevice {
    mac: MacAddress,
    serial_number: String,
    door: Option<bool>,
    relay: RelayAction,
}

impl SimDevice {
    pub fn new(mac: MacAddress, serial_number: impl Into<String>) -> Self {
        Self {
            mac,
            serial_number: serial_number.into(),
            door: None,
            relay: RelayAction::Close,
        }
    }

    /// Fit a door sensor reporting `open`.
    pub fn with_door(mut self, open: bool) -> Self {
        self.door = Some(open);
        self
    }

    pub fn relay_state(&self) -> RelayAction {
        self.relay
    }
}

impl DevicePort for SimDevice {
    fn beep(&mut self, on_ms: u32, off_ms: u32, count: u8) {
        info!("DEVICE: beep {}x {}/{} ms", count, on_ms, off_ms);
    }

    fn relay(&mut self, action: RelayAction) {
        info!("DEVICE: relay {:?}", action);
        self.relay = action;
    }

    fn door_open(&self) -> Option<bool> {
        self.door
    }

    fn play_audio(&mut self, index: u32) {
        info!("DEVICE: play {}.wav", index);
    }

    fn identity(&self) -> DeviceIdentity {
        device_id::identity(&self.mac, &self.serial_number)
    }

    fn write_serial_number(&mut self, sn: &str) -> Result<(), DeviceError> {
        if sn.is_empty() || sn.len() > 32 {
            warn!("DEVICE: serial number '{}' rejected", sn);
            return Err(DeviceError::Unsupported);
        }
        info!("DEVICE: serial number -> {}", sn);
        self.serial_number = sn.to_owned();
        Ok(())
    }
}

// ── Card ─────────────────────────────────────────────────────

const BLOCK_LEN: usize = 16;
const BLOCKS: usize = 64;
const BLOCKS_PER_SECTOR: u8 = 4;

/// In-memory MIFARE Classic 1K with factory keys.
pub struct SimCard {
    blocks: Vec<[u8; BLOCK_LEN]>,
    present: bool,
}

impl Default for SimCard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCard {
    pub fn new() -> Self {
        Self {
            blocks: vec![[0u8; BLOCK_LEN]; BLOCKS],
            present: true,
        }
    }

    /// Take the card out of the field.
    pub fn remove(&mut self) {
        self.present = false;
    }

    fn authenticate(&self, key: CardKey) -> Result<(), DeviceError> {
        if !self.present {
            return Err(DeviceError::NoCard);
        }
        match key {
            CardKey::A(k) | CardKey::B(k) if k == [0xff; 6] => Ok(()),
            _ => Err(DeviceError::NoCard),
        }
    }

    fn sector_range(req: &SectorRequest) -> Result<core::ops::Range<usize>, DeviceError> {
        let first = usize::from(req.sector) * usize::from(BLOCKS_PER_SECTOR)
            + usize::from(req.logical_block);
        let end = first + usize::from(req.count);
        if req.count == 0 || end > BLOCKS {
            return Err(DeviceError::Unsupported);
        }
        Ok(first..end)
    }
}

impl CardPort for SimCard {
    fn read_block(&mut self, _task: u8, block: u8, key: CardKey) -> Result<[u8; 16], DeviceError> {
        self.authenticate(key)?;
        self.blocks
            .get(usize::from(block))
            .copied()
            .ok_or(DeviceError::Unsupported)
    }

    fn write_block(
        &mut self,
        _task: u8,
        block: u8,
        key: CardKey,
        data: &[u8; 16],
    ) -> Result<(), DeviceError> {
        self.authenticate(key)?;
        let slot = self
            .blocks
            .get_mut(usize::from(block))
            .ok_or(DeviceError::Unsupported)?;
        *slot = *data;
        Ok(())
    }

    fn read_sector(&mut self, req: &SectorRequest) -> Result<Vec<u8>, DeviceError> {
        self.authenticate(req.key)?;
        let range = Self::sector_range(req)?;
        Ok(self.blocks[range].iter().flatten().copied().collect())
    }

    fn write_sector(&mut self, req: &SectorRequest, data: &[u8]) -> Result<(), DeviceError> {
        self.authenticate(req.key)?;
        let range = Self::sector_range(req)?;
        if data.len() != range.len() * BLOCK_LEN {
            return Err(DeviceError::Unsupported);
        }
        for (slot, chunk) in self.blocks[range].iter_mut().zip(data.chunks_exact(BLOCK_LEN)) {
            slot.copy_from_slice(chunk);
        }
        Ok(())
    }
}

// ── Display ──────────────────────────────────────────────────

/// Logs what the screen would show.
#[derive(Debug, Default)]
pub struct LogDisplay;

impl DisplayPort for LogDisplay {
    fn show_message(&mut self, text: &str, duration_ms: u32) {
        info!("SCREEN: message {:?} ({} ms)", text, duration_ms);
    }

    fn show_page(&mut self, page: &PageContent) {
        match page {
            PageContent::Text { center, .. } => info!("SCREEN: page {:?}", center),
            PageContent::Qr(qr) => info!("SCREEN: QR {:?}", qr),
        }
    }

    fn show_image(&mut self, index: u32, duration_ms: u32) {
        info!("SCREEN: image {}.png ({} ms)", index, duration_ms);
    }

    fn show_system_info(&mut self, visible: bool) {
        info!("SCREEN: system info {}", if visible { "shown" } else { "hidden" });
    }

    fn popup(&mut self, text: &str, timeout_ms: u32, closable: bool) {
        info!("SCREEN: popup {:?} ({} ms, closable={})", text, timeout_ms, closable);
    }
}
