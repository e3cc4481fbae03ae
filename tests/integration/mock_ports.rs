//! Recording port doubles for integration tests.
//!
//! Every device, OS and display call is captured so tests can assert on
//! the full history without a real terminal attached. Configuration uses
//! the real [`MemoryConfig`] adapter.

use std::collections::HashMap;

use vgstack::adapters::kv_config::MemoryConfig;
use vgstack::app::events::StackEvent;
use vgstack::app::ports::{
    CardKey, CardPort, DeviceError, DeviceIdentity, DevicePort, DisplayPort, EventSink, OsError,
    OsPort, PageContent, Ports, RelayAction, SectorRequest, StorageError, StoragePort,
};

// ── Storage ──────────────────────────────────────────────────

#[derive(Default)]
pub struct MockStorage {
    pub files: HashMap<String, Vec<u8>>,
    pub fail_writes: bool,
}

#[allow(dead_code)]
impl MockStorage {
    pub fn with_file(mut self, path: &str, data: &[u8]) -> Self {
        self.files.insert(path.to_owned(), data.to_vec());
        self
    }
}

impl StoragePort for MockStorage {
    fn append(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::IoError);
        }
        self.files.entry(path.to_owned()).or_default().extend_from_slice(data);
        Ok(())
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::IoError);
        }
        self.files.insert(path.to_owned(), data.to_vec());
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.files.get(path).cloned().ok_or(StorageError::NotFound)
    }

    fn digest(&self, path: &str) -> Result<[u8; 16], StorageError> {
        self.read(path).map(|d| md5::compute(d).0)
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        self.read(path).map(|d| d.len() as u64)
    }

    fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        self.files.remove(path);
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }
}

// ── OS ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsCall {
    Unpack { archive: String, dest: String },
    RunInstaller { script_path: String },
    Reboot(u32),
    SetTime(u64),
}

#[derive(Default)]
pub struct MockOs {
    pub calls: Vec<OsCall>,
    pub now_ms: u64,
    pub fail_install: bool,
}

#[allow(dead_code)]
impl MockOs {
    pub fn reboots(&self) -> Vec<u32> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                OsCall::Reboot(s) => Some(*s),
                _ => None,
            })
            .collect()
    }
}

impl OsPort for MockOs {
    fn unpack(&mut self, archive: &str, dest_dir: &str) -> Result<(), OsError> {
        self.calls.push(OsCall::Unpack {
            archive: archive.to_owned(),
            dest: dest_dir.to_owned(),
        });
        Ok(())
    }

    fn run_installer(&mut self, script_path: &str, _script: &str) -> Result<(), OsError> {
        self.calls.push(OsCall::RunInstaller {
            script_path: script_path.to_owned(),
        });
        if self.fail_install {
            return Err(OsError::CommandFailed("sh".into()));
        }
        Ok(())
    }

    fn reboot(&mut self, delay_secs: u32) {
        self.calls.push(OsCall::Reboot(delay_secs));
    }

    fn set_time(&mut self, epoch_secs: u64) -> Result<(), OsError> {
        self.calls.push(OsCall::SetTime(epoch_secs));
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.now_ms
    }
}

// ── Device ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Beep { on_ms: u32, off_ms: u32, count: u8 },
    Relay(RelayAction),
    PlayAudio(u32),
    WriteSerial(String),
}

pub struct MockDevice {
    pub calls: Vec<DeviceCall>,
    pub door: Option<bool>,
    pub identity: DeviceIdentity,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            door: None,
            identity: DeviceIdentity {
                serial_number: "VG0001".into(),
                uuid: "uuid-0001".into(),
                chip_id: "chip-0001".into(),
                mac: "00:11:22:33:44:55".into(),
            },
        }
    }
}

#[allow(dead_code)]
impl MockDevice {
    pub fn beeps(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, DeviceCall::Beep { .. }))
            .count()
    }
}

impl DevicePort for MockDevice {
    fn beep(&mut self, on_ms: u32, off_ms: u32, count: u8) {
        self.calls.push(DeviceCall::Beep { on_ms, off_ms, count });
    }

    fn relay(&mut self, action: RelayAction) {
        self.calls.push(DeviceCall::Relay(action));
    }

    fn door_open(&self) -> Option<bool> {
        self.door
    }

    fn play_audio(&mut self, index: u32) {
        self.calls.push(DeviceCall::PlayAudio(index));
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }

    fn write_serial_number(&mut self, sn: &str) -> Result<(), DeviceError> {
        if sn.is_empty() {
            return Err(DeviceError::Unsupported);
        }
        self.identity.serial_number = sn.to_owned();
        self.calls.push(DeviceCall::WriteSerial(sn.to_owned()));
        Ok(())
    }
}

// ── Card reader ──────────────────────────────────────────────

/// A card that is always present, with every block zeroed.
#[derive(Default)]
pub struct MockCard {
    pub blocks: HashMap<u8, [u8; 16]>,
    pub absent: bool,
}

impl CardPort for MockCard {
    fn read_block(&mut self, _task: u8, block: u8, _key: CardKey) -> Result<[u8; 16], DeviceError> {
        if self.absent {
            return Err(DeviceError::NoCard);
        }
        Ok(self.blocks.get(&block).copied().unwrap_or([0; 16]))
    }

    fn write_block(
        &mut self,
        _task: u8,
        block: u8,
        _key: CardKey,
        data: &[u8; 16],
    ) -> Result<(), DeviceError> {
        if self.absent {
            return Err(DeviceError::NoCard);
        }
        self.blocks.insert(block, *data);
        Ok(())
    }

    fn read_sector(&mut self, req: &SectorRequest) -> Result<Vec<u8>, DeviceError> {
        let first = req.sector * 4 + req.logical_block;
        let mut out = Vec::new();
        for block in first..first + req.count {
            out.extend_from_slice(&self.read_block(req.task, block, req.key)?);
        }
        Ok(out)
    }

    fn write_sector(&mut self, req: &SectorRequest, data: &[u8]) -> Result<(), DeviceError> {
        let first = req.sector * 4 + req.logical_block;
        for (i, chunk) in data.chunks(16).enumerate() {
            let mut block = [0u8; 16];
            block[..chunk.len()].copy_from_slice(chunk);
            self.write_block(req.task, first + i as u8, req.key, &block)?;
        }
        Ok(())
    }
}

// ── Display ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayCall {
    Message(String),
    Page(PageContent),
    Image(u32),
    SystemInfo(bool),
    Popup { text: String, timeout_ms: u32, closable: bool },
}

#[derive(Default)]
pub struct MockDisplay {
    pub calls: Vec<DisplayCall>,
}

impl DisplayPort for MockDisplay {
    fn show_message(&mut self, text: &str, _duration_ms: u32) {
        self.calls.push(DisplayCall::Message(text.to_owned()));
    }

    fn show_page(&mut self, page: &PageContent) {
        self.calls.push(DisplayCall::Page(page.clone()));
    }

    fn show_image(&mut self, index: u32, _duration_ms: u32) {
        self.calls.push(DisplayCall::Image(index));
    }

    fn show_system_info(&mut self, visible: bool) {
        self.calls.push(DisplayCall::SystemInfo(visible));
    }

    fn popup(&mut self, text: &str, timeout_ms: u32, closable: bool) {
        self.calls.push(DisplayCall::Popup {
            text: text.to_owned(),
            timeout_ms,
            closable,
        });
    }
}

// ── Events ───────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingEvents {
    pub events: Vec<StackEvent>,
}

impl EventSink for RecordingEvents {
    fn emit(&mut self, event: &StackEvent) {
        self.events.push(event.clone());
    }
}

// ── MockTerminal ─────────────────────────────────────────────

/// Every port a dispatcher needs, owned in one place.
#[derive(Default)]
pub struct MockTerminal {
    pub config: MemoryConfig,
    pub storage: MockStorage,
    pub events: RecordingEvents,
    pub os: MockOs,
    pub device: MockDevice,
    pub card: MockCard,
    pub display: MockDisplay,
}

#[allow(dead_code)]
impl MockTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ports(&mut self) -> Ports<'_> {
        Ports {
            config: &mut self.config,
            storage: &mut self.storage,
            events: &mut self.events,
            os: &mut self.os,
            device: &mut self.device,
            card: &mut self.card,
            display: &mut self.display,
        }
    }
}
