//! Port traits: the boundary between the protocol stack and the device.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ CommandDispatcher / UpgradeSession
//! ```
//!
//! Everything the stack does not own (file system, key-value config,
//! display, relays, NFC reader, process control) is reached through these
//! traits. The dispatcher receives them bundled in [`Ports`] per call, so
//! tests drive the whole command table with recording mocks.
//!
//! All port errors are typed and carry a manual `Display`.

use serde::{Deserialize, Serialize};

use super::events::StackEvent;

// ───────────────────────────────────────────────────────────────
// Configuration port (device `sysInfo.*` settings)
// ───────────────────────────────────────────────────────────────

/// A single device setting. Numbers and strings are both legal on the
/// device side, so the value keeps whichever shape it was stored with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Number(i64),
    Text(String),
}

impl ConfigValue {
    /// Numeric view; text holding a decimal integer also converts.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Text view; numbers render in decimal.
    pub fn as_text(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

impl From<i64> for ConfigValue {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Reads and writes device settings by `section.key` name.
///
/// Schema validation and persistence policy belong to the implementation.
/// `set` returns [`ConfigError::Rejected`] when a value fails validation.
pub trait ConfigPort {
    fn get(&self, key: &str) -> Option<ConfigValue>;

    fn set(&mut self, key: &str, value: ConfigValue) -> Result<(), ConfigError>;

    /// Every stored setting, keyed by full name.
    fn snapshot(&self) -> serde_json::Map<String, serde_json::Value>;

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    fn get_text(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| v.as_text())
    }
}

// ───────────────────────────────────────────────────────────────
// Storage port (staging files, resource directories)
// ───────────────────────────────────────────────────────────────

/// Byte-level file access for upgrade staging and resource files.
pub trait StoragePort {
    /// Append to `path`, creating it if missing.
    fn append(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Replace the contents of `path`.
    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Whole file contents.
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// MD5 of the file contents.
    fn digest(&self, path: &str) -> Result<[u8; 16], StorageError>;

    fn size(&self, path: &str) -> Result<u64, StorageError>;

    /// Remove a file or directory tree. `Ok(())` when already absent.
    fn remove(&mut self, path: &str) -> Result<(), StorageError>;

    fn exists(&self, path: &str) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Notification ports (popups, progress)
// ───────────────────────────────────────────────────────────────

/// Short user-facing notices (popup or log line).
pub trait NotifyPort {
    fn popup(&mut self, message: &str, duration_ms: u32);
}

/// Receives upgrade progress as an integer percentage.
pub trait ProgressSink {
    fn upgrade_progress(&mut self, percent: u8);
}

/// The stack emits [`StackEvent`]s through this port.
pub trait EventSink {
    fn emit(&mut self, event: &StackEvent);
}

// ───────────────────────────────────────────────────────────────
// OS port (installer, reboot, clock)
// ───────────────────────────────────────────────────────────────

pub trait OsPort {
    /// Unpack a staged archive into `dest_dir`.
    fn unpack(&mut self, archive: &str, dest_dir: &str) -> Result<(), OsError>;

    /// Write `script` to `script_path`, mark it executable and run it.
    fn run_installer(&mut self, script_path: &str, script: &str) -> Result<(), OsError>;

    /// Schedule a reboot after `delay_secs`.
    fn reboot(&mut self, delay_secs: u32);

    /// Set the wall clock.
    fn set_time(&mut self, epoch_secs: u64) -> Result<(), OsError>;

    /// Wall clock in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Wall clock in seconds since the Unix epoch.
    fn now_secs(&self) -> u64 {
        self.now_ms() / 1000
    }
}

// ───────────────────────────────────────────────────────────────
// Device ports (GPIO, audio, NFC, display)
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    Close,
    AlwaysOpen,
    /// Open for the given number of milliseconds.
    OpenFor(u32),
}

/// Identity strings reported by `0x0a`, `0x0b`, `0x0c` and `0x10`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial_number: String,
    pub uuid: String,
    pub chip_id: String,
    pub mac: String,
}

/// Buzzer, relay, door sensor, audio and identity.
pub trait DevicePort {
    fn beep(&mut self, on_ms: u32, off_ms: u32, count: u8);

    fn relay(&mut self, action: RelayAction);

    /// `Some(true)` when the door is open, `None` when no sensor is fitted.
    fn door_open(&self) -> Option<bool>;

    fn play_audio(&mut self, index: u32);

    fn identity(&self) -> DeviceIdentity;

    fn write_serial_number(&mut self, sn: &str) -> Result<(), DeviceError>;

    /// Success / failure chirp after a config change.
    fn signal(&mut self, success: bool) {
        if success {
            self.beep(50, 0, 1);
        } else {
            self.beep(50, 50, 2);
        }
    }
}

/// Key type for MIFARE Classic authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKey {
    A([u8; 6]),
    B([u8; 6]),
}

/// Sector access request for `0xa0` / `0xa1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRequest {
    pub task: u8,
    pub key: CardKey,
    pub sector: u8,
    pub logical_block: u8,
    pub count: u8,
}

/// MIFARE Classic block and sector access.
pub trait CardPort {
    fn read_block(&mut self, task: u8, block: u8, key: CardKey) -> Result<[u8; 16], DeviceError>;

    fn write_block(
        &mut self,
        task: u8,
        block: u8,
        key: CardKey,
        data: &[u8; 16],
    ) -> Result<(), DeviceError>;

    fn read_sector(&mut self, req: &SectorRequest) -> Result<Vec<u8>, DeviceError>;

    fn write_sector(&mut self, req: &SectorRequest, data: &[u8]) -> Result<(), DeviceError>;
}

/// Content for the full-screen custom page (`0x62`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageContent {
    Text {
        center: String,
        left: Option<String>,
        middle: Option<String>,
        right: Option<String>,
    },
    Qr(String),
}

pub trait DisplayPort {
    fn show_message(&mut self, text: &str, duration_ms: u32);

    fn show_page(&mut self, page: &PageContent);

    fn show_image(&mut self, index: u32, duration_ms: u32);

    fn show_system_info(&mut self, visible: bool);

    fn popup(&mut self, text: &str, timeout_ms: u32, closable: bool);
}

// ───────────────────────────────────────────────────────────────
// Port bundle
// ───────────────────────────────────────────────────────────────

/// Borrowed collaborators handed to the dispatcher for one call.
pub struct Ports<'a> {
    pub config: &'a mut dyn ConfigPort,
    pub storage: &'a mut dyn StoragePort,
    pub events: &'a mut dyn EventSink,
    pub os: &'a mut dyn OsPort,
    pub device: &'a mut dyn DevicePort,
    pub card: &'a mut dyn CardPort,
    pub display: &'a mut dyn DisplayPort,
}

/// Owned collaborators for the runtime; lent out as [`Ports`].
pub struct PortSet {
    pub config: Box<dyn ConfigPort + Send>,
    pub storage: Box<dyn StoragePort + Send>,
    pub events: Box<dyn EventSink + Send>,
    pub os: Box<dyn OsPort + Send>,
    pub device: Box<dyn DevicePort + Send>,
    pub card: Box<dyn CardPort + Send>,
    pub display: Box<dyn DisplayPort + Send>,
}

impl PortSet {
    pub fn borrow(&mut self) -> Ports<'_> {
        Ports {
            config: self.config.as_mut(),
            storage: self.storage.as_mut(),
            events: self.events.as_mut(),
            os: self.os.as_mut(),
            device: self.device.as_mut(),
            card: self.card.as_mut(),
            display: self.display.as_mut(),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`ConfigPort`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The value failed validation; the string names the key.
    Rejected(String),
    /// The backing store could not be written.
    IoError,
}

/// Errors from [`StoragePort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    NotFound,
    IoError,
}

/// Errors from [`OsPort`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsError {
    /// The command ran and exited non-zero.
    CommandFailed(String),
    IoError,
}

/// Errors from [`DevicePort`] and [`CardPort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// No card in the field or authentication failed.
    NoCard,
    Unsupported,
    IoError,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Rejected(key) => write!(f, "value rejected for {}", key),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "file not found"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl core::fmt::Display for OsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::CommandFailed(cmd) => write!(f, "command failed: {}", cmd),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl core::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoCard => write!(f, "no card or authentication failed"),
            Self::Unsupported => write!(f, "not supported on this device"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}
