//! Stack configuration parameters
//!
//! Tunables for the protocol stack itself (timeouts, chunking, staging
//! paths, transports). Device behaviour settings (`sysInfo.*`) are not
//! stored here; they are read through [`ConfigPort`](crate::app::ports::ConfigPort)
//! using the names in [`keys`].

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Per-transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Serial device for the RS-485 host line, e.g. `/dev/ttyS2`.
    pub rs485_device: Option<String>,
    /// Serial device for the sub-controller link.
    pub subctl_device: Option<String>,
    pub baud_rate: u32,
    /// `host:port` for the TCP upstream, if any.
    pub tcp_addr: Option<String>,
    /// Inbound RS-485 frames carry a result byte.
    pub rs485_expects_result: bool,
    /// Inbound TCP frames carry a result byte.
    pub tcp_expects_result: bool,
    /// Inbound sub-controller frames carry a result byte.
    pub subctl_expects_result: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            rs485_device: None,
            subctl_device: None,
            baud_rate: 115_200,
            tcp_addr: None,
            rs485_expects_result: false,
            tcp_expects_result: false,
            subctl_expects_result: true,
        }
    }
}

/// Core stack configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    // --- Upgrade ---
    /// Abandon an upgrade after this long without progress (milliseconds)
    pub upgrade_idle_ms: u64,
    /// Largest firmware or resource image accepted (bytes)
    pub max_image_size: u64,
    /// Staging file for `0x54/0x58` firmware images
    pub firmware_staging_path: String,
    /// Staging file for `0x81/0x82` resource bundles
    pub resource_staging_path: String,
    /// Scratch directory the installer unpacks into
    pub ota_root: String,
    /// Installer script written and run after a verified upgrade
    pub installer_script: String,
    /// Application tree a firmware package is copied over
    pub app_dir: String,
    /// Resource directories for `0x29`, `0x63` and `0x8a`
    pub image_dir: String,
    pub audio_dir: String,

    // --- Sub-controller ---
    /// Fixed chunk size on the sub-controller link (bytes)
    pub subctl_chunk_size: usize,
    /// Wait for each sub-controller acknowledgement (milliseconds)
    pub sync_timeout_ms: u64,

    // --- Reporting ---
    /// Shortest heartbeat period (seconds)
    pub heartbeat_floor_secs: u32,
    /// Partial frames older than this are dropped by the reader (milliseconds)
    pub partial_frame_expiry_ms: u64,
    /// Dispatcher tick period (milliseconds)
    pub tick_interval_ms: u64,

    /// Firmware version reported by `0x37` when the device config has none
    pub firmware_version: String,

    pub transports: TransportSettings,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            // Upgrade
            upgrade_idle_ms: 2000,
            max_image_size: 64 * 1024 * 1024,
            firmware_staging_path: "/app/data/upgrades/download.zip".into(),
            resource_staging_path: "/ota/download.zip".into(),
            ota_root: "/ota".into(),
            installer_script: "/ota/run.sh".into(),
            app_dir: "/app/code".into(),
            image_dir: "/app/code/resource/image".into(),
            audio_dir: "/app/code/resource/wav".into(),

            // Sub-controller
            subctl_chunk_size: 512,
            sync_timeout_ms: 2000,

            // Reporting
            heartbeat_floor_secs: 30,
            partial_frame_expiry_ms: 500,
            tick_interval_ms: 100,

            firmware_version: env!("CARGO_PKG_VERSION").into(),
            transports: TransportSettings::default(),
        }
    }
}

impl StackConfig {
    /// Reject settings that would wedge the stack.
    pub fn validate(&self) -> Result<(), Error> {
        if self.upgrade_idle_ms == 0 {
            return Err(Error::Config("upgrade_idle_ms must be non-zero"));
        }
        if self.sync_timeout_ms == 0 {
            return Err(Error::Config("sync_timeout_ms must be non-zero"));
        }
        if self.subctl_chunk_size == 0 || self.subctl_chunk_size > 0x0FFF {
            return Err(Error::Config("subctl_chunk_size must be 1..=4095"));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be non-zero"));
        }
        if self.max_image_size == 0 {
            return Err(Error::Config("max_image_size must be non-zero"));
        }
        if self.firmware_staging_path.is_empty() || self.resource_staging_path.is_empty() {
            return Err(Error::Config("staging paths must be set"));
        }
        Ok(())
    }
}

/// Device configuration key names read through the config port.
pub mod keys {
    pub const WORK_MODE: &str = "sysInfo.w_mode";
    pub const DATA_CHANNEL: &str = "sysInfo.dchannel";
    pub const OUTPUT_CHANNEL: &str = "sysInfo.ochannel";
    pub const NFC_OUTPUT_CHANNEL: &str = "sysInfo.nochannel";
    pub const BLE_OUTPUT_CHANNEL: &str = "sysInfo.blochannel";
    pub const NETWORK_OUTPUT: &str = "sysInfo.owifi";
    pub const DEVICE_NUMBER: &str = "sysInfo.devnum";
    pub const REPORT_MODE: &str = "sysInfo.report_mode";
    pub const REPORT_TIMEOUT: &str = "sysInfo.report_timeout";
    pub const SAFE_OPEN: &str = "sysInfo.safe_open";
    pub const VERSION: &str = "sysInfo.version";
    pub const CONFIG_PASSWORD: &str = "sysInfo.com_passwd";

    pub const CODE_SWITCH: &str = "sysInfo.codeSwitch";
    pub const DECODER_TYPES: &str = "sysInfo.de_type";
    pub const NFC_ENABLED: &str = "sysInfo.nfc";
    pub const SCAN_MODE: &str = "sysInfo.s_mode";
    pub const SCAN_INTERVAL: &str = "sysInfo.interval";
    pub const BEEP_ON_SCAN: &str = "sysInfo.ascan";
    pub const BEEP_ON_NFC: &str = "sysInfo.anfc";
    pub const NFC_REPORT: &str = "sysInfo.nfcReport";
    pub const BEEP_DURATION: &str = "sysInfo.beepd";

    pub const HEART_ENABLED: &str = "sysInfo.heart_en";
    pub const HEART_PERIOD: &str = "sysInfo.heart_time";
    pub const HEART_DATA: &str = "sysInfo.heart_data";

    pub const BLE_FORMAT: &str = "sysInfo.blft";
    pub const BLE_PREFIX: &str = "sysInfo.blpri";
    pub const BLE_SUFFIX: &str = "sysInfo.blpos";
    pub const BLE_AFFIX_MODE: &str = "sysInfo.blhorc";
    pub const BLE_APPEND_CR: &str = "sysInfo.blnl";
    pub const BLE_APPEND_LF: &str = "sysInfo.blcr";

    /// Prefix shared by every device key; stripped from config-code entries.
    pub const SECTION: &str = "sysInfo.";
}
