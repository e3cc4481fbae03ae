//! Adapters: concrete implementations of the port traits.
//!
//! | Adapter       | Implements           | Connects to                   |
//! |---------------|----------------------|-------------------------------|
//! | `kv_config`   | ConfigPort           | JSON settings file / memory   |
//! | `fs_storage`  | StoragePort          | Local file system             |
//! | `process_os`  | OsPort               | unzip, sh, reboot, date       |
//! | `sim_device`  | DevicePort           | Logged buzzer / relay / door  |
//! |               | CardPort             | In-memory MIFARE card         |
//! |               | DisplayPort          | Logged screen                 |
//! | `log_sink`    | NotifyPort           | Log output                    |
//! |               | ProgressSink         |                               |
//! |               | EventSink            |                               |
//! | `notify`      | EventSink            | Popups over a NotifyPort      |
//! | `serial`      | Transport            | RS-485 / sub-controller UART  |
//! | `tcp`         | Transport            | Upstream TCP socket           |
//! | `device_id`   | —                    | MAC-derived identity strings  |
//! | `time`        | —                    | Monotonic and wall clocks     |

pub mod device_id;
pub mod fs_storage;
pub mod kv_config;
pub mod log_sink;
pub mod notify;
pub mod process_os;
#[cfg(feature = "serial")]
pub mod serial;
pub mod sim_device;
pub mod tcp;
pub mod time;
