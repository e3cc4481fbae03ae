//! Control-channel protocol stack.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Protocol Stack                           │
//! │                                                              │
//! │  ┌───────────┐   ┌──────────┐   ┌──────────────────────────┐ │
//! │  │ Transport │──▶│  Codec   │──▶│ Engine → Dispatcher      │ │
//! │  │ (trait)   │   │ (55 AA)  │   │   → Ports / UpgradeSlot  │ │
//! │  └───────────┘   └──────────┘   └──────────────────────────┘ │
//! │       ▲                                    │                 │
//! │       │              ┌─────────────────────┘                 │
//! │       │              ▼                                       │
//! │  ┌───────────┐   ┌──────────┐   ┌──────────────────────────┐ │
//! │  │ Transport │◀──│  Router  │   │ SyncBridge ◀── subctl    │ │
//! │  │ (write)   │   │ (report) │   │   (0x60 acknowledgements)│ │
//! │  └───────────┘   └──────────┘   └──────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod channels;
pub mod codec;
pub mod command;
pub mod config_code;
pub mod dispatch;
pub mod engine;
pub mod http;
pub mod io_task;
pub mod router;
pub mod subctl;
pub mod sync;
pub mod transport;
pub mod upgrade;
