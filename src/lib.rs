//! vgstack: control-channel protocol stack for scanner / access terminals.
//!
//! Exposes the protocol modules for integration testing and for embedding
//! in a device daemon. Everything outside the stack (file system, screen,
//! relays, NFC reader, process control) is reached through the port
//! traits in [`app::ports`].

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod proto;

pub use error::{Error, Result};

// Host critical-section implementation behind embassy-sync's raw mutex.
use critical_section as _;
