//! Inter-task channels between link readers and the dispatcher.
//!
//! Uses `embassy-sync` bounded MPMC channels. Reader threads decode frames
//! and push whole packets; the dispatcher thread owns the engine and the
//! ports, and pushes encoded frames to the writer task.
//!
//! ```text
//! ┌──────────────┐  InboundMsg  ┌──────────────┐  Outbound  ┌────────────┐
//! │ Link readers │────────────▶│  Dispatcher  │──────────▶│   Writer   │
//! │ (threads)    │             │  (executor)  │           │  (task)    │
//! └──────────────┘             └──────────────┘           └────────────┘
//! ```
//!
//! The channels live in one [`StackChannels`] shared by `Arc`, so several
//! stacks (and tests) can run side by side in one process.

use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use log::warn;

use super::codec::Packet;
use super::router::{DataSource, Outbound};
use super::transport::TransportId;

/// Completion slot for one HTTP request body.
pub type HttpReply = Signal<CriticalSectionRawMutex, Result<Option<String>, crate::error::Error>>;

/// Work for the dispatcher.
pub enum InboundMsg {
    /// A decoded frame from a link reader.
    Packet { source: TransportId, packet: Packet },
    /// Business data from the scanner, NFC reader or keypad.
    Report { source: DataSource, data: Vec<u8> },
    /// An HTTP request body; the JSON reply is signalled on `reply`.
    Http { body: Vec<u8>, reply: Arc<HttpReply> },
    /// The link's reader saw the peer go away.
    LinkDown { source: TransportId },
}

/// Channel depth for inbound work.
const INBOUND_DEPTH: usize = 16;

/// Channel depth for encoded frames awaiting a writer.
const OUTBOUND_DEPTH: usize = 32;

pub struct StackChannels {
    pub inbound: Channel<CriticalSectionRawMutex, InboundMsg, INBOUND_DEPTH>,
    pub outbound: Channel<CriticalSectionRawMutex, Outbound, OUTBOUND_DEPTH>,
}

impl Default for StackChannels {
    fn default() -> Self {
        Self::new()
    }
}

impl StackChannels {
    pub const fn new() -> Self {
        Self {
            inbound: Channel::new(),
            outbound: Channel::new(),
        }
    }

    /// Queue work for the dispatcher; `false` when the queue is full.
    pub fn push_inbound(&self, msg: InboundMsg) -> bool {
        if self.inbound.try_send(msg).is_err() {
            warn!("CHAN: inbound queue full, dropping");
            return false;
        }
        true
    }

    pub fn push_outbound(&self, out: Outbound) {
        let dest = out.dest;
        if self.outbound.try_send(out).is_err() {
            warn!("CHAN: outbound queue full, dropping frame for {}", dest);
        }
    }
}
