//! Upgrade journal and panic logging.
//!
//! The last 4 upgrade outcomes (installed, failed, interrupted) are kept in
//! a small postcard blob on storage so a terminal that rebooted mid-upgrade
//! can still tell what happened. Each record holds the wall-clock second,
//! the target and a truncated reason.
//!
//! [`JournalSink`] wraps another [`EventSink`] and records terminal
//! upgrade events on their way through.

use core::fmt::Write as _;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::app::events::{StackEvent, UpgradeTarget};
use crate::app::ports::{EventSink, StoragePort};

pub const JOURNAL_SLOTS: usize = 4;
pub const JOURNAL_PATH: &str = "/app/data/upgrade_journal.bin";

const DETAIL_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Installed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRecord {
    pub at_secs: u64,
    pub target: UpgradeTarget,
    pub outcome: Outcome,
    pub detail: heapless::String<DETAIL_LEN>,
}

impl UpgradeRecord {
    pub fn new(at_secs: u64, target: UpgradeTarget, outcome: Outcome, detail: &str) -> Self {
        let mut d = heapless::String::new();
        for c in detail.chars() {
            if d.push(c).is_err() {
                break;
            }
        }
        Self {
            at_secs,
            target,
            outcome,
            detail: d,
        }
    }

    /// Build a record from a terminal event; progress events yield `None`.
    pub fn from_event(at_secs: u64, event: &StackEvent) -> Option<Self> {
        match event {
            StackEvent::UpgradeInstalled { target } => {
                Some(Self::new(at_secs, *target, Outcome::Installed, ""))
            }
            StackEvent::UpgradeInterrupted { target } => {
                Some(Self::new(at_secs, *target, Outcome::Interrupted, "interrupted"))
            }
            StackEvent::UpgradeFailed { target, error } => {
                let mut text: heapless::String<DETAIL_LEN> = heapless::String::new();
                let _ = write!(text, "{}", error);
                Some(Self::new(at_secs, *target, Outcome::Failed, &text))
            }
            StackEvent::UpgradeStarted { .. } | StackEvent::UpgradeProgress { .. } => None,
        }
    }
}

type Records = heapless::Vec<UpgradeRecord, JOURNAL_SLOTS>;

/// Push `record` as the newest entry. Returns the evicted oldest record
/// when the ring was full.
fn append(records: &mut Records, record: UpgradeRecord) -> Option<UpgradeRecord> {
    let evicted = if records.is_full() {
        Some(records.remove(0))
    } else {
        None
    };
    if let Err(record) = records.push(record) {
        warn!("JOURNAL: no slot for record at {}", record.at_secs);
    }
    evicted
}

/// Ring of the most recent upgrade outcomes, persisted at one path.
pub struct UpgradeJournal {
    path: &'static str,
}

impl Default for UpgradeJournal {
    fn default() -> Self {
        Self::new(JOURNAL_PATH)
    }
}

impl UpgradeJournal {
    pub fn new(path: &'static str) -> Self {
        Self { path }
    }

    /// Stored records, oldest first. A missing or corrupt blob reads empty.
    pub fn read_all(&self, storage: &dyn StoragePort) -> Records {
        match storage.read(self.path) {
            Ok(bytes) => postcard::from_bytes(&bytes).unwrap_or_else(|e| {
                warn!("JOURNAL: discarding unreadable journal: {}", e);
                Records::new()
            }),
            Err(_) => Records::new(),
        }
    }

    /// Append `record`, dropping the oldest when full.
    pub fn record(&self, storage: &mut dyn StoragePort, record: UpgradeRecord) {
        let mut records = self.read_all(storage);
        if let Some(old) = append(&mut records, record) {
            debug!("JOURNAL: evicted {:?} record from {}", old.outcome, old.at_secs);
        }
        match postcard::to_allocvec(&records) {
            Ok(bytes) => {
                if let Err(e) = storage.write(self.path, &bytes) {
                    warn!("JOURNAL: write failed: {}", e);
                }
            }
            Err(e) => warn!("JOURNAL: encode failed: {}", e),
        }
    }

    pub fn clear(&self, storage: &mut dyn StoragePort) {
        let _ = storage.remove(self.path);
    }

    pub fn count(&self, storage: &dyn StoragePort) -> usize {
        self.read_all(storage).len()
    }
}

/// [`EventSink`] that journals terminal upgrade events, then forwards
/// every event to `inner`.
pub struct JournalSink<S, T> {
    inner: S,
    storage: T,
    journal: UpgradeJournal,
    clock: fn() -> u64,
}

impl<S: EventSink, T: StoragePort> JournalSink<S, T> {
    /// `clock` returns wall-clock seconds.
    pub fn new(inner: S, storage: T, journal: UpgradeJournal, clock: fn() -> u64) -> Self {
        Self {
            inner,
            storage,
            journal,
            clock,
        }
    }

    pub fn records(&self) -> Records {
        self.journal.read_all(&self.storage)
    }
}

impl<S: EventSink, T: StoragePort> EventSink for JournalSink<S, T> {
    fn emit(&mut self, event: &StackEvent) {
        if let Some(rec) = UpgradeRecord::from_event((self.clock)(), event) {
            self.journal.record(&mut self.storage, rec);
        }
        self.inner.emit(event);
    }
}

/// Log panics through the `log` facade before the default hook runs.
pub fn install_panic_handler() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let reason = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            *msg
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.as_str()
        } else {
            "unknown panic"
        };
        match info.location() {
            Some(loc) => log::error!("PANIC: {} at {}:{}", reason, loc.file(), loc.line()),
            None => log::error!("PANIC: {}", reason),
        }
        default_hook(info);
    }));
}
