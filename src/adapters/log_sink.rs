//! Log-based notification adapter.
//!
//! Implements [`NotifyPort`], [`ProgressSink`] and [`EventSink`] by writing
//! to the `log` facade. On a headless host this is the whole user
//! interface; on a terminal the same events also feed the screen through
//! [`UpgradeNotifier`](super::notify::UpgradeNotifier).

use log::{info, warn};

use crate::app::events::StackEvent;
use crate::app::ports::{EventSink, NotifyPort, ProgressSink};

/// Adapter that logs every notice and [`StackEvent`].
#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl NotifyPort for LogNotifier {
    fn popup(&mut self, message: &str, duration_ms: u32) {
        info!("POPUP | {} ({} ms)", message, duration_ms);
    }
}

impl ProgressSink for LogNotifier {
    fn upgrade_progress(&mut self, percent: u8) {
        info!("UPGRADE | {}%", percent);
    }
}

impl EventSink for LogNotifier {
    fn emit(&mut self, event: &StackEvent) {
        match event {
            StackEvent::UpgradeStarted { target, total } => {
                info!("UPGRADE | {} started, {} bytes", target, total);
            }
            StackEvent::UpgradeProgress { target, percent } => {
                info!("UPGRADE | {} {}%", target, percent);
            }
            StackEvent::UpgradeInterrupted { target } => {
                warn!("UPGRADE | {} interrupted", target);
            }
            StackEvent::UpgradeFailed { target, error } => {
                warn!("UPGRADE | {} failed: {}", target, error);
            }
            StackEvent::UpgradeInstalled { target } => {
                info!("UPGRADE | {} installed", target);
            }
        }
    }
}
