//! Outbound stack events.
//!
//! Upgrade sessions emit these through the
//! [`EventSink`](super::ports::EventSink) port. Adapters on the other side
//! decide what to do with them: popups, progress bars, log lines.

use serde::{Deserialize, Serialize};

use crate::error::UpgradeError;

/// What is being upgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeTarget {
    /// Application package over `0x54..0x57`.
    Firmware,
    /// Image/audio bundle over `0x81..0x83`.
    Resource,
    /// Image pushed to the attached sub-controller.
    SubController,
}

impl core::fmt::Display for UpgradeTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Firmware => write!(f, "firmware"),
            Self::Resource => write!(f, "resource"),
            Self::SubController => write!(f, "sub-controller"),
        }
    }
}

/// Structured events emitted by the protocol stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    UpgradeStarted { target: UpgradeTarget, total: u64 },

    UpgradeProgress { target: UpgradeTarget, percent: u8 },

    /// The idle watchdog abandoned the session. Emitted once per session.
    UpgradeInterrupted { target: UpgradeTarget },

    UpgradeFailed {
        target: UpgradeTarget,
        error: UpgradeError,
    },

    UpgradeInstalled { target: UpgradeTarget },
}
