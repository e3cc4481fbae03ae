//! Upgrade events as user-facing popups and progress.

use crate::app::events::StackEvent;
use crate::app::ports::{EventSink, NotifyPort, ProgressSink};

const NOTICE_MS: u32 = 2000;
/// The interruption notice stays up until someone deals with it.
const INTERRUPTED_MS: u32 = 600_000;

/// Turns [`StackEvent`]s into popups on `N` and percentages on `N`'s
/// progress sink.
pub struct UpgradeNotifier<N> {
    inner: N,
}

impl<N: NotifyPort + ProgressSink> UpgradeNotifier<N> {
    pub fn new(inner: N) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> N {
        self.inner
    }
}

impl<N: NotifyPort + ProgressSink> EventSink for UpgradeNotifier<N> {
    fn emit(&mut self, event: &StackEvent) {
        match event {
            StackEvent::UpgradeStarted { .. } => self.inner.popup("Start Upgrading", NOTICE_MS),
            StackEvent::UpgradeProgress { percent, .. } => {
                self.inner.upgrade_progress(*percent);
                self.inner
                    .popup(&format!("Upgrading {}%", percent), NOTICE_MS);
            }
            StackEvent::UpgradeInterrupted { .. } => {
                self.inner.popup("Upgrade interruption", INTERRUPTED_MS);
            }
            StackEvent::UpgradeFailed { .. } => self.inner.popup("Upgrade Failed", NOTICE_MS),
            StackEvent::UpgradeInstalled { .. } => {
                self.inner.popup("Upgrade Successfully", NOTICE_MS);
            }
        }
    }
}
