//! Chunked image transfer state machine.
//!
//! Flow: start → [describe] → N × chunk → finish (verify) → install
//!
//! ```text
//!  Idle ──start──▶ AwaitingDescriptor ──describe──▶ Transferring ──finish──▶
//!   ▲                  │ (storage: first chunk)       ▲    │chunk
//!   │                  └──────────────────────────────┘◀───┘
//!   │
//!   └── install ◀── Verifying ◀── Finishing ◀──┘
//! ```
//!
//! One session type serves every upgrade path. Where the bytes go is the
//! business of a [`TransferStrategy`]: [`StorageUpload`] appends to a
//! staging file, the sub-controller strategy in [`super::subctl`] pushes
//! fixed-size chunks over the link and waits for each acknowledgement.
//!
//! Each strategy names the digest it verifies with: the upgrade host sends
//! MD5 for storage uploads, the sub-controller descriptor carries SHA-256.
//!
//! The session never owns its strategy. Callers lend it per call, along
//! with the event sink and the current monotonic time, so the dispatcher
//! can build a storage strategy from its borrowed ports and tests can
//! drive time explicitly.

use log::{info, warn};

use crate::app::events::{StackEvent, UpgradeTarget};
use crate::app::ports::{EventSink, OsPort, StoragePort};
use crate::error::{IntegrityError, UpgradeError};

// ── Digest ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    Md5,
    Sha256,
}

impl DigestKind {
    pub const fn byte_len(self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha256 => 32,
        }
    }

    pub fn of(self, data: &[u8]) -> ImageDigest {
        match self {
            Self::Md5 => ImageDigest::Md5(md5::compute(data).0),
            Self::Sha256 => ImageDigest::Sha256(hmac_sha256::Hash::hash(data)),
        }
    }

    /// Raw digest bytes, or the same digest as hex text.
    pub fn parse(self, p: &[u8]) -> Option<ImageDigest> {
        let raw = if p.len() == self.byte_len() {
            p.to_vec()
        } else if p.len() == 2 * self.byte_len() {
            hex::decode(p).ok()?
        } else {
            return None;
        };
        match self {
            Self::Md5 => raw.try_into().ok().map(ImageDigest::Md5),
            Self::Sha256 => raw.try_into().ok().map(ImageDigest::Sha256),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDigest {
    Md5([u8; 16]),
    Sha256([u8; 32]),
}

impl ImageDigest {
    pub fn kind(&self) -> DigestKind {
        match self {
            Self::Md5(_) => DigestKind::Md5,
            Self::Sha256(_) => DigestKind::Sha256,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Md5(d) => d,
            Self::Sha256(d) => d,
        }
    }
}

// ── Strategy ─────────────────────────────────────────────────

/// Moves image bytes to their destination.
pub trait TransferStrategy {
    /// Prepare for an image of `total` bytes (clear staging, enter mode).
    fn begin(&mut self, total: u64) -> Result<(), UpgradeError>;

    /// Algorithm the image is verified with.
    fn digest_kind(&self) -> DigestKind;

    /// Whether [`UpgradeSession::describe`] must precede the first chunk.
    fn descriptor_required(&self) -> bool {
        false
    }

    /// Announce size and digest to the destination.
    fn describe(&mut self, _total: u64, _digest: &ImageDigest) -> Result<(), UpgradeError> {
        Ok(())
    }

    /// Deliver one chunk. Returns the number of image bytes it carried,
    /// excluding any padding the strategy adds on the wire.
    fn transfer(&mut self, index: u32, data: &[u8]) -> Result<u64, UpgradeError>;

    /// Signal end of data.
    fn complete(&mut self) -> Result<(), UpgradeError> {
        Ok(())
    }

    /// Digest over exactly the delivered image bytes.
    fn content_digest(&mut self) -> Result<ImageDigest, UpgradeError>;

    /// Apply the verified image.
    fn install(&mut self) -> Result<(), UpgradeError>;

    /// Release anything staged so far.
    fn discard(&mut self);
}

// ── Session ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Idle,
    AwaitingDescriptor,
    Transferring,
    Finishing,
    Verifying,
    Installing,
}

pub struct UpgradeSession {
    target: UpgradeTarget,
    state: UpgradeState,
    expected_total: u64,
    expected_chunks: Option<u32>,
    transferred: u64,
    chunks_received: u32,
    digest: Option<ImageDigest>,
    last_activity_ms: u64,
    last_percent: Option<u8>,
    idle_ms: u64,
    max_size: u64,
}

impl UpgradeSession {
    pub fn new(target: UpgradeTarget, idle_ms: u64, max_size: u64) -> Self {
        Self {
            target,
            state: UpgradeState::Idle,
            expected_total: 0,
            expected_chunks: None,
            transferred: 0,
            chunks_received: 0,
            digest: None,
            last_activity_ms: 0,
            last_percent: None,
            idle_ms,
            max_size,
        }
    }

    pub fn target(&self) -> UpgradeTarget {
        self.target
    }

    pub fn state(&self) -> UpgradeState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != UpgradeState::Idle
    }

    pub fn total(&self) -> u64 {
        self.expected_total
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn expected_chunks(&self) -> Option<u32> {
        self.expected_chunks
    }

    /// Chunks accepted so far in this session.
    pub fn chunks_received(&self) -> u32 {
        self.chunks_received
    }

    /// `1 − remaining/total`, floored to a whole percent.
    pub fn progress_percent(&self) -> u8 {
        if self.expected_total == 0 {
            return 0;
        }
        ((self.transferred * 100) / self.expected_total).min(100) as u8
    }

    fn idle_expired(&self, now_ms: u64) -> bool {
        self.is_active() && now_ms.saturating_sub(self.last_activity_ms) > self.idle_ms
    }

    /// Open a session for an image of `total` bytes.
    ///
    /// `digest` may be supplied now or at [`finish`](Self::finish).
    /// `expected_chunks` is informational (resource bundles announce it).
    pub fn start(
        &mut self,
        strategy: &mut impl TransferStrategy,
        events: &mut dyn EventSink,
        total: u64,
        digest: Option<ImageDigest>,
        expected_chunks: Option<u32>,
        now_ms: u64,
    ) -> Result<(), UpgradeError> {
        check_kind(strategy, digest.as_ref())?;
        if self.is_active() {
            if !self.idle_expired(now_ms) {
                return Err(UpgradeError::AlreadyActive);
            }
            self.interrupt(strategy, events);
        }
        if total == 0 || total > self.max_size {
            return Err(UpgradeError::InvalidSize);
        }

        strategy.begin(total)?;

        self.state = UpgradeState::AwaitingDescriptor;
        self.expected_total = total;
        self.expected_chunks = expected_chunks;
        self.transferred = 0;
        self.chunks_received = 0;
        self.digest = digest;
        self.last_activity_ms = now_ms;
        self.last_percent = None;
        info!("UPGRADE[{}]: begin ({} bytes)", self.target, total);
        events.emit(&StackEvent::UpgradeStarted {
            target: self.target,
            total,
        });
        Ok(())
    }

    /// Send the size and digest descriptor. Required before chunks only
    /// when the strategy says so.
    pub fn describe(
        &mut self,
        strategy: &mut impl TransferStrategy,
        events: &mut dyn EventSink,
        digest: ImageDigest,
        now_ms: u64,
    ) -> Result<(), UpgradeError> {
        match self.state {
            UpgradeState::AwaitingDescriptor => {}
            UpgradeState::Idle => return Err(UpgradeError::NotActive),
            _ => return Err(UpgradeError::InvalidState),
        }
        check_kind(strategy, Some(&digest))?;
        if let Err(e) = strategy.describe(self.expected_total, &digest) {
            return Err(self.fail(strategy, events, e));
        }
        self.digest = Some(digest);
        self.state = UpgradeState::Transferring;
        self.last_activity_ms = now_ms;
        Ok(())
    }

    /// Deliver one chunk. Returns the running byte count.
    pub fn chunk(
        &mut self,
        strategy: &mut impl TransferStrategy,
        events: &mut dyn EventSink,
        index: u32,
        data: &[u8],
        now_ms: u64,
    ) -> Result<u64, UpgradeError> {
        match self.state {
            UpgradeState::Transferring => {}
            UpgradeState::AwaitingDescriptor if !strategy.descriptor_required() => {
                self.state = UpgradeState::Transferring;
            }
            UpgradeState::AwaitingDescriptor => return Err(UpgradeError::DescriptorRequired),
            UpgradeState::Idle => return Err(UpgradeError::NotActive),
            _ => return Err(UpgradeError::InvalidState),
        }
        if self.transferred + data.len() as u64 > self.expected_total {
            warn!(
                "UPGRADE[{}]: chunk {} overflows ({} + {} > {})",
                self.target,
                index,
                self.transferred,
                data.len(),
                self.expected_total
            );
            return Err(UpgradeError::Overflow);
        }

        match strategy.transfer(index, data) {
            Ok(n) => {
                self.transferred += n;
                self.chunks_received += 1;
                self.last_activity_ms = now_ms;
            }
            Err(e) => return Err(self.fail(strategy, events, e)),
        }

        let percent = self.progress_percent();
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            events.emit(&StackEvent::UpgradeProgress {
                target: self.target,
                percent,
            });
        }
        Ok(self.transferred)
    }

    /// Check size and digest of the delivered image.
    ///
    /// Any mismatch aborts the session and discards the staged image.
    pub fn finish(
        &mut self,
        strategy: &mut impl TransferStrategy,
        events: &mut dyn EventSink,
        digest: Option<ImageDigest>,
        now_ms: u64,
    ) -> Result<(), UpgradeError> {
        match self.state {
            UpgradeState::Transferring | UpgradeState::AwaitingDescriptor => {}
            UpgradeState::Idle => return Err(UpgradeError::NotActive),
            _ => return Err(UpgradeError::InvalidState),
        }
        check_kind(strategy, digest.as_ref())?;
        let Some(expected) = digest.or(self.digest) else {
            return Err(UpgradeError::MissingDigest);
        };
        if self.transferred != self.expected_total {
            let e = IntegrityError::SizeMismatch {
                expected: self.expected_total,
                actual: self.transferred,
            };
            return Err(self.fail(strategy, events, e.into()));
        }

        self.state = UpgradeState::Finishing;
        if let Err(e) = strategy.complete() {
            return Err(self.fail(strategy, events, e));
        }

        self.state = UpgradeState::Verifying;
        let actual = match strategy.content_digest() {
            Ok(d) => d,
            Err(e) => return Err(self.fail(strategy, events, e)),
        };
        if actual != expected {
            return Err(self.fail(strategy, events, IntegrityError::DigestMismatch.into()));
        }
        self.digest = Some(expected);
        self.last_activity_ms = now_ms;
        info!("UPGRADE[{}]: verified {} bytes", self.target, self.transferred);
        Ok(())
    }

    /// Apply a verified image. A failure here is reported, not rolled back.
    pub fn install(
        &mut self,
        strategy: &mut impl TransferStrategy,
        events: &mut dyn EventSink,
    ) -> Result<(), UpgradeError> {
        match self.state {
            UpgradeState::Verifying => {}
            UpgradeState::Idle => return Err(UpgradeError::NotActive),
            _ => return Err(UpgradeError::InvalidState),
        }
        self.state = UpgradeState::Installing;
        let outcome = strategy.install();
        self.state = UpgradeState::Idle;
        match outcome {
            Ok(()) => {
                info!("UPGRADE[{}]: installed", self.target);
                events.emit(&StackEvent::UpgradeInstalled {
                    target: self.target,
                });
                Ok(())
            }
            Err(e) => {
                warn!("UPGRADE[{}]: install failed: {}", self.target, e);
                events.emit(&StackEvent::UpgradeFailed {
                    target: self.target,
                    error: UpgradeError::InstallFailed,
                });
                Err(UpgradeError::InstallFailed)
            }
        }
    }

    /// Idle watchdog. Returns `true` when the session was abandoned.
    pub fn tick(
        &mut self,
        strategy: &mut impl TransferStrategy,
        events: &mut dyn EventSink,
        now_ms: u64,
    ) -> bool {
        if !self.idle_expired(now_ms) {
            return false;
        }
        self.interrupt(strategy, events);
        true
    }

    /// Abandon the session without an idle timeout (host stop, link loss).
    pub fn abort(&mut self, strategy: &mut impl TransferStrategy, events: &mut dyn EventSink) {
        if self.is_active() {
            self.interrupt(strategy, events);
        }
    }

    fn interrupt(&mut self, strategy: &mut impl TransferStrategy, events: &mut dyn EventSink) {
        warn!(
            "UPGRADE[{}]: interrupted in {:?} at {}/{} bytes",
            self.target, self.state, self.transferred, self.expected_total
        );
        strategy.discard();
        self.reset();
        events.emit(&StackEvent::UpgradeInterrupted {
            target: self.target,
        });
    }

    fn fail(
        &mut self,
        strategy: &mut impl TransferStrategy,
        events: &mut dyn EventSink,
        error: UpgradeError,
    ) -> UpgradeError {
        if error == UpgradeError::IdleTimeout {
            self.interrupt(strategy, events);
            return error;
        }
        warn!("UPGRADE[{}]: failed in {:?}: {}", self.target, self.state, error);
        strategy.discard();
        self.reset();
        events.emit(&StackEvent::UpgradeFailed {
            target: self.target,
            error,
        });
        error
    }

    fn reset(&mut self) {
        self.state = UpgradeState::Idle;
        self.expected_total = 0;
        self.expected_chunks = None;
        self.transferred = 0;
        self.chunks_received = 0;
        self.digest = None;
        self.last_percent = None;
    }
}

fn check_kind(
    strategy: &impl TransferStrategy,
    digest: Option<&ImageDigest>,
) -> Result<(), UpgradeError> {
    match digest {
        Some(d) if d.kind() != strategy.digest_kind() => Err(UpgradeError::DigestKind),
        _ => Ok(()),
    }
}

// ── Storage strategy ─────────────────────────────────────────

/// Where a storage upload stages and how it installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    /// File the chunks are appended to.
    pub staging_path: String,
    /// Directory the archive is unpacked into before installing.
    pub unpack_dir: String,
    /// Installer script location.
    pub script_path: String,
    /// Installer script body.
    pub script: String,
    /// Reboot delay after a successful install; `None` for no reboot.
    pub reboot_after_secs: Option<u32>,
}

/// Appends free-form chunks to a staging file through the storage port.
pub struct StorageUpload<'a> {
    storage: &'a mut dyn StoragePort,
    os: &'a mut dyn OsPort,
    layout: &'a StagingLayout,
}

impl<'a> StorageUpload<'a> {
    pub fn new(
        storage: &'a mut dyn StoragePort,
        os: &'a mut dyn OsPort,
        layout: &'a StagingLayout,
    ) -> Self {
        Self {
            storage,
            os,
            layout,
        }
    }
}

impl TransferStrategy for StorageUpload<'_> {
    fn begin(&mut self, _total: u64) -> Result<(), UpgradeError> {
        self.storage
            .remove(&self.layout.staging_path)
            .map_err(|e| {
                warn!("UPGRADE: clear {} failed: {}", self.layout.staging_path, e);
                UpgradeError::Storage
            })
    }

    fn digest_kind(&self) -> DigestKind {
        DigestKind::Md5
    }

    fn transfer(&mut self, _index: u32, data: &[u8]) -> Result<u64, UpgradeError> {
        self.storage
            .append(&self.layout.staging_path, data)
            .map_err(|e| {
                warn!("UPGRADE: append to {} failed: {}", self.layout.staging_path, e);
                UpgradeError::Storage
            })?;
        Ok(data.len() as u64)
    }

    fn content_digest(&mut self) -> Result<ImageDigest, UpgradeError> {
        self.storage
            .digest(&self.layout.staging_path)
            .map(ImageDigest::Md5)
            .map_err(|_| UpgradeError::Storage)
    }

    fn install(&mut self) -> Result<(), UpgradeError> {
        let layout = self.layout;
        self.os
            .unpack(&layout.staging_path, &layout.unpack_dir)
            .and_then(|()| self.os.run_installer(&layout.script_path, &layout.script))
            .map_err(|e| {
                warn!("UPGRADE: installer failed: {}", e);
                UpgradeError::InstallFailed
            })?;
        if let Some(delay) = layout.reboot_after_secs {
            self.os.reboot(delay);
        }
        Ok(())
    }

    fn discard(&mut self) {
        if let Err(e) = self.storage.remove(&self.layout.staging_path) {
            warn!("UPGRADE: discard {} failed: {}", self.layout.staging_path, e);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
