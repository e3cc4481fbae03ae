//! Sub-controller link: image push and configuration query.
//!
//! Every step is a `0x60` packet (result byte `00`) whose body is
//! `03 01 00 <op> <args..> fe`. The sub-controller answers each step with
//! `03 01 80 <op> ?? <status>`; the dispatcher hands those replies to the
//! [`SyncBridge`] under `subctl.upgrade.<op>`.
//!
//! ```text
//!  worker                           sub-controller
//!  ──────                           ──────────────
//!  01 enter        ───────────────▶
//!                  ◀─────────────── 80 01 .. 00|03
//!  02 descriptor   ───────────────▶ (size LE u32, sha256)
//!                  ◀─────────────── 80 02 .. 00
//!  03 chunk × N    ───────────────▶ (512 bytes, last zero-padded)
//!                  ◀─────────────── 80 03 .. 00   (after every chunk)
//!  04 finish       ───────────────▶
//!                  ◀─────────────── 80 04 .. 00
//!  05 install      ───────────────▶
//!                  ◀─────────────── 80 05 .. 00
//! ```
//!
//! The worker runs on its own thread: the bridge must never be waited on
//! from the dispatcher context.

use core::time::Duration;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info, warn};

use super::codec::{self, RESULT_OK};
use super::command::Command;
use super::sync::SyncBridge;
use super::transport::Transport;
use super::upgrade::{DigestKind, ImageDigest, TransferStrategy, UpgradeSession};
use crate::app::events::UpgradeTarget;
use crate::app::ports::EventSink;
use crate::config::StackConfig;
use crate::error::{SyncError, UpgradeError};

/// Step codes carried in byte 3 of a step body.
pub mod op {
    pub const ENTER: u8 = 0x01;
    pub const DESCRIBE: u8 = 0x02;
    pub const DATA: u8 = 0x03;
    pub const FINISH: u8 = 0x04;
    pub const INSTALL: u8 = 0x05;
}

const STEP_HEAD: [u8; 3] = [0x03, 0x01, 0x00];
const REPLY_HEAD: [u8; 3] = [0x03, 0x01, 0x80];
const BODY_END: u8 = 0xfe;
/// Descriptor tag: 4-byte size plus 32-byte digest follow.
const DESCRIPTOR_TAG: u8 = 0x24;
/// Enter-mode status meaning "already in upgrade mode".
const STATUS_ALREADY_ENTERED: u8 = 0x03;

/// Bridge key for configuration TLV replies.
pub const CONFIG_REPLY_KEY: &str = "subctl.config";
/// Body of the configuration query.
const CONFIG_QUERY: [u8; 6] = [0x7e, 0x01, 0x00, 0x02, 0x00, 0xfe];

/// Bridge key the acknowledgement for step `op` is delivered under.
pub fn reply_key(op: u8) -> String {
    format!("subctl.upgrade.{}", op)
}

/// Encode one step as a complete `0x60` frame.
pub fn encode_step(op: u8, args: &[u8]) -> Result<Vec<u8>, UpgradeError> {
    let mut body = Vec::with_capacity(args.len() + 5);
    body.extend_from_slice(&STEP_HEAD);
    body.push(op);
    body.extend_from_slice(args);
    body.push(BODY_END);
    codec::encode(Command::SubControllerReply.into(), Some(RESULT_OK), &body)
        .map_err(|_| UpgradeError::InvalidSize)
}

/// `(op, status)` of an upgrade acknowledgement, `None` for anything else.
pub fn parse_reply(body: &[u8]) -> Option<(u8, u8)> {
    if body.len() < 6 || body[..3] != REPLY_HEAD {
        return None;
    }
    Some((body[3], body[5]))
}

/// Whether a `0x60` body is a configuration TLV reply.
pub fn is_config_reply(body: &[u8]) -> bool {
    parse_reply(body).is_none() && body.last() == Some(&BODY_END)
}

// ── Transfer strategy ────────────────────────────────────────

/// Pushes fixed-size chunks over the link, one acknowledged step at a time.
pub struct SubControllerTransfer<T: Transport> {
    link: T,
    bridge: Arc<SyncBridge>,
    chunk_size: usize,
    timeout: Duration,
    hasher: hmac_sha256::Hash,
}

impl<T: Transport> SubControllerTransfer<T> {
    pub fn new(link: T, bridge: Arc<SyncBridge>, chunk_size: usize, timeout: Duration) -> Self {
        Self {
            link,
            bridge,
            chunk_size,
            timeout,
            hasher: hmac_sha256::Hash::new(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Give the link back, e.g. to reuse it for a config query.
    pub fn into_link(self) -> T {
        self.link
    }

    /// Send one step and wait for its acknowledgement. Returns the status.
    fn exchange(&mut self, op: u8, args: &[u8]) -> Result<u8, UpgradeError> {
        let frame = encode_step(op, args)?;
        let ticket = self.bridge.register(&reply_key(op));
        self.link
            .write_all(&frame)
            .and_then(|()| self.link.flush())
            .map_err(|e| {
                warn!("SUBCTL: write of step {} failed: {}", op, e);
                UpgradeError::Link
            })?;
        let reply = ticket.wait(self.timeout).map_err(|e| {
            warn!("SUBCTL: step {} not acknowledged: {}", op, e);
            match e {
                SyncError::Timeout => UpgradeError::IdleTimeout,
                SyncError::Superseded | SyncError::Busy => UpgradeError::Link,
            }
        })?;
        match parse_reply(&reply) {
            Some((step, status)) if step == op => Ok(status),
            _ => Err(UpgradeError::Rejected {
                step: op,
                status: 0xff,
            }),
        }
    }

    fn step(&mut self, op: u8, args: &[u8]) -> Result<(), UpgradeError> {
        match self.exchange(op, args)? {
            RESULT_OK => Ok(()),
            status => Err(UpgradeError::Rejected { step: op, status }),
        }
    }
}

impl<T: Transport> TransferStrategy for SubControllerTransfer<T> {
    fn begin(&mut self, _total: u64) -> Result<(), UpgradeError> {
        self.hasher = hmac_sha256::Hash::new();
        match self.exchange(op::ENTER, &[0x00])? {
            RESULT_OK => Ok(()),
            STATUS_ALREADY_ENTERED => {
                debug!("SUBCTL: already in upgrade mode");
                Ok(())
            }
            status => Err(UpgradeError::Rejected {
                step: op::ENTER,
                status,
            }),
        }
    }

    fn digest_kind(&self) -> DigestKind {
        DigestKind::Sha256
    }

    fn descriptor_required(&self) -> bool {
        true
    }

    fn describe(&mut self, total: u64, digest: &ImageDigest) -> Result<(), UpgradeError> {
        let ImageDigest::Sha256(sha) = digest else {
            return Err(UpgradeError::DigestKind);
        };
        let size = u32::try_from(total).map_err(|_| UpgradeError::InvalidSize)?;
        let mut args = Vec::with_capacity(37);
        args.push(DESCRIPTOR_TAG);
        args.extend_from_slice(&size.to_le_bytes());
        args.extend_from_slice(sha);
        self.step(op::DESCRIBE, &args)
    }

    fn transfer(&mut self, index: u32, data: &[u8]) -> Result<u64, UpgradeError> {
        if data.is_empty() || data.len() > self.chunk_size {
            warn!("SUBCTL: chunk {} has {} bytes", index, data.len());
            return Err(UpgradeError::InvalidSize);
        }
        let mut args = Vec::with_capacity(self.chunk_size + 1);
        args.push(0x00);
        args.extend_from_slice(data);
        args.resize(self.chunk_size + 1, 0x00);
        self.step(op::DATA, &args)?;
        self.hasher.update(data);
        Ok(data.len() as u64)
    }

    fn complete(&mut self) -> Result<(), UpgradeError> {
        self.step(op::FINISH, &[0x00])
    }

    fn content_digest(&mut self) -> Result<ImageDigest, UpgradeError> {
        let hasher = core::mem::replace(&mut self.hasher, hmac_sha256::Hash::new());
        Ok(ImageDigest::Sha256(hasher.finalize()))
    }

    fn install(&mut self) -> Result<(), UpgradeError> {
        self.step(op::INSTALL, &[0x00])
    }

    fn discard(&mut self) {
        self.hasher = hmac_sha256::Hash::new();
        debug!("SUBCTL: transfer abandoned");
    }
}

// ── Driver ───────────────────────────────────────────────────

/// Push a whole image through an [`UpgradeSession`].
pub fn push_image<T: Transport>(
    session: &mut UpgradeSession,
    strategy: &mut SubControllerTransfer<T>,
    events: &mut dyn EventSink,
    image: &[u8],
    clock: &dyn Fn() -> u64,
) -> Result<(), UpgradeError> {
    let digest = DigestKind::Sha256.of(image);
    let chunk_size = strategy.chunk_size();
    let chunks = image.len().div_ceil(chunk_size) as u32;

    session.start(
        strategy,
        events,
        image.len() as u64,
        Some(digest),
        Some(chunks),
        clock(),
    )?;
    session.describe(strategy, events, digest, clock())?;
    for (index, chunk) in image.chunks(chunk_size).enumerate() {
        session.chunk(strategy, events, index as u32, chunk, clock())?;
    }
    session.finish(strategy, events, None, clock())?;
    session.install(strategy, events)
}

/// Run [`push_image`] on a dedicated worker thread.
pub fn spawn_upgrade<T>(
    link: T,
    bridge: Arc<SyncBridge>,
    config: &StackConfig,
    image: Vec<u8>,
    mut events: Box<dyn EventSink + Send>,
) -> std::io::Result<JoinHandle<Result<(), UpgradeError>>>
where
    T: Transport + Send + 'static,
{
    let mut session = UpgradeSession::new(
        UpgradeTarget::SubController,
        config.upgrade_idle_ms,
        config.max_image_size,
    );
    let mut strategy = SubControllerTransfer::new(
        link,
        bridge,
        config.subctl_chunk_size,
        Duration::from_millis(config.sync_timeout_ms),
    );
    std::thread::Builder::new()
        .name("subctl-upgrade".into())
        .spawn(move || {
            let start = std::time::Instant::now();
            let clock = move || start.elapsed().as_millis() as u64;
            info!("SUBCTL: pushing {} byte image", image.len());
            let outcome = push_image(&mut session, &mut strategy, events.as_mut(), &image, &clock);
            if let Err(e) = outcome {
                warn!("SUBCTL: upgrade failed: {}", e);
            }
            outcome
        })
}

/// Ask the sub-controller for its configuration TLV block.
pub fn query_config<T: Transport>(
    link: &mut T,
    bridge: &Arc<SyncBridge>,
    timeout: Duration,
) -> Result<Vec<u8>, SyncError> {
    let frame = codec::encode(
        Command::SubControllerReply.into(),
        Some(RESULT_OK),
        &CONFIG_QUERY,
    )
    .map_err(|_| SyncError::Timeout)?;
    let ticket = bridge.register(CONFIG_REPLY_KEY);
    if let Err(e) = link.write_all(&frame).and_then(|()| link.flush()) {
        warn!("SUBCTL: config query write failed: {}", e);
        return Err(SyncError::Timeout);
    }
    ticket.wait(timeout)
}

// ── Tests ────────────────────────────────────────────────────
