//! Unified error types for the control-channel stack.
//!
//! A single `Error` enum that every subsystem converts into, so the
//! dispatch loop handles failures uniformly. None of these are fatal:
//! every path returns control to the loop. All variants are `Copy` so
//! they can be logged and passed around without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level stack error
// ---------------------------------------------------------------------------

/// Every fallible protocol operation funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A frame could not be decoded or encoded.
    Frame(FrameError),
    /// A decoded packet was rejected by the dispatcher.
    Dispatch(DispatchError),
    /// A synchronous bridge request did not complete.
    Sync(SyncError),
    /// A firmware or resource transfer failed.
    Upgrade(UpgradeError),
    /// Stack configuration is invalid.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "frame: {e}"),
            Self::Dispatch(e) => write!(f, "dispatch: {e}"),
            Self::Sync(e) => write!(f, "sync: {e}"),
            Self::Upgrade(e) => write!(f, "upgrade: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Framing errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Leading bytes were not the `55 AA` sync sequence.
    Framing,
    /// The trailing BCC did not match the frame contents.
    Checksum { command: u8, expected: u8, actual: u8 },
    /// The buffer ended before the frame did.
    Incomplete,
    /// Payload does not fit the 16-bit length field.
    PayloadTooLarge(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Framing => write!(f, "bad sync bytes"),
            Self::Checksum {
                command,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch on cmd 0x{command:02x} (expected 0x{expected:02x}, got 0x{actual:02x})"
            ),
            Self::Incomplete => write!(f, "incomplete frame"),
            Self::PayloadTooLarge(len) => write!(f, "payload of {len} bytes exceeds 65535"),
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

// ---------------------------------------------------------------------------
// Dispatch errors
// ---------------------------------------------------------------------------

/// Errors raised while handling a decoded packet. Both variants are
/// answered on the wire with result `0x90`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// Command code is not in the table.
    UnknownCommand(u8),
    /// Payload length or shape is wrong for the command.
    InvalidPayload(&'static str),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand(code) => write!(f, "unknown command 0x{code:02x}"),
            Self::InvalidPayload(why) => write!(f, "invalid payload: {why}"),
        }
    }
}

impl From<DispatchError> for Error {
    fn from(e: DispatchError) -> Self {
        Self::Dispatch(e)
    }
}

// ---------------------------------------------------------------------------
// Sync bridge errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// No response arrived before the deadline.
    Timeout,
    /// A newer request for the same key replaced this one.
    Superseded,
    /// The dispatcher queue is full.
    Busy,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for response"),
            Self::Superseded => write!(f, "request replaced by a newer one"),
            Self::Busy => write!(f, "dispatcher queue full"),
        }
    }
}

impl From<SyncError> for Error {
    fn from(e: SyncError) -> Self {
        Self::Sync(e)
    }
}

// ---------------------------------------------------------------------------
// Upgrade errors
// ---------------------------------------------------------------------------

/// Digest or size check failure after the last chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityError {
    /// Delivered byte count differs from the declared total.
    SizeMismatch { expected: u64, actual: u64 },
    /// Content hash differs from the supplied digest.
    DigestMismatch,
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch (expected {expected}, got {actual})")
            }
            Self::DigestMismatch => write!(f, "digest mismatch"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeError {
    /// A session for this target is still running.
    AlreadyActive,
    /// The operation needs an active session.
    NotActive,
    /// The operation is not valid in the current state.
    InvalidState,
    /// Declared total size is zero or beyond the limit.
    InvalidSize,
    /// A chunk would exceed the declared total size.
    Overflow,
    /// The strategy needs a descriptor before chunks are accepted.
    DescriptorRequired,
    /// No digest was supplied at start or finish.
    MissingDigest,
    /// The digest is not the algorithm this transfer verifies with.
    DigestKind,
    /// Size or digest check failed.
    Integrity(IntegrityError),
    /// No forward progress within the idle window.
    IdleTimeout,
    /// The sub-controller answered a step with a non-zero status.
    Rejected { step: u8, status: u8 },
    /// Writing to the sub-controller link failed.
    Link,
    /// Staging storage could not be written or read.
    Storage,
    /// The verified image could not be installed. Not rolled back.
    InstallFailed,
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive => write!(f, "upgrade session already active"),
            Self::NotActive => write!(f, "no active upgrade session"),
            Self::InvalidState => write!(f, "operation not valid in current upgrade state"),
            Self::InvalidSize => write!(f, "image size out of range"),
            Self::Overflow => write!(f, "chunk exceeds declared image size"),
            Self::DescriptorRequired => write!(f, "descriptor must precede chunks"),
            Self::MissingDigest => write!(f, "no digest to verify against"),
            Self::DigestKind => write!(f, "digest algorithm does not match the transfer"),
            Self::Integrity(e) => write!(f, "integrity check failed: {e}"),
            Self::IdleTimeout => write!(f, "upgrade idle timeout"),
            Self::Rejected { step, status } => {
                write!(f, "sub-controller rejected step {step} (status 0x{status:02x})")
            }
            Self::Link => write!(f, "sub-controller link write failed"),
            Self::Storage => write!(f, "staging storage error"),
            Self::InstallFailed => write!(f, "install failed"),
        }
    }
}

impl From<IntegrityError> for UpgradeError {
    fn from(e: IntegrityError) -> Self {
        Self::Integrity(e)
    }
}

impl From<UpgradeError> for Error {
    fn from(e: UpgradeError) -> Self {
        Self::Upgrade(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Stack-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
