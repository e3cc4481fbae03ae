//! Transport abstraction: any byte-oriented channel.
//!
//! Concrete implementations:
//! - RS-485 / sub-controller serial lines (`adapters::serial`)
//! - TCP upstream socket (`adapters::tcp`)
//! - In-memory loopback for tests
//!
//! HTTP is not a stream; request bodies enter through [`super::http`].

use core::fmt;
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

/// Which physical channel a packet came from or goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportId {
    Rs485,
    Tcp,
    Http,
    SubController,
}

impl TransportId {
    pub const ALL: [Self; 4] = [Self::Rs485, Self::Tcp, Self::Http, Self::SubController];

    pub fn index(self) -> usize {
        match self {
            Self::Rs485 => 0,
            Self::Tcp => 1,
            Self::Http => 2,
            Self::SubController => 3,
        }
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rs485 => write!(f, "485"),
            Self::Tcp => write!(f, "tcp"),
            Self::Http => write!(f, "http"),
            Self::SubController => write!(f, "subctl"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The peer went away; the reader should reconnect or stop.
    Disconnected,
    Io,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}

/// Byte-oriented transport channel.
pub trait Transport {
    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    /// Returns 0 when nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Write all of `data`.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Flush any buffered output.
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Read a single byte, `None` on timeout.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        let mut b = [0u8; 1];
        match self.read(&mut b, timeout)? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read(buf, timeout)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(data)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush()
    }
}

/// A null transport that discards all writes and never reads.
/// Stands in for a transport that is not configured.
pub struct NullTransport;

impl Transport for NullTransport {
    fn read(&mut self, _buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        std::thread::sleep(timeout);
        Ok(0)
    }

    fn write_all(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

// ── Loopback ─────────────────────────────────────────────────

#[derive(Default)]
struct Pipe {
    bytes: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

impl Pipe {
    fn push(&self, data: &[u8]) {
        let mut q = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        q.extend(data.iter().copied());
        drop(q);
        self.ready.notify_all();
    }

    fn pop(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut q = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        while q.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            q = self
                .ready
                .wait_timeout(q, deadline - now)
                .map(|(g, _)| g)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        let n = buf.len().min(q.len());
        for (slot, byte) in buf.iter_mut().zip(q.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

/// One end of an in-memory duplex byte pipe. Clones share the same end,
/// so a reader thread and a writer can each hold one.
#[derive(Clone)]
pub struct LoopbackTransport {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
}

impl LoopbackTransport {
    /// Two connected ends: bytes written to one are read from the other.
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Pipe::default());
        let b = Arc::new(Pipe::default());
        (
            Self {
                rx: Arc::clone(&a),
                tx: Arc::clone(&b),
            },
            Self { rx: b, tx: a },
        )
    }
}

impl Transport for LoopbackTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        Ok(self.rx.pop(buf, timeout))
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.tx.push(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
