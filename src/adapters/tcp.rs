//! TCP transport for the upstream socket.
//!
//! The terminal dials out to a configured host and speaks the same framed
//! protocol as on RS-485. A dropped connection surfaces as
//! [`TransportError::Disconnected`] and the link is taken down.

use core::time::Duration;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

use log::{info, warn};

use crate::proto::transport::{Transport, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpTransport {
    stream: TcpStream,
    timeout: Option<Duration>,
}

impl TcpTransport {
    /// Dial `addr` (`host:port`).
    pub fn connect(addr: &str) -> anyhow::Result<Self> {
        use std::net::ToSocketAddrs;
        let target = addr
            .to_socket_addrs()
            .map_err(|e| anyhow::anyhow!("cannot resolve {}: {}", addr, e))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("no address for {}", addr))?;
        let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)
            .map_err(|e| anyhow::anyhow!("cannot connect to {}: {}", addr, e))?;
        let _ = stream.set_nodelay(true);
        info!("TCP: connected to {}", target);
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            timeout: None,
        }
    }

    pub fn try_clone(&self) -> anyhow::Result<Self> {
        let stream = self
            .stream
            .try_clone()
            .map_err(|e| anyhow::anyhow!("failed to clone TCP stream: {}", e))?;
        Ok(Self::from_stream(stream))
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        // A zero read timeout means "block forever" to the socket API.
        let timeout = Some(timeout.max(Duration::from_millis(1)));
        if timeout != self.timeout {
            self.stream
                .set_read_timeout(timeout)
                .map_err(|_| TransportError::Io)?;
            self.timeout = timeout;
        }
        match self.stream.read(buf) {
            Ok(0) => {
                info!("TCP: peer closed");
                Err(TransportError::Disconnected)
            }
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                warn!("TCP: read failed: {}", e);
                Err(TransportError::Disconnected)
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data).map_err(|e| {
            warn!("TCP: write failed: {}", e);
            TransportError::Disconnected
        })
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.stream.flush().map_err(|_| TransportError::Io)
    }
}
