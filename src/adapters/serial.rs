//! Serial transport for the RS-485 bus and the sub-controller UART.
//!
//! 8N1 at the configured baud rate. The port is opened with a short
//! timeout; [`Transport::read`] adjusts it per call so the reader thread
//! can poll for shutdown and frame expiry.

use core::time::Duration;
use std::io::{ErrorKind, Read, Write};

use log::{info, warn};
use serialport::SerialPort;

use crate::proto::transport::{Transport, TransportError};

const OPEN_TIMEOUT: Duration = Duration::from_millis(100);

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

impl SerialTransport {
    pub fn open(device: &str, baud_rate: u32) -> anyhow::Result<Self> {
        let port = serialport::new(device, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(OPEN_TIMEOUT)
            .open()
            .map_err(|e| anyhow::anyhow!("failed to open serial port {}: {}", device, e))?;
        info!("SERIAL: {} open at {} baud", device, baud_rate);
        Ok(Self {
            port,
            timeout: OPEN_TIMEOUT,
        })
    }

    /// Second handle on the same port, for a writer separate from the reader.
    pub fn try_clone(&self) -> anyhow::Result<Self> {
        let port = self
            .port
            .try_clone()
            .map_err(|e| anyhow::anyhow!("failed to clone serial port: {}", e))?;
        Ok(Self {
            port,
            timeout: self.timeout,
        })
    }
}

fn map_io(e: &std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof => {
            TransportError::Disconnected
        }
        _ => {
            warn!("SERIAL: {}", e);
            TransportError::Io
        }
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if timeout != self.timeout {
            self.port.set_timeout(timeout).map_err(|_| TransportError::Io)?;
            self.timeout = timeout;
        }
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(0)
            }
            Err(e) => Err(map_io(&e)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(data).map_err(|e| map_io(&e))
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.port.flush().map_err(|e| map_io(&e))
    }
}
