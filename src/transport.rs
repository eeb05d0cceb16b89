//! The serial byte-stream seam between devices and hardware.
//!
//! A [`SerialBackend`] enumerates and opens ports; each open port is a
//! [`SockTransport`]. The real backend drives `serial2`; the simulated one
//! lives in [`crate::dummy_sock`].

use log::info;
use serial2::SerialPort;
use std::{io, time::Duration};

/// How long a single read may block before reporting no data.
pub const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Failures at the serial seam.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The port could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        /// Port path
        path: String,
        /// Underlying cause
        source: io::Error,
    },
    /// The backend knows no such port.
    #[error("no such port: {0}")]
    NoSuchPort(String),
    /// The other end went away.
    #[error("port closed")]
    Closed,
    /// Any other I/O failure.
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One open serial connection to a sock.
pub trait SockTransport: Send {
    /// Read available bytes; a read timeout is `Ok(0)`, not an error.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError>;

    /// Write every byte of `data`.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Send an ASCII command terminated with CR LF.
    fn send_command(&mut self, command: &str) -> Result<(), TransportError> {
        self.write_all(format!("{}\r\n", command).as_bytes())
    }
}

/// Port enumeration and opening.
pub trait SerialBackend: Send + Sync {
    /// Names of the ports currently present.
    fn available_ports(&self) -> Result<Vec<String>, TransportError>;

    /// Open `path` at `baud_rate`.
    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SockTransport>, TransportError>;
}

/// A real serial port.
pub struct SerialTransport {
    port: SerialPort,
}

impl SockTransport for SerialTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(data)?;
        Ok(())
    }
}

/// The operating system's serial ports, via `serial2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Serial2Backend;

impl SerialBackend for Serial2Backend {
    fn available_ports(&self) -> Result<Vec<String>, TransportError> {
        Ok(SerialPort::available_ports()?
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect())
    }

    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SockTransport>, TransportError> {
        let open_err = |source| TransportError::Open {
            path: path.to_string(),
            source,
        };
        let mut port = SerialPort::open(path, baud_rate).map_err(open_err)?;
        port.set_read_timeout(READ_TIMEOUT).map_err(open_err)?;
        info!("Opened serial port {} at {} baud", path, baud_rate);
        Ok(Box::new(SerialTransport { port }))
    }
}


#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[test]
    fn commands_are_crlf_terminated() {
        let mock = MockTransport::new();
        let mut transport: Box<dyn SockTransport> = Box::new(mock.clone());
        transport.send_command("BT^START").unwrap();
        assert_eq!(mock.written(), "BT^START\r\n");
    }

    #[test]
    fn canned_reply_is_readable() {
        let mock = MockTransport::sock(5);
        let mut transport = mock.clone();
        transport.send_command("BTS6?").unwrap();
        let mut buf = [0u8; 64];
        let n = transport.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Register 6 value: 5\r\n");
    }

    #[test]
    fn backend_rejects_unknown_port() {
        let backend = MockBackend::new();
        backend.add("/dev/ttyUSB0", MockTransport::new());
        assert_eq!(backend.available_ports().unwrap(), vec!["/dev/ttyUSB0"]);
        assert!(matches!(
            backend.open("/dev/ttyUSB9", 9600),
            Err(TransportError::NoSuchPort(_))
        ));
    }
}
