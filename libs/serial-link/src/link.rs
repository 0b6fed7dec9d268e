use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};

use crate::LinkError;

/// A byte channel to one console. Implemented by [`SerialEndpoint`] for real
/// hardware and by the scripted fakes for tests.
pub trait Link {
    /// Channel name used in logs and errors ("soc", "mcu", "hsm").
    fn name(&self) -> &str;

    fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError>;

    fn flush(&mut self) -> Result<(), LinkError>;

    /// Read and return whatever is already pending, without blocking.
    fn read_avail(&mut self) -> Result<Vec<u8>, LinkError>;

    /// Block up to `timeout` for a single byte. `Ok(None)` on timeout.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, LinkError>;

    fn clear_input(&mut self) -> Result<(), LinkError>;

    /// The endpoint's configured read timeout, used as the default deadline
    /// for passive waits.
    fn read_timeout(&self) -> Duration;
}

/// A live serial port. Opened on construction, closed on drop; the port
/// stays open across the whole provisioning flow.
pub struct SerialEndpoint {
    name: String,
    port: Box<dyn SerialPort>,
    read_timeout: Duration,
}

impl SerialEndpoint {
    pub fn open(name: &str, path: &Path, baud: u32, read_timeout: Duration) -> Result<Self, LinkError> {
        let port = serialport::new(path.to_string_lossy(), baud)
            .timeout(read_timeout)
            .open()
            .map_err(|source| LinkError::Open { path: path.to_owned(), source })?;
        log::info!("opened {} console at {} ({} baud)", name, path.display(), baud);
        Ok(SerialEndpoint { name: name.to_string(), port, read_timeout })
    }

    fn io_err(&self, source: std::io::Error) -> LinkError {
        LinkError::Io { port: self.name.clone(), source }
    }
}

impl Link for SerialEndpoint {
    fn name(&self) -> &str { &self.name }

    fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.port.write_all(data).map_err(|e| LinkError::Io { port: self.name.clone(), source: e })
    }

    fn flush(&mut self) -> Result<(), LinkError> {
        self.port.flush().map_err(|e| LinkError::Io { port: self.name.clone(), source: e })
    }

    fn read_avail(&mut self) -> Result<Vec<u8>, LinkError> {
        let pending = self
            .port
            .bytes_to_read()
            .map_err(|e| LinkError::Io { port: self.name.clone(), source: e.into() })?;
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; pending as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(self.io_err(e)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, LinkError> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| LinkError::Io { port: self.name.clone(), source: e.into() })?;
        let mut byte = [0u8; 1];
        let result = match self.port.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(LinkError::Io { port: self.name.clone(), source: e }),
        };
        // restore the endpoint default so later passive waits are unaffected
        self.port
            .set_timeout(self.read_timeout)
            .map_err(|e| LinkError::Io { port: self.name.clone(), source: e.into() })?;
        result
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| LinkError::Io { port: self.name.clone(), source: e.into() })
    }

    fn read_timeout(&self) -> Duration { self.read_timeout }
}
