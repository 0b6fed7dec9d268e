//! The three relay backends.
//!
//! `HttpRelay` speaks the vendor's CGI toggle API and decodes the returned
//! 16-bit status word. `ModbusRelay` is a proper Modbus-TCP client (MBAP
//! framing, coil read-back). `RawModbusRelay` fires the fixed write-coil
//! frame some relay boards want and only checks that *a* response came back;
//! that hardware answers garbage but switches correctly.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use crate::RelayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    On,
    Off,
}

pub trait RelayBackend {
    fn name(&self) -> &'static str;

    /// Current state of `port`, or `None` if this backend cannot read back.
    fn port_state(&mut self, port: u8) -> Result<Option<PortState>, RelayError>;

    fn set_port(&mut self, port: u8, state: PortState) -> Result<(), RelayError>;
}

// ---------------------------------------------------------------- http

pub struct HttpRelay {
    server: String,
    agent: ureq::Agent,
}

/// First comma-separated field of the CGI body is a 16-bit word; bit n is
/// port n+1, 0 = ON, 1 = OFF.
pub fn parse_status_word(body: &str) -> Result<u16, RelayError> {
    body.split(',')
        .next()
        .and_then(|field| field.trim().parse::<u16>().ok())
        .ok_or_else(|| RelayError::BadStatus(body.to_string()))
}

pub fn port_state_from_word(word: u16, port: u8) -> PortState {
    if (word >> (port - 1)) & 1 == 0 { PortState::On } else { PortState::Off }
}

impl HttpRelay {
    pub fn new(server: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(3))
            .timeout(Duration::from_secs(5))
            .build();
        HttpRelay { server: server.to_string(), agent }
    }

    /// `UWHEXVAL=0` reads status; any other value toggles that port. Either
    /// way the reply carries the (post-action) status word.
    fn port_ctrl(&self, port: u8) -> Result<u16, RelayError> {
        let url = format!(
            "http://{}/CN/httpapi.json?sndtime={}&CMD=UART_WRITE&UWHEXVAL={}",
            self.server,
            rand::random::<f64>(),
            port
        );
        let body = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| RelayError::Transport(e.to_string()))?
            .into_string()
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        parse_status_word(&body)
    }
}

impl RelayBackend for HttpRelay {
    fn name(&self) -> &'static str { "http" }

    fn port_state(&mut self, port: u8) -> Result<Option<PortState>, RelayError> {
        Ok(Some(port_state_from_word(self.port_ctrl(0)?, port)))
    }

    fn set_port(&mut self, port: u8, state: PortState) -> Result<(), RelayError> {
        // the API is a toggle, so read back and verify
        let word = self.port_ctrl(port)?;
        if port_state_from_word(word, port) == state {
            Ok(())
        } else {
            Err(RelayError::Verify { port, want: state })
        }
    }
}

// ---------------------------------------------------------------- modbus

const MODBUS_LIB_PORT: u16 = 1030;
const MODBUS_RAW_PORT: u16 = 502;
const MODBUS_TIMEOUT: Duration = Duration::from_secs(5);

const FC_READ_COILS: u8 = 0x01;
const FC_WRITE_COIL: u8 = 0x05;

/// MBAP header + PDU for a single-coil function.
pub fn mbap_frame(tid: u16, function: u8, addr: u16, value: u16) -> [u8; 12] {
    let mut frame = [0u8; 12];
    BigEndian::write_u16(&mut frame[0..2], tid);
    // protocol id 0, length 6 (unit + pdu)
    BigEndian::write_u16(&mut frame[4..6], 6);
    frame[6] = 0x01; // unit id
    frame[7] = function;
    BigEndian::write_u16(&mut frame[8..10], addr);
    BigEndian::write_u16(&mut frame[10..12], value);
    frame
}

fn connect(server: &str, default_port: u16) -> Result<TcpStream, RelayError> {
    let addr = if server.contains(':') { server.to_string() } else { format!("{}:{}", server, default_port) };
    let stream = TcpStream::connect(&addr).map_err(|e| RelayError::Transport(format!("{}: {}", addr, e)))?;
    stream.set_read_timeout(Some(MODBUS_TIMEOUT)).map_err(|e| RelayError::Transport(e.to_string()))?;
    stream.set_write_timeout(Some(MODBUS_TIMEOUT)).map_err(|e| RelayError::Transport(e.to_string()))?;
    Ok(stream)
}

pub struct ModbusRelay {
    server: String,
    stream: Option<TcpStream>,
    tid: u16,
}

impl ModbusRelay {
    pub fn new(server: &str) -> Self { ModbusRelay { server: server.to_string(), stream: None, tid: 0 } }

    fn stream(&mut self) -> Result<&mut TcpStream, RelayError> {
        if self.stream.is_none() {
            self.stream = Some(connect(&self.server, MODBUS_LIB_PORT)?);
        }
        Ok(self.stream.as_mut().unwrap())
    }

    fn transact(&mut self, function: u8, addr: u16, value: u16) -> Result<Vec<u8>, RelayError> {
        self.tid = self.tid.wrapping_add(1);
        let frame = mbap_frame(self.tid, function, addr, value);
        let stream = self.stream()?;
        stream.write_all(&frame).map_err(|e| RelayError::Transport(e.to_string()))?;

        let mut header = [0u8; 7];
        stream.read_exact(&mut header).map_err(|e| RelayError::Transport(e.to_string()))?;
        let len = BigEndian::read_u16(&header[4..6]) as usize;
        if len < 2 || len > 256 {
            return Err(RelayError::BadStatus(format!("mbap length {}", len)));
        }
        let mut pdu = vec![0u8; len - 1];
        stream.read_exact(&mut pdu).map_err(|e| RelayError::Transport(e.to_string()))?;
        if pdu[0] & 0x80 != 0 {
            return Err(RelayError::BadStatus(format!("modbus exception {:#04x}", pdu.get(1).unwrap_or(&0))));
        }
        Ok(pdu)
    }

    fn read_coil(&mut self, addr: u16) -> Result<bool, RelayError> {
        let pdu = self.transact(FC_READ_COILS, addr, 1)?;
        // fc, byte count, coil bits
        let bits = *pdu.get(2).ok_or_else(|| RelayError::BadStatus("short read-coils reply".into()))?;
        Ok(bits & 1 != 0)
    }
}

impl RelayBackend for ModbusRelay {
    fn name(&self) -> &'static str { "modbus" }

    fn port_state(&mut self, port: u8) -> Result<Option<PortState>, RelayError> {
        // coil set (true) means the relay has cut the port
        let coil = self.read_coil(u16::from(port) - 1)?;
        Ok(Some(if coil { PortState::Off } else { PortState::On }))
    }

    fn set_port(&mut self, port: u8, state: PortState) -> Result<(), RelayError> {
        let value = match state {
            PortState::On => 0x0000,
            PortState::Off => 0xFF00,
        };
        self.transact(FC_WRITE_COIL, u16::from(port) - 1, value)?;
        Ok(())
    }
}

// ---------------------------------------------------------------- raw

pub struct RawModbusRelay {
    server: String,
}

/// The fixed fire-and-forget frame: write-coil, unit 1, `FF00` = ON.
pub fn raw_frame(port: u8, state: PortState) -> [u8; 12] {
    mbap_frame(0, FC_WRITE_COIL, u16::from(port) - 1, match state {
        PortState::On => 0xFF00,
        PortState::Off => 0x0000,
    })
}

impl RawModbusRelay {
    pub fn new(server: &str) -> Self { RawModbusRelay { server: server.to_string() } }
}

impl RelayBackend for RawModbusRelay {
    fn name(&self) -> &'static str { "raw-modbus" }

    fn port_state(&mut self, _port: u8) -> Result<Option<PortState>, RelayError> {
        // this hardware has no usable read-back
        Ok(None)
    }

    fn set_port(&mut self, port: u8, state: PortState) -> Result<(), RelayError> {
        let mut stream = connect(&self.server, MODBUS_RAW_PORT)?;
        let frame = raw_frame(port, state);
        stream.write_all(&frame).map_err(|e| RelayError::Transport(e.to_string()))?;
        log::debug!("raw-modbus sent {:02x?}", frame);

        // the board answers something unparseable; receiving anything at all
        // is the success criterion
        let mut reply = [0u8; 1024];
        let n = stream.read(&mut reply).map_err(|e| RelayError::Transport(e.to_string()))?;
        log::debug!("raw-modbus reply {:02x?}", &reply[..n]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_word_decoding() {
        // 0b0000_0000_0000_0101: ports 1 and 3 read OFF, everything else ON
        assert_eq!(parse_status_word("5,junk,junk").unwrap(), 5);
        assert_eq!(port_state_from_word(5, 1), PortState::Off);
        assert_eq!(port_state_from_word(5, 2), PortState::On);
        assert_eq!(port_state_from_word(5, 3), PortState::Off);
        assert_eq!(port_state_from_word(5, 16), PortState::On);
    }

    #[test]
    fn status_word_rejects_garbage() {
        assert!(parse_status_word("").is_err());
        assert!(parse_status_word("not-a-number,0").is_err());
    }

    #[test]
    fn raw_frame_bytes() {
        // port 1 -> coil 0, ON = FF00
        assert_eq!(raw_frame(1, PortState::On), [0, 0, 0, 0, 0, 6, 1, 5, 0, 0, 0xFF, 0]);
        // port 19 would be rejected upstream; port 16 -> coil 15
        assert_eq!(raw_frame(16, PortState::Off), [0, 0, 0, 0, 0, 6, 1, 5, 0, 15, 0, 0]);
    }

    #[test]
    fn mbap_read_coils_frame() {
        let frame = mbap_frame(7, FC_READ_COILS, 2, 1);
        assert_eq!(frame, [0, 7, 0, 0, 0, 6, 1, 1, 0, 2, 0, 1]);
    }
}
