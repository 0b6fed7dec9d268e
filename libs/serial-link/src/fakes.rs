//! Scripted in-memory [`Link`]s for protocol tests. No wall clock, no
//! hardware: reads pop pre-queued chunks, and an optional reactor turns
//! writes into queued responses so a test can play the device side of a
//! handshake.

use std::collections::VecDeque;
use std::time::Duration;

use crate::{Link, LinkError};

type RawReactor = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;
type LineReactor = Box<dyn FnMut(&str) -> Vec<Vec<u8>> + Send>;

enum Reactor {
    None,
    /// Called once per write with the raw bytes.
    Raw(RawReactor),
    /// Called once per completed line (newline-terminated, CR stripped).
    /// Suits the paced shell discipline, which emits one byte per write.
    Line(LineReactor),
}

pub struct ScriptedLink {
    name: String,
    /// Noise that predates the next command; dropped by `clear_input`.
    stale: Vec<u8>,
    /// Queued response chunks, one per `read_avail` call. Deliberately not
    /// cleared by `clear_input`: they model output that arrives after the
    /// command goes out.
    pending: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    line_buf: Vec<u8>,
    reactor: Reactor,
    read_timeout: Duration,
}

impl ScriptedLink {
    pub fn new(name: &str) -> Self {
        ScriptedLink {
            name: name.to_string(),
            stale: Vec::new(),
            pending: VecDeque::new(),
            written: Vec::new(),
            line_buf: Vec::new(),
            reactor: Reactor::None,
            read_timeout: Duration::from_millis(50),
        }
    }

    pub fn with_line_reactor(name: &str, reactor: LineReactor) -> Self {
        let mut link = ScriptedLink::new(name);
        link.reactor = Reactor::Line(reactor);
        link
    }

    pub fn with_raw_reactor(name: &str, reactor: RawReactor) -> Self {
        let mut link = ScriptedLink::new(name);
        link.reactor = Reactor::Raw(reactor);
        link
    }

    /// Queue one chunk, returned by one future `read_avail`.
    pub fn respond_once(&mut self, chunk: &[u8]) { self.pending.push_back(chunk.to_vec()); }

    /// Pre-command noise, visible until `clear_input`.
    pub fn push_stale(&mut self, bytes: &[u8]) { self.stale.extend_from_slice(bytes); }

    /// Everything the code under test wrote, in order.
    pub fn written(&self) -> &[u8] { &self.written }

    pub fn written_text(&self) -> String { String::from_utf8_lossy(&self.written).into_owned() }

    pub fn set_read_timeout(&mut self, t: Duration) { self.read_timeout = t; }

    fn react(&mut self, data: &[u8]) {
        match &mut self.reactor {
            Reactor::None => {}
            Reactor::Raw(f) => {
                for chunk in f(data) {
                    self.pending.push_back(chunk);
                }
            }
            Reactor::Line(f) => {
                self.line_buf.extend_from_slice(data);
                while let Some(pos) = self.line_buf.iter().position(|&b| b == b'\n') {
                    let mut line: Vec<u8> = self.line_buf.drain(..=pos).collect();
                    line.pop(); // the newline
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let line = String::from_utf8_lossy(&line).into_owned();
                    for chunk in f(&line) {
                        self.pending.push_back(chunk);
                    }
                }
            }
        }
    }
}

impl Link for ScriptedLink {
    fn name(&self) -> &str { &self.name }

    fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.written.extend_from_slice(data);
        self.react(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LinkError> { Ok(()) }

    fn read_avail(&mut self) -> Result<Vec<u8>, LinkError> {
        if !self.stale.is_empty() {
            return Ok(std::mem::take(&mut self.stale));
        }
        Ok(self.pending.pop_front().unwrap_or_default())
    }

    fn read_byte(&mut self, _timeout: Duration) -> Result<Option<u8>, LinkError> {
        if !self.stale.is_empty() {
            let byte = self.stale.remove(0);
            return Ok(Some(byte));
        }
        match self.pending.front_mut() {
            Some(chunk) if !chunk.is_empty() => {
                let byte = chunk.remove(0);
                if chunk.is_empty() {
                    self.pending.pop_front();
                }
                Ok(Some(byte))
            }
            Some(_) => {
                self.pending.pop_front();
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        self.stale.clear();
        Ok(())
    }

    fn read_timeout(&self) -> Duration { self.read_timeout }
}
