//! Process-global named lock over a RESP key-value store.
//!
//! The relay hardware is shared between CI workers on different machines, so
//! a local mutex is not enough. The store contract is tiny: an atomic
//! `SET key token NX PX <ttl>` to take the lock, and an ownership-checked
//! delete to drop it. Any RESP server with key expiry satisfies it.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use crate::RelayError;

/// Every station agrees on this name; it is the relay fleet's lock, not one
/// board's.
pub const RELAY_LOCK_KEY: &str = "carizon_relay";

const DEFAULT_STORE_PORT: u16 = 6379;
const RETRY_SLEEP: Duration = Duration::from_millis(100);

enum Reply {
    Ok,
    Nil,
    Int(i64),
    Bulk(String),
    Error(String),
}

fn encode(args: &[&str]) -> Vec<u8> {
    let mut buf = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n{}\r\n", arg.len(), arg).as_bytes());
    }
    buf
}

fn read_reply(reader: &mut BufReader<TcpStream>) -> std::io::Result<Reply> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let line = line.trim_end();
    match line.chars().next() {
        Some('+') => Ok(Reply::Ok),
        Some(':') => Ok(Reply::Int(line[1..].parse().unwrap_or(0))),
        Some('-') => Ok(Reply::Error(line[1..].to_string())),
        Some('$') => {
            let len: i64 = line[1..].parse().unwrap_or(-1);
            if len < 0 {
                return Ok(Reply::Nil);
            }
            let mut payload = String::new();
            reader.read_line(&mut payload)?;
            Ok(Reply::Bulk(payload.trim_end().to_string()))
        }
        _ => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, format!("resp reply {:?}", line))),
    }
}

pub struct NetLock {
    addr: String,
    key: String,
}

impl NetLock {
    pub fn new(addr: &str) -> Self {
        let addr =
            if addr.contains(':') { addr.to_string() } else { format!("{}:{}", addr, DEFAULT_STORE_PORT) };
        NetLock { addr, key: RELAY_LOCK_KEY.to_string() }
    }

    #[cfg(test)]
    fn with_key(addr: &str, key: &str) -> Self {
        let mut lock = NetLock::new(addr);
        lock.key = key.to_string();
        lock
    }

    /// Take the lock, waiting up to `wait`. The store expires it after
    /// `ttl` even if we die holding it.
    pub fn acquire(&self, ttl: Duration, wait: Duration) -> Result<NetLockGuard, RelayError> {
        let stream = TcpStream::connect(&self.addr).map_err(RelayError::LockIo)?;
        stream.set_read_timeout(Some(Duration::from_secs(2))).map_err(RelayError::LockIo)?;
        let mut reader = BufReader::new(stream.try_clone().map_err(RelayError::LockIo)?);
        let mut stream = stream;

        let token = format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>());
        let ttl_ms = format!("{}", ttl.as_millis().max(1));
        let deadline = Instant::now() + wait;

        loop {
            stream
                .write_all(&encode(&["SET", &self.key, &token, "NX", "PX", &ttl_ms]))
                .map_err(RelayError::LockIo)?;
            match read_reply(&mut reader).map_err(RelayError::LockIo)? {
                Reply::Ok => {
                    log::debug!("acquired lock {:?}", self.key);
                    return Ok(NetLockGuard { stream, reader, key: self.key.clone(), token });
                }
                Reply::Nil => {
                    if Instant::now() >= deadline {
                        return Err(RelayError::LockContended { key: self.key.clone(), waited: wait });
                    }
                    thread::sleep(RETRY_SLEEP);
                }
                Reply::Error(e) => return Err(RelayError::BadStatus(e)),
                _ => {
                    return Err(RelayError::BadStatus(format!(
                        "unexpected reply to SET NX on {:?}",
                        self.key
                    )))
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct NetLockGuard {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    key: String,
    token: String,
}

impl NetLockGuard {
    /// GET-check then DEL. The pair is not atomic; the TTL bounds what a
    /// lost race can cost.
    fn release(&mut self) -> std::io::Result<()> {
        self.stream.write_all(&encode(&["GET", &self.key]))?;
        match read_reply(&mut self.reader)? {
            Reply::Bulk(v) if v == self.token => {
                self.stream.write_all(&encode(&["DEL", &self.key]))?;
                let _ = read_reply(&mut self.reader)?;
                log::debug!("released lock {:?}", self.key);
            }
            Reply::Nil => log::debug!("lock {:?} already expired", self.key),
            _ => log::warn!("lock {:?} changed owner before release; leaving it", self.key),
        }
        Ok(())
    }
}

impl Drop for NetLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("failed to release lock {:?}: {}", self.key, e);
        }
    }
}
