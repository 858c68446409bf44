//! AT command plumbing.
//!
//! `AtTransport` is the byte-level link to the modem; `command` runs one command and collects
//! response lines up to the final result code. `ReconnectingTransport` opens the port lazily
//! and reopens it after an I/O error, so a modem that is missing at boot or re-enumerates on
//! the USB bus only costs the commands issued while it is gone.

use anyhow::{anyhow, Result};
use regex::Regex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Line-oriented link to an AT modem.
pub trait AtTransport: Send {
    /// Writes `line` followed by a carriage return.
    fn write_line(&mut self, line: &str) -> Result<()>;

    /// Writes raw bytes without a terminator.
    fn write_raw(&mut self, bytes: &[u8]) -> Result<()>;

    /// Reads the next non-empty line, or `None` once `timeout` passes.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>>;

    /// Waits for the `>` text-entry prompt. Returns `false` on timeout.
    fn wait_for_prompt(&mut self, timeout: Duration) -> Result<bool>;

    /// Discards unread input: late replies to timed-out commands and unsolicited codes.
    fn clear_input(&mut self) -> Result<()>;

    /// Makes sure the link is up. Returns `true` when a new link was just established, so
    /// the modem behind it needs initialising again.
    fn connect(&mut self) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AtStatus {
    Ok,
    Error(String),
}

/// Intermediate response lines plus the final result code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AtResponse {
    pub lines: Vec<String>,
    pub status: AtStatus,
}

impl AtResponse {
    pub fn is_ok(&self) -> bool {
        self.status == AtStatus::Ok
    }

    /// First line starting with `prefix`.
    pub fn line_with(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .map(String::as_str)
            .find(|line| line.starts_with(prefix))
    }

    /// Fails unless the modem answered `OK`.
    pub fn into_ok(self, command: &str) -> Result<Self> {
        match &self.status {
            AtStatus::Ok => Ok(self),
            AtStatus::Error(reason) => Err(anyhow!("{} failed: {}", command, reason)),
        }
    }
}

fn error_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+CM[SE] ERROR:\s*(.+)$").unwrap())
}

fn message_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+CMGS:\s*(\d+)").unwrap())
}

/// Classifies a final result code line, if it is one.
pub fn final_status(line: &str) -> Option<AtStatus> {
    if line == "OK" {
        return Some(AtStatus::Ok);
    }
    if line == "ERROR" {
        return Some(AtStatus::Error("ERROR".to_string()));
    }
    error_code_re()
        .captures(line)
        .map(|caps| AtStatus::Error(format!("{} ({})", &line[..10], &caps[1])))
}

/// Extracts the message reference from a `+CMGS: <ref>` line.
pub fn parse_message_ref(line: &str) -> Option<u32> {
    message_ref_re()
        .captures(line)
        .and_then(|caps| caps[1].parse().ok())
}

/// Sends `cmd` and collects lines until `OK`/`ERROR`, skipping the command echo. Input left
/// over from earlier exchanges is discarded first.
pub fn command(transport: &mut dyn AtTransport, cmd: &str, timeout: Duration) -> Result<AtResponse> {
    transport.clear_input()?;
    transport.write_line(cmd)?;
    read_until_final(transport, Some(cmd), timeout)
        .map_err(|err| anyhow!("{}: {:#}", cmd, err))
}

pub(crate) fn read_until_final(
    transport: &mut dyn AtTransport,
    echo: Option<&str>,
    timeout: Duration,
) -> Result<AtResponse> {
    let deadline = Instant::now() + timeout;
    let mut lines = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(anyhow!("no final result code within {}ms", timeout.as_millis()));
        }
        let Some(line) = transport.read_line(remaining)? else {
            return Err(anyhow!("no final result code within {}ms", timeout.as_millis()));
        };
        let line = line.trim().to_string();
        if line.is_empty() || echo.is_some_and(|echo| line == echo) {
            continue;
        }
        if let Some(status) = final_status(&line) {
            return Ok(AtResponse { lines, status });
        }
        lines.push(line);
    }
}

type TransportOpener = Box<dyn FnMut() -> Result<Box<dyn AtTransport>> + Send>;

/// Transport that opens its port on demand and drops it after an I/O error.
///
/// While the port is closed every operation fails, so callers see ordinary command errors
/// and retry on their own schedule. Open attempts are at least `retry_interval` apart.
pub struct ReconnectingTransport {
    label: String,
    open: TransportOpener,
    link: Option<Box<dyn AtTransport>>,
    retry_interval: Duration,
    last_attempt: Option<Instant>,
    failed_opens: u32,
}

impl ReconnectingTransport {
    pub fn new(
        label: impl Into<String>,
        retry_interval: Duration,
        open: impl FnMut() -> Result<Box<dyn AtTransport>> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            open: Box::new(open),
            link: None,
            retry_interval,
            last_attempt: None,
            failed_opens: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn with_link<R>(&mut self, op: impl FnOnce(&mut dyn AtTransport) -> Result<R>) -> Result<R> {
        let Some(link) = self.link.as_mut() else {
            return Err(anyhow!("modem port {} is not open", self.label));
        };
        match op(link.as_mut()) {
            Ok(value) => Ok(value),
            Err(err) => {
                log::warn!("modem: link to {} lost: {:#}", self.label, err);
                self.link = None;
                Err(err)
            }
        }
    }
}

impl AtTransport for ReconnectingTransport {
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.with_link(|link| link.write_line(line))
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.with_link(|link| link.write_raw(bytes))
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        self.with_link(|link| link.read_line(timeout))
    }

    fn wait_for_prompt(&mut self, timeout: Duration) -> Result<bool> {
        self.with_link(|link| link.wait_for_prompt(timeout))
    }

    fn clear_input(&mut self) -> Result<()> {
        self.with_link(|link| link.clear_input())
    }

    fn connect(&mut self) -> Result<bool> {
        if self.link.is_some() {
            return Ok(false);
        }
        if let Some(last) = self.last_attempt {
            let waited = last.elapsed();
            if waited < self.retry_interval {
                return Err(anyhow!(
                    "modem port {} unavailable; next open attempt in {}ms",
                    self.label,
                    self.retry_interval.saturating_sub(waited).as_millis()
                ));
            }
        }
        self.last_attempt = Some(Instant::now());
        match (self.open)() {
            Ok(link) => {
                log::info!(
                    "modem: opened {} after {} failed attempt(s)",
                    self.label,
                    self.failed_opens
                );
                self.link = Some(link);
                self.failed_opens = 0;
                Ok(true)
            }
            Err(err) => {
                self.failed_opens += 1;
                if self.failed_opens == 1 {
                    log::warn!("modem: cannot open {}: {:#}; will keep retrying", self.label, err);
                } else {
                    log::debug!(
                        "modem: open attempt {} on {} failed: {:#}",
                        self.failed_opens,
                        self.label,
                        err
                    );
                }
                Err(err.context(format!("modem port {} unavailable", self.label)))
            }
        }
    }
}

#[cfg(feature = "modem-serial")]
pub use serial::SerialTransport;

#[cfg(feature = "modem-serial")]
mod serial {
    use anyhow::{anyhow, Context, Result};
    use serialport::ClearBuffer;
    use std::io::{ErrorKind, Read, Write};
    use std::time::{Duration, Instant};

    use super::AtTransport;

    const READ_SLICE: Duration = Duration::from_millis(100);

    /// `serialport`-backed transport (e.g. `/dev/ttyUSB2` on a SIM7600 HAT).
    pub struct SerialTransport {
        port: Box<dyn serialport::SerialPort>,
        pending: Vec<u8>,
    }

    impl SerialTransport {
        pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
            let port = serialport::new(path, baud_rate)
                .timeout(READ_SLICE)
                .open()
                .with_context(|| format!("open serial port {} at {} baud", path, baud_rate))?;
            Ok(Self {
                port,
                pending: Vec::new(),
            })
        }

        fn fill(&mut self) -> Result<bool> {
            let mut buf = [0u8; 256];
            match self.port.read(&mut buf) {
                Ok(0) => Ok(false),
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    Ok(true)
                }
                Err(err) if err.kind() == ErrorKind::TimedOut => Ok(false),
                Err(err) => Err(anyhow!("serial read failed: {}", err)),
            }
        }
    }

    impl AtTransport for SerialTransport {
        fn write_line(&mut self, line: &str) -> Result<()> {
            self.port.write_all(line.as_bytes())?;
            self.port.write_all(b"\r")?;
            self.port.flush()?;
            Ok(())
        }

        fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
            self.port.write_all(bytes)?;
            self.port.flush()?;
            Ok(())
        }

        fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
            let deadline = Instant::now() + timeout;
            loop {
                while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if !line.is_empty() {
                        return Ok(Some(line));
                    }
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                self.fill()?;
            }
        }

        fn wait_for_prompt(&mut self, timeout: Duration) -> Result<bool> {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(pos) = self.pending.iter().position(|b| *b == b'>') {
                    self.pending.drain(..=pos);
                    return Ok(true);
                }
                if Instant::now() >= deadline {
                    return Ok(false);
                }
                self.fill()?;
            }
        }

        fn clear_input(&mut self) -> Result<()> {
            self.pending.clear();
            self.port
                .clear(ClearBuffer::Input)
                .map_err(|err| anyhow!("serial input flush failed: {}", err))
        }
    }
}
