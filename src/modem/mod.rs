//! Cellular modem: SMS notification channel and GPS receiver.
//!
//! A SIM7600-class modem serves both roles over one AT command port, so the GPS poller, the
//! dispatch sender and the health check share it through `SharedModem`, which serializes
//! access with a mutex. No caller holds the lock for longer than one command exchange or one
//! SMS send.

pub mod at;
pub mod network;
pub mod sms;
mod stub;

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use crate::config::{GpsSettings, ModemSettings};
use crate::error::SentinelError;
use crate::geo::{parse_cgpsinfo, GpsReading, GpsReceiver};

use at::{command, read_until_final, AtTransport};
use network::Registration;
use sms::SmsEncoding;

pub use network::NetworkStatus;
pub use stub::StubModem;

const CTRL_Z: u8 = 0x1A;
const ESC: u8 = 0x1B;

/// Delivery acknowledgement: one modem message reference per SMS part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendAck {
    pub message_refs: Vec<u32>,
}

/// SMS send primitive.
pub trait NotificationChannel: Send {
    fn name(&self) -> &str;

    /// Sends `body` to `destination`, giving up after `timeout`. The timeout covers the whole
    /// message, every part of a multi-part body included.
    ///
    /// Every failure is reported as `SendFailure`; retry policy belongs to the caller.
    fn send(
        &mut self,
        destination: &str,
        body: &str,
        timeout: Duration,
    ) -> Result<SendAck, SentinelError>;
}

/// Cellular network status, for health reporting.
pub trait NetworkMonitor: Send {
    fn network_status(&mut self) -> Result<NetworkStatus>;
}

/// AT-command driver for SIM7600-class modems.
pub struct Sim7600 {
    transport: Box<dyn AtTransport>,
    command_timeout: Duration,
    nominal_accuracy_m: f64,
    sms_ready: bool,
    gps_enabled: bool,
    encoding: Option<SmsEncoding>,
}

impl Sim7600 {
    pub fn new(transport: Box<dyn AtTransport>, settings: &ModemSettings, gps: &GpsSettings) -> Self {
        Self {
            transport,
            command_timeout: settings.command_timeout,
            nominal_accuracy_m: gps.nominal_accuracy_m,
            sms_ready: false,
            gps_enabled: false,
            encoding: None,
        }
    }

    fn at(&mut self, cmd: &str) -> Result<at::AtResponse> {
        command(self.transport.as_mut(), cmd, self.command_timeout)
    }

    /// Brings the link up. A new link means a modem that may have been reset, so SMS mode is
    /// set up again and the network status is logged.
    pub fn ensure_link(&mut self) -> Result<()> {
        if !self.transport.connect()? {
            return Ok(());
        }
        self.sms_ready = false;
        self.gps_enabled = false;
        self.encoding = None;
        match self.initialize_sms() {
            Ok(()) => self.log_network_status(),
            Err(err) => log::warn!("modem: initialisation failed: {:#}", err),
        }
        Ok(())
    }

    /// Echo check, text mode, GSM character set.
    pub fn initialize_sms(&mut self) -> Result<()> {
        self.at("AT")?.into_ok("AT")?;
        self.at("AT+CMGF=1")?.into_ok("AT+CMGF=1")?;
        self.at("AT+CSCS=\"GSM\"")?.into_ok("AT+CSCS")?;
        self.sms_ready = true;
        self.encoding = Some(SmsEncoding::Gsm7);
        log::info!("modem: SMS text mode ready");
        Ok(())
    }

    fn log_network_status(&mut self) {
        match self.query_network() {
            Ok(status) if status.registered() => log::info!("modem: network {}", status),
            Ok(status) => log::warn!("modem: not registered: {}", status),
            Err(err) => log::warn!("modem: network status unavailable: {:#}", err),
        }
    }

    fn query_network(&mut self) -> Result<NetworkStatus> {
        let registration = self
            .at("AT+CREG?")?
            .into_ok("AT+CREG?")?
            .line_with("+CREG")
            .and_then(network::parse_registration)
            .unwrap_or(Registration::Unknown);
        let signal_dbm = self
            .at("AT+CSQ")?
            .into_ok("AT+CSQ")?
            .line_with("+CSQ")
            .and_then(network::parse_signal_dbm);
        // Answers ERROR without a SIM.
        let sim_ready = self
            .at("AT+CPIN?")?
            .line_with("+CPIN")
            .is_some_and(network::parse_sim_ready);
        let operator = self
            .at("AT+COPS?")?
            .into_ok("AT+COPS?")?
            .line_with("+COPS")
            .and_then(network::parse_operator);
        Ok(NetworkStatus {
            registration,
            signal_dbm,
            operator,
            sim_ready,
        })
    }

    pub fn enable_gps(&mut self) -> Result<()> {
        let resp = self.at("AT+CGPS=1")?;
        if !resp.is_ok() {
            // The modem answers ERROR when the GNSS engine is already running.
            log::debug!("modem: AT+CGPS=1 returned {:?}; assuming GPS already on", resp.status);
        }
        self.gps_enabled = true;
        Ok(())
    }

    fn select_encoding(&mut self, encoding: SmsEncoding) -> Result<()> {
        if self.encoding == Some(encoding) {
            return Ok(());
        }
        self.encoding = None;
        self.at(&format!("AT+CSCS=\"{}\"", encoding.charset()))?
            .into_ok("AT+CSCS")?;
        self.at(&format!("AT+CSMP=17,167,0,{}", encoding.data_coding_scheme()))?
            .into_ok("AT+CSMP")?;
        self.encoding = Some(encoding);
        Ok(())
    }

    fn send_part(&mut self, address: &str, text: &str, timeout: Duration) -> Result<u32> {
        self.transport.clear_input()?;
        self.transport
            .write_line(&format!("AT+CMGS=\"{}\"", address))?;
        if !self.transport.wait_for_prompt(self.command_timeout)? {
            let _ = self.transport.write_raw(&[ESC]);
            return Err(anyhow!("modem did not prompt for message text"));
        }
        let mut payload = text.as_bytes().to_vec();
        payload.push(CTRL_Z);
        self.transport.write_raw(&payload)?;

        let resp = read_until_final(self.transport.as_mut(), None, timeout)?.into_ok("AT+CMGS")?;
        resp.line_with("+CMGS")
            .and_then(at::parse_message_ref)
            .ok_or_else(|| anyhow!("send confirmed without a +CMGS reference"))
    }

    fn send_message(&mut self, destination: &str, body: &str, timeout: Duration) -> Result<SendAck> {
        let deadline = Instant::now() + timeout;
        self.ensure_link()?;
        if !self.sms_ready {
            self.initialize_sms()?;
        }
        let encoding = SmsEncoding::for_text(body);
        self.select_encoding(encoding)?;

        let address = encoding.encode(destination);
        let parts = sms::split_message_as(body, encoding);
        let total = parts.len();
        let mut message_refs = Vec::with_capacity(total);
        for (i, part) in parts.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(anyhow!(
                    "timed out after {}/{} parts ({}ms)",
                    i,
                    total,
                    timeout.as_millis()
                ));
            }
            let reference = self
                .send_part(&address, &encoding.encode(part), remaining)
                .map_err(|err| anyhow!("part {}/{}: {:#}", i + 1, total, err))?;
            message_refs.push(reference);
        }
        Ok(SendAck { message_refs })
    }
}

impl NotificationChannel for Sim7600 {
    fn name(&self) -> &str {
        "sim7600"
    }

    fn send(
        &mut self,
        destination: &str,
        body: &str,
        timeout: Duration,
    ) -> Result<SendAck, SentinelError> {
        self.send_message(destination, body, timeout).map_err(|err| {
            // Force re-initialisation; the modem may have been reset underneath us.
            self.sms_ready = false;
            SentinelError::SendFailure {
                destination: destination.to_string(),
                reason: format!("{:#}", err),
            }
        })
    }
}

impl GpsReceiver for Sim7600 {
    fn read_position(&mut self) -> Result<Option<GpsReading>> {
        self.ensure_link()?;
        if !self.gps_enabled {
            self.enable_gps()?;
        }
        let resp = self.at("AT+CGPSINFO")?.into_ok("AT+CGPSINFO")?;
        match resp.line_with("+CGPSINFO") {
            Some(line) => parse_cgpsinfo(line, self.nominal_accuracy_m),
            None => Err(anyhow!("AT+CGPSINFO returned no position line")),
        }
    }
}

impl NetworkMonitor for Sim7600 {
    fn network_status(&mut self) -> Result<NetworkStatus> {
        self.ensure_link()?;
        self.query_network()
    }
}

/// One modem shared by the GPS poller, the dispatch sender and the health check.
#[derive(Clone)]
pub struct SharedModem {
    inner: Arc<Mutex<Sim7600>>,
}

impl SharedModem {
    pub fn new(modem: Sim7600) -> Self {
        Self {
            inner: Arc::new(Mutex::new(modem)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Sim7600) -> R) -> Result<R> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("modem lock poisoned"))?;
        Ok(f(&mut guard))
    }
}

impl NotificationChannel for SharedModem {
    fn name(&self) -> &str {
        "sim7600"
    }

    fn send(
        &mut self,
        destination: &str,
        body: &str,
        timeout: Duration,
    ) -> Result<SendAck, SentinelError> {
        self.with(|modem| modem.send(destination, body, timeout))
            .unwrap_or_else(|err| {
                Err(SentinelError::SendFailure {
                    destination: destination.to_string(),
                    reason: format!("{:#}", err),
                })
            })
    }
}

impl GpsReceiver for SharedModem {
    fn read_position(&mut self) -> Result<Option<GpsReading>> {
        self.with(|modem| modem.read_position())?
    }
}

impl NetworkMonitor for SharedModem {
    /// Never waits behind a send in progress; a busy modem is reported as an error.
    fn network_status(&mut self) -> Result<NetworkStatus> {
        let mut modem = match self.inner.try_lock() {
            Ok(modem) => modem,
            Err(TryLockError::WouldBlock) => return Err(anyhow!("modem busy")),
            Err(TryLockError::Poisoned(_)) => return Err(anyhow!("modem lock poisoned")),
        };
        modem.network_status()
    }
}

/// The roles one modem plays.
pub struct ModemHandles {
    pub gps: Box<dyn GpsReceiver>,
    pub sms: Box<dyn NotificationChannel>,
    pub network: Box<dyn NetworkMonitor>,
}

impl ModemHandles {
    pub fn shared(modem: SharedModem) -> Self {
        Self {
            gps: Box::new(modem.clone()),
            sms: Box::new(modem.clone()),
            network: Box::new(modem),
        }
    }
}

/// Opens the configured modem.
///
/// `stub://` ports log messages instead of sending them; `stub://<lat>,<lon>` also reports a
/// fixed position. A serial port that is missing or busy is not an error: it is opened on
/// first use and reopened whenever the link drops, and until then sends fail with
/// `SendFailure` and GPS reads fail.
pub fn open_modem(settings: &ModemSettings, gps: &GpsSettings) -> Result<ModemHandles> {
    if let Some(position) = settings.port.strip_prefix("stub://") {
        let modem = StubModem::parse(position, gps.nominal_accuracy_m)?;
        return Ok(ModemHandles {
            gps: Box::new(modem.clone()),
            sms: Box::new(modem.clone()),
            network: Box::new(modem),
        });
    }
    #[cfg(feature = "modem-serial")]
    {
        let (port, baud_rate) = (settings.port.clone(), settings.baud_rate);
        let transport = at::ReconnectingTransport::new(
            settings.port.clone(),
            settings.reopen_interval,
            move || {
                at::SerialTransport::open(&port, baud_rate)
                    .map(|serial| Box::new(serial) as Box<dyn AtTransport>)
            },
        );
        let mut modem = Sim7600::new(Box::new(transport), settings, gps);
        if let Err(err) = modem.ensure_link() {
            log::warn!("modem: starting without {}: {:#}", settings.port, err);
        }
        Ok(ModemHandles::shared(SharedModem::new(modem)))
    }
    #[cfg(not(feature = "modem-serial"))]
    {
        let _ = gps;
        Err(anyhow!(
            "modem port {} requires the modem-serial feature",
            settings.port
        ))
    }
}
