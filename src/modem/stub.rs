use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::network::Registration;
use super::{NetworkMonitor, NetworkStatus, NotificationChannel, SendAck};
use crate::error::SentinelError;
use crate::geo::{GpsReading, GpsReceiver};

/// Bench modem: logs outgoing SMS, optionally reports a fixed position.
#[derive(Clone, Debug)]
pub struct StubModem {
    position: Option<GpsReading>,
    next_ref: Arc<AtomicU32>,
}

impl StubModem {
    /// Parses the part after `stub://`: empty for no fix, or `<lat>,<lon>`.
    pub fn parse(text: &str, accuracy_m: f64) -> Result<Self> {
        let text = text.trim();
        let position = if text.is_empty() {
            None
        } else {
            let (lat, lon) = text
                .split_once(',')
                .ok_or_else(|| anyhow!("stub modem position must be <lat>,<lon>: {}", text))?;
            let latitude: f64 = lat
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid stub latitude: {}", lat))?;
            let longitude: f64 = lon
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid stub longitude: {}", lon))?;
            Some(GpsReading {
                latitude,
                longitude,
                accuracy_m,
                quality: 1,
            })
        };
        Ok(Self {
            position,
            next_ref: Arc::new(AtomicU32::new(1)),
        })
    }
}

impl GpsReceiver for StubModem {
    fn read_position(&mut self) -> Result<Option<GpsReading>> {
        Ok(self.position)
    }
}

impl NotificationChannel for StubModem {
    fn name(&self) -> &str {
        "stub"
    }

    fn send(
        &mut self,
        destination: &str,
        body: &str,
        _timeout: Duration,
    ) -> Result<SendAck, SentinelError> {
        let reference = self.next_ref.fetch_add(1, Ordering::SeqCst);
        log::info!(
            "stub modem: SMS #{} to {} ({} chars)\n{}",
            reference,
            destination,
            body.chars().count(),
            body
        );
        Ok(SendAck {
            message_refs: vec![reference],
        })
    }
}

impl NetworkMonitor for StubModem {
    fn network_status(&mut self) -> Result<NetworkStatus> {
        Ok(NetworkStatus {
            registration: Registration::Home,
            signal_dbm: None,
            operator: Some("stub".to_string()),
            sim_ready: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positions() -> Result<()> {
        let mut modem = StubModem::parse("13.6218, 123.1945", 10.0)?;
        let reading = modem.read_position()?.expect("fix");
        assert_eq!(reading.latitude, 13.6218);
        assert_eq!(reading.longitude, 123.1945);

        let mut modem = StubModem::parse("", 10.0)?;
        assert_eq!(modem.read_position()?, None);
        assert!(StubModem::parse("north", 10.0).is_err());
        Ok(())
    }

    #[test]
    fn message_refs_increase() {
        let mut modem = StubModem::parse("", 10.0).unwrap();
        let a = modem.send("+639171234567", "a", Duration::from_secs(1)).unwrap();
        let b = modem.send("+639171234567", "b", Duration::from_secs(1)).unwrap();
        assert_eq!(a.message_refs, vec![1]);
        assert_eq!(b.message_refs, vec![2]);
    }
}
