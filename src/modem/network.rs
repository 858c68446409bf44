//! Cellular registration and signal quality (`AT+CREG?`, `AT+CSQ`, `AT+CPIN?`, `AT+COPS?`).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    NotRegistered,
    Home,
    Searching,
    Denied,
    Unknown,
    Roaming,
}

impl Registration {
    /// Maps the `<stat>` field of `+CREG`.
    pub fn from_stat(stat: u8) -> Self {
        match stat {
            0 => Registration::NotRegistered,
            1 => Registration::Home,
            2 => Registration::Searching,
            3 => Registration::Denied,
            5 => Registration::Roaming,
            _ => Registration::Unknown,
        }
    }

    pub fn is_registered(self) -> bool {
        matches!(self, Registration::Home | Registration::Roaming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Registration::NotRegistered => "not_registered",
            Registration::Home => "home",
            Registration::Searching => "searching",
            Registration::Denied => "denied",
            Registration::Unknown => "unknown",
            Registration::Roaming => "roaming",
        }
    }
}

/// What the modem reports about the cellular network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkStatus {
    pub registration: Registration,
    /// Received signal strength; `None` when the modem does not know.
    pub signal_dbm: Option<i32>,
    pub operator: Option<String>,
    pub sim_ready: bool,
}

impl NetworkStatus {
    /// Registered on the home network or roaming; SMS can go out.
    pub fn registered(&self) -> bool {
        self.registration.is_registered()
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.registration.as_str())?;
        if let Some(operator) = &self.operator {
            write!(f, " on {}", operator)?;
        }
        match self.signal_dbm {
            Some(dbm) => write!(f, ", {} dBm", dbm)?,
            None => write!(f, ", no signal reading")?,
        }
        if !self.sim_ready {
            write!(f, ", SIM not ready")?;
        }
        Ok(())
    }
}

fn creg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+CREG:\s*(\d+)(?:\s*,\s*(\d+))?").unwrap())
}

fn csq_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+CSQ:\s*(\d+)\s*,\s*(\d+)").unwrap())
}

fn cops_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^\+COPS:\s*\d+\s*,\s*\d+\s*,\s*"([^"]*)""#).unwrap())
}

/// Parses `+CREG: <n>,<stat>[,...]` (query reply) or `+CREG: <stat>` (unsolicited).
pub fn parse_registration(line: &str) -> Option<Registration> {
    let caps = creg_re().captures(line)?;
    let stat = caps.get(2).or_else(|| caps.get(1))?;
    stat.as_str().parse().ok().map(Registration::from_stat)
}

/// Converts `+CSQ: <rssi>,<ber>` to dBm: rssi 0..=31 maps to -113..=-51 dBm, 99 is unknown.
pub fn parse_signal_dbm(line: &str) -> Option<i32> {
    let caps = csq_re().captures(line)?;
    let rssi: i32 = caps[1].parse().ok()?;
    (0..=31).contains(&rssi).then(|| -113 + 2 * rssi)
}

/// Operator name from `+COPS: <mode>,<format>,"<name>"[,<act>]`.
pub fn parse_operator(line: &str) -> Option<String> {
    let caps = cops_re().captures(line)?;
    let name = caps[1].trim();
    (!name.is_empty()).then(|| name.to_string())
}

pub fn parse_sim_ready(line: &str) -> bool {
    line.strip_prefix("+CPIN:")
        .is_some_and(|state| state.trim() == "READY")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_states() {
        assert_eq!(parse_registration("+CREG: 0,1"), Some(Registration::Home));
        assert_eq!(parse_registration("+CREG: 0,5"), Some(Registration::Roaming));
        assert_eq!(parse_registration("+CREG: 0,2"), Some(Registration::Searching));
        assert_eq!(parse_registration("+CREG: 2,3,\"00C3\",\"1234\""), Some(Registration::Denied));
        assert_eq!(parse_registration("+CREG: 1"), Some(Registration::Home));
        assert_eq!(parse_registration("+CREG: 0,4"), Some(Registration::Unknown));
        assert_eq!(parse_registration("+CSQ: 1,1"), None);
        assert!(Registration::Roaming.is_registered());
        assert!(!Registration::Searching.is_registered());
    }

    #[test]
    fn signal_quality_in_dbm() {
        assert_eq!(parse_signal_dbm("+CSQ: 0,99"), Some(-113));
        assert_eq!(parse_signal_dbm("+CSQ: 20,99"), Some(-73));
        assert_eq!(parse_signal_dbm("+CSQ: 31,0"), Some(-51));
        assert_eq!(parse_signal_dbm("+CSQ: 99,99"), None);
        assert_eq!(parse_signal_dbm("+CREG: 0,1"), None);
    }

    #[test]
    fn operator_and_sim() {
        assert_eq!(
            parse_operator("+COPS: 0,0,\"Globe Telecom\",7").as_deref(),
            Some("Globe Telecom")
        );
        assert_eq!(parse_operator("+COPS: 0"), None);
        assert!(parse_sim_ready("+CPIN: READY"));
        assert!(!parse_sim_ready("+CPIN: SIM PIN"));
    }

    #[test]
    fn status_reads_well_in_logs() {
        let status = NetworkStatus {
            registration: Registration::Home,
            signal_dbm: Some(-73),
            operator: Some("Smart".to_string()),
            sim_ready: true,
        };
        assert_eq!(status.to_string(), "home on Smart, -73 dBm");
        let lost = NetworkStatus {
            registration: Registration::Searching,
            signal_dbm: None,
            operator: None,
            sim_ready: false,
        };
        assert_eq!(lost.to_string(), "searching, no signal reading, SIM not ready");
    }
}
