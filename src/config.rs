use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::modem::sms::normalize_number;

const DEFAULT_DB_PATH: &str = "sentinel.db";
const DEFAULT_CAMERA: &str = "stub://field_camera";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_DETECTION_INTERVAL_MS: u64 = 2_000;
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_WINDOW_SECS: u64 = 10;
const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DUPLICATE_IOU: f32 = 0.5;
const DEFAULT_COOLDOWN_SECS: u64 = 300;
const DEFAULT_GPS_POLL_SECS: u64 = 30;
const DEFAULT_MAX_FIX_AGE_SECS: u64 = 120;
const DEFAULT_NOMINAL_ACCURACY_M: f64 = 10.0;
const DEFAULT_MODEM_PORT: &str = "/dev/ttyUSB2";
const DEFAULT_MODEM_BAUD: u32 = 115_200;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MODEM_REOPEN_SECS: u64 = 15;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_BACKOFF_SECS: u64 = 5;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;
const DEFAULT_SEND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DISPATCH_POLL_MS: u64 = 1_000;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
const DEFAULT_HEALTH_CHECK_SECS: u64 = 60;
const DEFAULT_SOURCE_BACKOFF_MAX_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    db_path: Option<String>,
    camera: Option<CameraConfigFile>,
    detection: Option<DetectionConfigFile>,
    alerts: Option<AlertConfigFile>,
    gps: Option<GpsConfigFile>,
    modem: Option<ModemConfigFile>,
    dispatch: Option<DispatchConfigFile>,
    emergency_contacts: Option<Vec<String>>,
    evacuation_sites: Option<Vec<EvacuationSite>>,
    system: Option<SystemConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    interval_ms: Option<u64>,
    confidence_threshold: Option<f32>,
    window_secs: Option<u64>,
    inference_timeout_ms: Option<u64>,
    duplicate_iou: Option<f32>,
    model_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    min_humans: Option<u32>,
    min_animals: Option<u32>,
    cooldown_secs: Option<u64>,
    utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
struct GpsConfigFile {
    poll_secs: Option<u64>,
    max_fix_age_secs: Option<u64>,
    nominal_accuracy_m: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct ModemConfigFile {
    port: Option<String>,
    baud_rate: Option<u32>,
    command_timeout_secs: Option<u64>,
    reopen_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatchConfigFile {
    max_attempts: Option<u32>,
    base_backoff_secs: Option<u64>,
    max_backoff_secs: Option<u64>,
    send_timeout_secs: Option<u64>,
    poll_ms: Option<u64>,
    shutdown_grace_secs: Option<u64>,
    operator_contact: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SystemConfigFile {
    health_check_secs: Option<u64>,
    source_backoff_max_secs: Option<u64>,
}

/// An evacuation site alerts direct responders to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvacuationSite {
    pub name: String,
    pub address: String,
    /// `[latitude, longitude]`, used to pick the nearest site when none is primary.
    #[serde(default)]
    pub coordinates: Option<[f64; 2]>,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub db_path: String,
    pub camera: CameraSettings,
    pub detection: DetectionSettings,
    pub alerts: AlertSettings,
    pub gps: GpsSettings,
    pub modem: ModemSettings,
    pub dispatch: DispatchSettings,
    pub emergency_contacts: Vec<String>,
    pub evacuation_sites: Vec<EvacuationSite>,
    pub health_check_interval: Duration,
    pub source_backoff_max: Duration,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// `stub://name` for the synthetic source, otherwise a device path such as `/dev/video0`.
    pub source: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub interval: Duration,
    pub confidence_threshold: f32,
    pub window: Duration,
    pub inference_timeout: Duration,
    /// Same-class boxes overlapping more than this IoU within one frame are one object.
    pub duplicate_iou: f32,
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub min_humans: u32,
    pub min_animals: u32,
    pub cooldown: Duration,
    /// Offset used to render the `Time:` line. `None` means the device's local offset.
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct GpsSettings {
    pub poll_interval: Duration,
    pub max_fix_age: Duration,
    pub nominal_accuracy_m: f64,
}

#[derive(Debug, Clone)]
pub struct ModemSettings {
    /// Serial device path, or `stub://` for a modem that logs instead of transmitting.
    pub port: String,
    pub baud_rate: u32,
    pub command_timeout: Duration,
    /// Minimum spacing of attempts to open a missing or lost serial port.
    pub reopen_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub send_timeout: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub operator_contact: Option<String>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        // Defaults contain no contacts and one built-in site; validation accepts them.
        Self::from_file(SentinelConfigFile::default())
    }
}

impl SentinelConfig {
    /// Loads configuration from `SENTINEL_CONFIG` (if set), then applies env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Loads configuration from an explicit file path, then applies env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let alerts = file.alerts.unwrap_or_default();
        let gps = file.gps.unwrap_or_default();
        let modem = file.modem.unwrap_or_default();
        let dispatch = file.dispatch.unwrap_or_default();
        let system = file.system.unwrap_or_default();

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            camera: CameraSettings {
                source: camera.source.unwrap_or_else(|| DEFAULT_CAMERA.to_string()),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            },
            detection: DetectionSettings {
                interval: Duration::from_millis(
                    detection.interval_ms.unwrap_or(DEFAULT_DETECTION_INTERVAL_MS),
                ),
                confidence_threshold: detection
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE),
                window: Duration::from_secs(detection.window_secs.unwrap_or(DEFAULT_WINDOW_SECS)),
                inference_timeout: Duration::from_millis(
                    detection
                        .inference_timeout_ms
                        .unwrap_or(DEFAULT_INFERENCE_TIMEOUT_MS),
                ),
                duplicate_iou: detection.duplicate_iou.unwrap_or(DEFAULT_DUPLICATE_IOU),
                model_path: detection.model_path,
            },
            alerts: AlertSettings {
                min_humans: alerts.min_humans.unwrap_or(1),
                min_animals: alerts.min_animals.unwrap_or(1),
                cooldown: Duration::from_secs(
                    alerts.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
                ),
                utc_offset_minutes: alerts.utc_offset_minutes,
            },
            gps: GpsSettings {
                poll_interval: Duration::from_secs(gps.poll_secs.unwrap_or(DEFAULT_GPS_POLL_SECS)),
                max_fix_age: Duration::from_secs(
                    gps.max_fix_age_secs.unwrap_or(DEFAULT_MAX_FIX_AGE_SECS),
                ),
                nominal_accuracy_m: gps
                    .nominal_accuracy_m
                    .unwrap_or(DEFAULT_NOMINAL_ACCURACY_M),
            },
            modem: ModemSettings {
                port: modem.port.unwrap_or_else(|| DEFAULT_MODEM_PORT.to_string()),
                baud_rate: modem.baud_rate.unwrap_or(DEFAULT_MODEM_BAUD),
                command_timeout: Duration::from_secs(
                    modem
                        .command_timeout_secs
                        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
                ),
                reopen_interval: Duration::from_secs(
                    modem.reopen_secs.unwrap_or(DEFAULT_MODEM_REOPEN_SECS),
                ),
            },
            dispatch: DispatchSettings {
                max_attempts: dispatch.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                base_backoff: Duration::from_secs(
                    dispatch
                        .base_backoff_secs
                        .unwrap_or(DEFAULT_BASE_BACKOFF_SECS),
                ),
                max_backoff: Duration::from_secs(
                    dispatch.max_backoff_secs.unwrap_or(DEFAULT_MAX_BACKOFF_SECS),
                ),
                send_timeout: Duration::from_secs(
                    dispatch
                        .send_timeout_secs
                        .unwrap_or(DEFAULT_SEND_TIMEOUT_SECS),
                ),
                poll_interval: Duration::from_millis(
                    dispatch.poll_ms.unwrap_or(DEFAULT_DISPATCH_POLL_MS),
                ),
                shutdown_grace: Duration::from_secs(
                    dispatch
                        .shutdown_grace_secs
                        .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
                ),
                operator_contact: dispatch.operator_contact,
            },
            emergency_contacts: file.emergency_contacts.unwrap_or_default(),
            evacuation_sites: file
                .evacuation_sites
                .unwrap_or_else(|| vec![default_evacuation_site()]),
            health_check_interval: Duration::from_secs(
                system.health_check_secs.unwrap_or(DEFAULT_HEALTH_CHECK_SECS),
            ),
            source_backoff_max: Duration::from_secs(
                system
                    .source_backoff_max_secs
                    .unwrap_or(DEFAULT_SOURCE_BACKOFF_MAX_SECS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SENTINEL_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(camera) = std::env::var("SENTINEL_CAMERA") {
            if !camera.trim().is_empty() {
                self.camera.source = camera;
            }
        }
        if let Ok(port) = std::env::var("SENTINEL_MODEM_PORT") {
            if !port.trim().is_empty() {
                self.modem.port = port;
            }
        }
        if let Ok(contacts) = std::env::var("SENTINEL_CONTACTS") {
            let parsed = split_csv(&contacts);
            if !parsed.is_empty() {
                self.emergency_contacts = parsed;
            }
        }
        if let Ok(cooldown) = std::env::var("SENTINEL_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.parse().map_err(|_| {
                anyhow!("SENTINEL_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.alerts.cooldown = Duration::from_secs(seconds);
        }
        if let Ok(window) = std::env::var("SENTINEL_WINDOW_SECS") {
            let seconds: u64 = window.parse().map_err(|_| {
                anyhow!("SENTINEL_WINDOW_SECS must be an integer number of seconds")
            })?;
            self.detection.window = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.detection.interval.is_zero() {
            return Err(anyhow!("detection interval must be greater than zero"));
        }
        if self.detection.window.is_zero() {
            return Err(anyhow!("aggregation window must be greater than zero"));
        }
        if self.detection.inference_timeout.is_zero() {
            return Err(anyhow!("inference timeout must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within 0..=1"));
        }
        if !(0.0..=1.0).contains(&self.detection.duplicate_iou) {
            return Err(anyhow!("duplicate_iou must be within 0..=1"));
        }
        if self.alerts.cooldown.is_zero() {
            return Err(anyhow!("alert cooldown must be greater than zero"));
        }
        if self.alerts.min_humans == 0 || self.alerts.min_animals == 0 {
            return Err(anyhow!("minimum detection thresholds must be at least 1"));
        }
        if self.gps.poll_interval.is_zero() || self.gps.max_fix_age.is_zero() {
            return Err(anyhow!("gps poll interval and max fix age must be greater than zero"));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(anyhow!("dispatch max_attempts must be at least 1"));
        }
        if self.dispatch.base_backoff > self.dispatch.max_backoff {
            return Err(anyhow!(
                "dispatch base backoff ({}s) exceeds the backoff ceiling ({}s)",
                self.dispatch.base_backoff.as_secs(),
                self.dispatch.max_backoff.as_secs()
            ));
        }
        if self.evacuation_sites.is_empty() {
            return Err(anyhow!("at least one evacuation site must be configured"));
        }
        if self.evacuation_sites.iter().filter(|s| s.primary).count() > 1 {
            return Err(anyhow!("only one evacuation site may be marked primary"));
        }

        let mut contacts = Vec::with_capacity(self.emergency_contacts.len());
        for contact in &self.emergency_contacts {
            let normalized = normalize_number(contact)
                .ok_or_else(|| anyhow!("invalid emergency contact number: {}", contact))?;
            if !contacts.contains(&normalized) {
                contacts.push(normalized);
            }
        }
        self.emergency_contacts = contacts;

        if let Some(operator) = self.dispatch.operator_contact.take() {
            let normalized = normalize_number(&operator)
                .ok_or_else(|| anyhow!("invalid operator contact number: {}", operator))?;
            self.dispatch.operator_contact = Some(normalized);
        }

        if self.emergency_contacts.is_empty() {
            log::warn!("no emergency contacts configured; alerts will be journaled only");
        }
        Ok(())
    }
}

fn default_evacuation_site() -> EvacuationSite {
    EvacuationSite {
        name: "Emergency Shelter".to_string(),
        address: "Please configure evacuation site".to_string(),
        coordinates: None,
        primary: true,
    }
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
