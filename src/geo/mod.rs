//! Geolocation.
//!
//! `GeolocationService` polls the receiver on its own thread and is the only writer of the
//! cached fix. Everyone else reads through a `FixCache`, which returns copies of the fix and
//! applies the staleness rule: a fix older than `max_age` is never reported as current.

mod cgpsinfo;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::GpsSettings;
use crate::error::SentinelError;
use crate::journal::{FixOutcome, Journal, JournalEntry};

pub use cgpsinfo::{parse_cgpsinfo, parse_coordinate};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    pub acquired_at: DateTime<Utc>,
}

impl Fix {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.acquired_at
    }
}

/// One position report from the receiver.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GpsReading {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    /// Receiver-reported fix quality; 0 means no usable fix.
    pub quality: u8,
}

/// GPS receiver collaborator.
///
/// `Ok(None)` means the receiver answered but has no fix. `Err` is a hardware or protocol
/// failure.
pub trait GpsReceiver: Send {
    fn read_position(&mut self) -> Result<Option<GpsReading>>;
}

/// What consumers see when they ask for a position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FixStatus {
    Fresh(Fix),
    /// The last fix is older than the allowed age; usable only when labelled as stale.
    Stale(Fix),
    Unavailable,
}

/// Read-only handle to the cached fix.
#[derive(Clone, Default)]
pub struct FixCache {
    slot: Arc<RwLock<Option<Fix>>>,
}

impl FixCache {
    pub fn last_known(&self) -> Option<Fix> {
        match self.slot.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn status(&self, max_age: Duration, now: DateTime<Utc>) -> FixStatus {
        match self.last_known() {
            None => FixStatus::Unavailable,
            Some(fix) if fix.age(now) > crate::chrono_duration(max_age) => FixStatus::Stale(fix),
            Some(fix) => FixStatus::Fresh(fix),
        }
    }

    /// Returns the cached fix if it is younger than `max_age`.
    pub fn get_fix(&self, max_age: Duration, now: DateTime<Utc>) -> Result<Fix, SentinelError> {
        match self.status(max_age, now) {
            FixStatus::Fresh(fix) => Ok(fix),
            FixStatus::Stale(fix) => Err(SentinelError::FixStale {
                age_secs: fix.age(now).num_seconds(),
            }),
            FixStatus::Unavailable => Err(SentinelError::FixUnavailable),
        }
    }

    fn store(&self, fix: Fix) {
        match self.slot.write() {
            Ok(mut guard) => *guard = Some(fix),
            Err(poisoned) => *poisoned.into_inner() = Some(fix),
        }
    }
}

pub struct GeolocationService {
    receiver: Box<dyn GpsReceiver>,
    cache: FixCache,
    settings: GpsSettings,
    journal: Journal,
}

impl GeolocationService {
    pub fn new(receiver: Box<dyn GpsReceiver>, settings: GpsSettings, journal: Journal) -> Self {
        Self {
            receiver,
            cache: FixCache::default(),
            settings,
            journal,
        }
    }

    pub fn cache(&self) -> FixCache {
        self.cache.clone()
    }

    /// Queries the receiver once and updates the cache on success.
    pub fn poll_once(&mut self, now: DateTime<Utc>) -> Option<Fix> {
        let result = self.receiver.read_position();
        let (entry, fix) = match result {
            Ok(Some(reading)) if reading.quality > 0 && valid_coordinates(&reading) => {
                let fix = Fix {
                    latitude: reading.latitude,
                    longitude: reading.longitude,
                    accuracy_m: reading.accuracy_m,
                    acquired_at: now,
                };
                self.cache.store(fix);
                log::debug!(
                    "gps: fix {:.5}, {:.5} (±{}m)",
                    fix.latitude,
                    fix.longitude,
                    fix.accuracy_m
                );
                (
                    JournalEntry::FixAttempt {
                        at: now,
                        outcome: FixOutcome::Acquired,
                        latitude: Some(fix.latitude),
                        longitude: Some(fix.longitude),
                        accuracy_m: Some(fix.accuracy_m),
                        detail: None,
                    },
                    Some(fix),
                )
            }
            Ok(Some(reading)) => (
                JournalEntry::FixAttempt {
                    at: now,
                    outcome: FixOutcome::NoFix,
                    latitude: None,
                    longitude: None,
                    accuracy_m: None,
                    detail: Some(format!(
                        "discarded reading (quality {}, {}, {})",
                        reading.quality, reading.latitude, reading.longitude
                    )),
                },
                None,
            ),
            Ok(None) => (
                JournalEntry::FixAttempt {
                    at: now,
                    outcome: FixOutcome::NoFix,
                    latitude: None,
                    longitude: None,
                    accuracy_m: None,
                    detail: None,
                },
                None,
            ),
            Err(err) => {
                log::warn!("gps: receiver error: {:#}", err);
                (
                    JournalEntry::FixAttempt {
                        at: now,
                        outcome: FixOutcome::Error,
                        latitude: None,
                        longitude: None,
                        accuracy_m: None,
                        detail: Some(format!("{:#}", err)),
                    },
                    None,
                )
            }
        };
        self.journal.record(entry);
        fix
    }

    /// Runs the polling loop on its own thread until `shutdown` is raised.
    pub fn spawn(mut self, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name("gps-poller".to_string())
            .spawn(move || {
                log::info!(
                    "gps: polling every {}s",
                    self.settings.poll_interval.as_secs()
                );
                loop {
                    self.poll_once(Utc::now());
                    if crate::sleep_unless_shutdown(&shutdown, self.settings.poll_interval) {
                        break;
                    }
                }
                log::info!("gps: poller stopped");
            })?;
        Ok(handle)
    }
}

fn valid_coordinates(reading: &GpsReading) -> bool {
    reading.latitude.is_finite()
        && reading.longitude.is_finite()
        && (-90.0..=90.0).contains(&reading.latitude)
        && (-180.0..=180.0).contains(&reading.longitude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use chrono::TimeZone;
    use std::collections::VecDeque;

    struct ScriptedReceiver(VecDeque<Result<Option<GpsReading>>>);

    impl GpsReceiver for ScriptedReceiver {
        fn read_position(&mut self) -> Result<Option<GpsReading>> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    fn reading(lat: f64, lon: f64) -> GpsReading {
        GpsReading {
            latitude: lat,
            longitude: lon,
            accuracy_m: 8.0,
            quality: 1,
        }
    }

    fn settings() -> GpsSettings {
        GpsSettings {
            poll_interval: Duration::from_secs(30),
            max_fix_age: Duration::from_secs(120),
            nominal_accuracy_m: 10.0,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn service(script: Vec<Result<Option<GpsReading>>>) -> (GeolocationService, Journal) {
        let journal = Journal::in_memory();
        let service = GeolocationService::new(
            Box::new(ScriptedReceiver(script.into())),
            settings(),
            journal.clone(),
        );
        (service, journal)
    }

    #[test]
    fn never_acquired_is_unavailable() {
        let (mut svc, _journal) = service(vec![Ok(None), Ok(None)]);
        let cache = svc.cache();
        svc.poll_once(at(0));
        assert_eq!(cache.status(Duration::from_secs(120), at(1)), FixStatus::Unavailable);
        assert_eq!(
            cache.get_fix(Duration::from_secs(120), at(1)),
            Err(SentinelError::FixUnavailable)
        );
    }

    #[test]
    fn fix_goes_stale_after_max_age() {
        let (mut svc, _journal) = service(vec![Ok(Some(reading(13.6218, 123.1945)))]);
        let cache = svc.cache();
        svc.poll_once(at(0));
        let max_age = Duration::from_secs(120);
        assert!(matches!(cache.status(max_age, at(120)), FixStatus::Fresh(_)));
        assert!(matches!(cache.status(max_age, at(121)), FixStatus::Stale(_)));
        assert_eq!(
            cache.get_fix(max_age, at(300)),
            Err(SentinelError::FixStale { age_secs: 300 })
        );
    }

    #[test]
    fn failed_polls_keep_the_last_fix() {
        let (mut svc, journal) = service(vec![
            Ok(Some(reading(1.0, 2.0))),
            Err(anyhow!("serial timeout")),
            Ok(None),
        ]);
        let cache = svc.cache();
        svc.poll_once(at(0));
        svc.poll_once(at(30));
        svc.poll_once(at(60));
        assert_eq!(cache.last_known().map(|f| f.acquired_at), Some(at(0)));

        let outcomes: Vec<FixOutcome> = journal
            .read_all()
            .unwrap()
            .into_iter()
            .filter_map(|e| match e {
                JournalEntry::FixAttempt { outcome, .. } => Some(outcome),
                _ => None,
            })
            .collect();
        assert_eq!(
            outcomes,
            vec![FixOutcome::Acquired, FixOutcome::Error, FixOutcome::NoFix]
        );
    }

    #[test]
    fn implausible_readings_are_not_cached() {
        let (mut svc, _journal) = service(vec![
            Ok(Some(reading(f64::NAN, 2.0))),
            Ok(Some(GpsReading {
                quality: 0,
                ..reading(1.0, 2.0)
            })),
        ]);
        let cache = svc.cache();
        assert!(svc.poll_once(at(0)).is_none());
        assert!(svc.poll_once(at(1)).is_none());
        assert!(cache.last_known().is_none());
    }

    #[test]
    fn spawned_poller_stops_on_shutdown() {
        let (svc, _journal) = service(vec![Ok(Some(reading(1.0, 2.0)))]);
        let cache = svc.cache();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = svc.spawn(shutdown.clone()).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while cache.last_known().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        handle.join().unwrap();
        assert!(cache.last_known().is_some());
    }
}
