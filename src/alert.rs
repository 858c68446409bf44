//! Alert composition.
//!
//! `AlertComposer::compose` is a pure function of counts, fix status, site configuration and
//! the current time. The SMS body layout is fixed (format version 1):
//!
//! ```text
//! 🚨 DISASTER RESPONSE ALERT 🚨
//! Detected: {n} people, {n} cat(s), {n} dog(s)
//! Location: {lat}, {lon}
//! Google Maps: https://maps.google.com/?q={lat},{lon}
//! Evacuate to: {site_name}
//! Address: {site_address}
//! Time: {YYYY-MM-DD HH:MM:SS}
//! ```
//!
//! A stale fix is labelled with its acquisition time. Without any fix the two location
//! lines become `Location unavailable`; coordinates are never invented.

use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, Local, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::aggregate::AggregatedCount;
use crate::config::EvacuationSite;
use crate::geo::{Fix, FixStatus};

pub const ALERT_FORMAT_VERSION: u32 = 1;

const HEADER: &str = "🚨 DISASTER RESPONSE ALERT 🚨";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(String);

impl AlertId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        AlertId(format!("alert:{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AlertId {
    fn from(value: String) -> Self {
        AlertId(value)
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertLocation {
    Current { fix: Fix },
    LastKnown { fix: Fix },
    Unavailable,
}

impl AlertLocation {
    pub fn fix(&self) -> Option<&Fix> {
        match self {
            AlertLocation::Current { fix } | AlertLocation::LastKnown { fix } => Some(fix),
            AlertLocation::Unavailable => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AlertLocation::Current { .. } => "current",
            AlertLocation::LastKnown { .. } => "last_known",
            AlertLocation::Unavailable => "unavailable",
        }
    }
}

impl From<FixStatus> for AlertLocation {
    fn from(status: FixStatus) -> Self {
        match status {
            FixStatus::Fresh(fix) => AlertLocation::Current { fix },
            FixStatus::Stale(fix) => AlertLocation::LastKnown { fix },
            FixStatus::Unavailable => AlertLocation::Unavailable,
        }
    }
}

/// A composed alert. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub format_version: u32,
    pub counts: AggregatedCount,
    pub location: AlertLocation,
    pub evacuation_site: EvacuationSite,
    pub created_at: DateTime<Utc>,
    pub body: String,
}

pub struct AlertComposer {
    sites: Vec<EvacuationSite>,
    offset: Option<FixedOffset>,
}

impl AlertComposer {
    /// `utc_offset_minutes` fixes the zone of the `Time:` line; `None` uses the device zone.
    pub fn new(sites: Vec<EvacuationSite>, utc_offset_minutes: Option<i32>) -> Result<Self> {
        if sites.is_empty() {
            return Err(anyhow!("alert composer needs at least one evacuation site"));
        }
        let offset = match utc_offset_minutes {
            Some(minutes) => Some(
                minutes
                    .checked_mul(60)
                    .and_then(FixedOffset::east_opt)
                    .ok_or_else(|| anyhow!("invalid UTC offset: {} minutes", minutes))?,
            ),
            None => None,
        };
        Ok(Self { sites, offset })
    }

    pub fn compose(
        &self,
        counts: &AggregatedCount,
        fix: FixStatus,
        now: DateTime<Utc>,
    ) -> Alert {
        self.compose_with_id(AlertId::generate(), counts, fix, now)
    }

    pub fn compose_with_id(
        &self,
        id: AlertId,
        counts: &AggregatedCount,
        fix: FixStatus,
        now: DateTime<Utc>,
    ) -> Alert {
        let location = AlertLocation::from(fix);
        let site = self.select_site(location.fix()).clone();
        let body = self.render_body(counts, &location, &site, now);
        Alert {
            id,
            format_version: ALERT_FORMAT_VERSION,
            counts: counts.clone(),
            location,
            evacuation_site: site,
            created_at: now,
            body,
        }
    }

    /// The primary site, else the nearest site with coordinates, else the first listed.
    pub fn select_site(&self, fix: Option<&Fix>) -> &EvacuationSite {
        if let Some(primary) = self.sites.iter().find(|s| s.primary) {
            return primary;
        }
        let nearest = fix.and_then(|fix| {
            self.sites
                .iter()
                .filter_map(|site| {
                    site.coordinates
                        .map(|[lat, lon]| (site, haversine_m(fix.latitude, fix.longitude, lat, lon)))
                })
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(site, _)| site)
        });
        nearest.unwrap_or(&self.sites[0])
    }

    fn render_time(&self, at: DateTime<Utc>) -> String {
        match self.offset {
            Some(offset) => at.with_timezone(&offset).format(TIME_FORMAT).to_string(),
            None => at.with_timezone(&Local).format(TIME_FORMAT).to_string(),
        }
    }

    fn render_body(
        &self,
        counts: &AggregatedCount,
        location: &AlertLocation,
        site: &EvacuationSite,
        now: DateTime<Utc>,
    ) -> String {
        let mut lines = vec![
            HEADER.to_string(),
            format!(
                "Detected: {} people, {} cat(s), {} dog(s)",
                counts.peak.human, counts.peak.cat, counts.peak.dog
            ),
        ];
        match location {
            AlertLocation::Current { fix } => {
                lines.push(format!("Location: {}, {}", fix.latitude, fix.longitude));
                lines.push(maps_line(fix));
            }
            AlertLocation::LastKnown { fix } => {
                lines.push(format!(
                    "Location: {}, {} (last known fix {})",
                    fix.latitude,
                    fix.longitude,
                    self.render_time(fix.acquired_at)
                ));
                lines.push(maps_line(fix));
            }
            AlertLocation::Unavailable => lines.push("Location unavailable".to_string()),
        }
        lines.push(format!("Evacuate to: {}", site.name));
        lines.push(format!("Address: {}", site.address));
        lines.push(format!("Time: {}", self.render_time(now)));
        lines.join("\n")
    }
}

fn maps_line(fix: &Fix) -> String {
    format!(
        "Google Maps: https://maps.google.com/?q={},{}",
        fix.latitude, fix.longitude
    )
}

fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ClassTally;
    use chrono::TimeZone;

    fn site(name: &str, address: &str, coordinates: Option<[f64; 2]>, primary: bool) -> EvacuationSite {
        EvacuationSite {
            name: name.to_string(),
            address: address.to_string(),
            coordinates,
            primary,
        }
    }

    fn counts(human: u32, cat: u32, dog: u32, now: DateTime<Utc>) -> AggregatedCount {
        AggregatedCount {
            human,
            cat,
            dog,
            peak: ClassTally { human, cat, dog },
            frames: 1,
            window_start: now - chrono::Duration::seconds(10),
            window_end: now,
        }
    }

    fn manila(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 11, 17, h, m, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn fix(lat: f64, lon: f64, at: DateTime<Utc>) -> Fix {
        Fix {
            latitude: lat,
            longitude: lon,
            accuracy_m: 10.0,
            acquired_at: at,
        }
    }

    fn composer(sites: Vec<EvacuationSite>) -> AlertComposer {
        AlertComposer::new(sites, Some(8 * 60)).unwrap()
    }

    #[test]
    fn renders_the_exact_alert_text() {
        let now = manila(14, 5, 9);
        let composer = composer(vec![site(
            "Naga City GSIS Gym",
            "Panganiban Drive, Naga City",
            None,
            true,
        )]);
        // Window tallies summed over five frames; the body shows the per-frame peak.
        let mut window = counts(3, 1, 2, now);
        window.human = 11;
        window.cat = 4;
        window.dog = 7;
        window.frames = 5;
        let alert = composer.compose(
            &window,
            FixStatus::Fresh(fix(13.6218, 123.1945, now)),
            now,
        );
        assert_eq!(
            alert.body,
            "🚨 DISASTER RESPONSE ALERT 🚨\n\
             Detected: 3 people, 1 cat(s), 2 dog(s)\n\
             Location: 13.6218, 123.1945\n\
             Google Maps: https://maps.google.com/?q=13.6218,123.1945\n\
             Evacuate to: Naga City GSIS Gym\n\
             Address: Panganiban Drive, Naga City\n\
             Time: 2024-11-17 14:05:09"
        );
        assert_eq!(alert.format_version, ALERT_FORMAT_VERSION);
        assert!(alert.id.as_str().starts_with("alert:"));
        assert_eq!(alert.id.as_str().len(), "alert:".len() + 32);
    }

    #[test]
    fn missing_fix_never_invents_coordinates() {
        let now = manila(9, 0, 0);
        let alert = composer(vec![site("Gym", "Main St", None, false)]).compose(
            &counts(1, 0, 0, now),
            FixStatus::Unavailable,
            now,
        );
        let lines: Vec<&str> = alert.body.lines().collect();
        assert_eq!(lines[2], "Location unavailable");
        assert_eq!(lines[3], "Evacuate to: Gym");
        assert!(!alert.body.contains("maps.google.com"));
        assert_eq!(alert.location, AlertLocation::Unavailable);
    }

    #[test]
    fn stale_fix_is_labelled() {
        let now = manila(10, 30, 0);
        let acquired = manila(10, 0, 0);
        let alert = composer(vec![site("Gym", "Main St", None, true)]).compose(
            &counts(0, 0, 1, now),
            FixStatus::Stale(fix(13.5, 123.25, acquired)),
            now,
        );
        assert!(alert
            .body
            .contains("Location: 13.5, 123.25 (last known fix 2024-11-17 10:00:00)"));
        assert!(alert.body.contains("?q=13.5,123.25"));
        assert!(matches!(alert.location, AlertLocation::LastKnown { .. }));
    }

    #[test]
    fn body_reports_peak_counts_not_window_sums() {
        let now = manila(8, 0, 0);
        let mut c = counts(1, 0, 0, now);
        c.human = 5;
        let alert = composer(vec![site("Gym", "Main St", None, true)]).compose(
            &c,
            FixStatus::Unavailable,
            now,
        );
        assert!(alert.body.contains("Detected: 1 people, 0 cat(s), 0 dog(s)"));
        assert_eq!(alert.counts.human, 5);
    }

    #[test]
    fn site_selection_prefers_primary_then_nearest() {
        let now = manila(8, 0, 0);
        let here = fix(13.62, 123.19, now);
        let far = site("Far", "a", Some([14.6, 121.0]), false);
        let near = site("Near", "b", Some([13.63, 123.18]), false);
        let bare = site("Bare", "c", None, false);

        let c = composer(vec![bare.clone(), far.clone(), near.clone()]);
        assert_eq!(c.select_site(Some(&here)).name, "Near");
        assert_eq!(c.select_site(None).name, "Bare");

        let mut primary = far;
        primary.primary = true;
        let c = composer(vec![near, primary]);
        assert_eq!(c.select_site(Some(&here)).name, "Far");
    }

    #[test]
    fn composition_is_deterministic_for_a_given_id() {
        let now = manila(8, 0, 0);
        let c = composer(vec![site("Gym", "Main St", None, true)]);
        let id = AlertId::from("alert:fixed".to_string());
        let a = c.compose_with_id(id.clone(), &counts(2, 0, 0, now), FixStatus::Unavailable, now);
        let b = c.compose_with_id(id, &counts(2, 0, 0, now), FixStatus::Unavailable, now);
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_empty_sites_and_bad_offsets() {
        assert!(AlertComposer::new(Vec::new(), None).is_err());
        assert!(AlertComposer::new(vec![site("Gym", "x", None, true)], Some(24 * 60)).is_err());
    }

    #[test]
    fn haversine_is_reasonable() {
        // Naga City to Manila is roughly 260 km.
        let d = haversine_m(13.6218, 123.1945, 14.5995, 120.9842);
        assert!((250_000.0..280_000.0).contains(&d), "{}", d);
    }
}
