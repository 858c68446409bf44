//! Alert throttle.
//!
//! Two phases: `Idle` and `Cooldown`. An alert fires when the window counts meet the minimum
//! thresholds and one of the following holds:
//!
//! - no alert has fired yet,
//! - the cooldown since the last alert has elapsed,
//! - some class's peak per-frame count rose above its high-water mark since the last alert.
//!
//! Escalation compares peak per-frame counts rather than window sums. Window sums keep growing
//! while the same objects stay in view, so comparing them would re-fire every cycle.
//!
//! Purely in-memory; `evaluate` never fails.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::aggregate::{AggregatedCount, ClassTally};
use crate::config::AlertSettings;
use crate::detect::TargetClass;

#[derive(Clone, Debug)]
pub struct ThrottleSettings {
    pub min_humans: u32,
    pub min_animals: u32,
    pub cooldown: Duration,
}

impl From<&AlertSettings> for ThrottleSettings {
    fn from(settings: &AlertSettings) -> Self {
        Self {
            min_humans: settings.min_humans,
            min_animals: settings.min_animals,
            cooldown: settings.cooldown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottlePhase {
    Idle,
    Cooldown { until: DateTime<Utc> },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThrottleState {
    pub last_alert_at: Option<DateTime<Utc>>,
    pub last_alert_counts: Option<AggregatedCount>,
    /// Highest peak per-frame count of each class seen since the last alert.
    pub high_water: ClassTally,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FireReason {
    FirstAlert,
    CooldownElapsed,
    Escalation { classes: Vec<TargetClass> },
}

impl FireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FireReason::FirstAlert => "first_alert",
            FireReason::CooldownElapsed => "cooldown_elapsed",
            FireReason::Escalation { .. } => "escalation",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuppressReason {
    BelowThreshold,
    CoolingDown { remaining: Duration },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    Fire(FireReason),
    Suppress(SuppressReason),
}

impl ThrottleDecision {
    pub fn fired(&self) -> bool {
        matches!(self, ThrottleDecision::Fire(_))
    }
}

pub struct AlertThrottle {
    settings: ThrottleSettings,
    state: ThrottleState,
}

impl AlertThrottle {
    pub fn new(settings: ThrottleSettings) -> Self {
        Self {
            settings,
            state: ThrottleState::default(),
        }
    }

    pub fn state(&self) -> &ThrottleState {
        &self.state
    }

    pub fn phase(&self, now: DateTime<Utc>) -> ThrottlePhase {
        match self.state.last_alert_at {
            Some(last) => {
                let until = last + crate::chrono_duration(self.settings.cooldown);
                if now < until {
                    ThrottlePhase::Cooldown { until }
                } else {
                    ThrottlePhase::Idle
                }
            }
            None => ThrottlePhase::Idle,
        }
    }

    fn meets_threshold(&self, counts: &AggregatedCount) -> bool {
        counts.human >= self.settings.min_humans
            || counts.cat.saturating_add(counts.dog) >= self.settings.min_animals
    }

    /// Decides whether `counts` warrant a new alert, updating throttle state.
    pub fn evaluate(&mut self, counts: &AggregatedCount, now: DateTime<Utc>) -> ThrottleDecision {
        let escalated = counts.peak.exceeds(&self.state.high_water);
        let phase = self.phase(now);

        if !self.meets_threshold(counts) {
            self.track(counts);
            return ThrottleDecision::Suppress(SuppressReason::BelowThreshold);
        }

        let reason = match (self.state.last_alert_at, phase) {
            (None, _) => FireReason::FirstAlert,
            (Some(_), ThrottlePhase::Idle) => FireReason::CooldownElapsed,
            (Some(_), ThrottlePhase::Cooldown { until }) => {
                if escalated.is_empty() {
                    self.track(counts);
                    let remaining = (until - now).to_std().unwrap_or_default();
                    return ThrottleDecision::Suppress(SuppressReason::CoolingDown { remaining });
                }
                FireReason::Escalation { classes: escalated }
            }
        };

        self.state.last_alert_at = Some(now);
        self.state.last_alert_counts = Some(counts.clone());
        self.state.high_water = counts.peak;
        ThrottleDecision::Fire(reason)
    }

    fn track(&mut self, counts: &AggregatedCount) {
        if self.state.last_alert_at.is_some() {
            self.state.high_water = self.state.high_water.max(&counts.peak);
        }
    }
}
