//! Dispatch queue: durable, retrying delivery of alerts to the notification channel.
//!
//! Record lifecycle:
//!
//! ```text
//! Pending --send ok--> Sent
//!    |  ^
//!  fail  \__backoff elapsed__
//!    v                       \
//! Failed --------------------/
//!    |
//!  attempts == max
//!    v
//! Abandoned
//! ```
//!
//! A record is written before any send is attempted, and flagged in flight while a send is
//! outstanding. Records still in flight at startup had an attempt interrupted by a crash or
//! shutdown; `DispatchQueue::reconcile` counts that attempt and re-queues the record once.

mod queue;
mod sender;
mod store;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::alert::AlertId;
use crate::config::DispatchSettings;

pub use queue::DispatchQueue;
pub use sender::DispatchSender;
pub use store::{
    abandoned_records, status_counts, DispatchStore, InMemoryDispatchStore, SqliteDispatchStore,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Sent,
    /// The last attempt failed; waiting for its backoff to elapse.
    Failed,
    Abandoned,
}

impl DispatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::Sent => "sent",
            DispatchStatus::Failed => "failed",
            DispatchStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DispatchStatus::Sent | DispatchStatus::Abandoned)
    }
}

impl FromStr for DispatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DispatchStatus::Pending),
            "sent" => Ok(DispatchStatus::Sent),
            "failed" => Ok(DispatchStatus::Failed),
            "abandoned" => Ok(DispatchStatus::Abandoned),
            other => Err(anyhow!("unknown dispatch status '{}'", other)),
        }
    }
}

/// Delivery state of one alert to one destination.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchRecord {
    pub record_id: i64,
    pub alert_id: AlertId,
    pub destination: String,
    pub body: String,
    pub status: DispatchStatus,
    /// Send attempts made, including a successful one.
    pub attempts: u32,
    pub in_flight: bool,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl DispatchRecord {
    pub fn new(
        record_id: i64,
        alert_id: AlertId,
        destination: String,
        body: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id,
            alert_id,
            destination,
            body,
            status: DispatchStatus::Pending,
            attempts: 0,
            in_flight: false,
            enqueued_at: now,
            last_attempt_at: None,
            next_attempt_at: now,
            last_error: None,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && !self.in_flight && self.next_attempt_at <= now
    }
}

/// Retry ceiling and exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&DispatchSettings> for RetryPolicy {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_backoff: settings.base_backoff,
            max_backoff: settings.max_backoff,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th failed attempt: `base * 2^(failures-1)`, capped.
    pub fn backoff_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
