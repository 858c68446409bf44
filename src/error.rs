//! Pipeline error taxonomy.
//!
//! Every condition here is recoverable. Sensor and inference failures skip a cycle,
//! send failures are retried, storage failures degrade to memory. `SendAbandoned`
//! is the one condition an operator must eventually see.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SentinelError {
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("inference degraded: {0}")]
    InferenceDegraded(String),

    #[error("no GPS fix available")]
    FixUnavailable,

    #[error("GPS fix is stale ({age_secs}s old)")]
    FixStale { age_secs: i64 },

    #[error("send to {destination} failed: {reason}")]
    SendFailure { destination: String, reason: String },

    #[error("alert {alert_id} to {destination} abandoned after {attempts} attempts")]
    SendAbandoned {
        alert_id: String,
        destination: String,
        attempts: u32,
    },

    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl SentinelError {
    /// Stable code recorded in the journal.
    pub fn code(&self) -> &'static str {
        match self {
            SentinelError::SourceUnavailable(_) => "SOURCE_UNAVAILABLE",
            SentinelError::InferenceDegraded(_) => "INFERENCE_DEGRADED",
            SentinelError::FixUnavailable => "FIX_UNAVAILABLE",
            SentinelError::FixStale { .. } => "FIX_STALE",
            SentinelError::SendFailure { .. } => "SEND_FAILURE",
            SentinelError::SendAbandoned { .. } => "SEND_ABANDONED",
            SentinelError::StorageFailure(_) => "STORAGE_FAILURE",
        }
    }

    pub fn storage(err: &anyhow::Error) -> Self {
        SentinelError::StorageFailure(format!("{err:#}"))
    }
}
