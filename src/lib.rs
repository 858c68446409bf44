//! Field Sentinel
//!
//! Detection-to-alert pipeline for a battery-powered disaster response device.
//! Camera frames are inspected for humans, cats and dogs; sustained detections
//! become throttled, geotagged SMS alerts delivered through a cellular modem.
//!
//! # Architecture
//!
//! Three long-running tasks cooperate through shared, single-writer state:
//!
//! 1. **Capture loop** (`pipeline`): frame source -> inference -> aggregation -> throttle,
//!    composing and enqueueing alerts when the throttle fires.
//! 2. **GPS poller** (`geo`): polls the receiver on its own interval and caches the last fix.
//! 3. **Dispatch sender** (`dispatch`): drains the durable queue into the notification channel
//!    with retry and backoff.
//!
//! The `journal` observes every stage. Nothing in this crate is fatal to the process:
//! sensor failures skip a cycle, storage failures fall back to memory, and undeliverable
//! alerts end as `Abandoned` records an operator must see.
//!
//! # Module Structure
//!
//! - `frame` / `ingest`: frame type and camera sources
//! - `detect`: detections, inference adapters, timeout-bounded inference worker
//! - `aggregate`, `throttle`, `alert`: the decision path
//! - `geo`, `modem`: GPS and SMS collaborators
//! - `dispatch`, `journal`: durable stores

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub mod aggregate;
pub mod alert;
pub mod config;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod geo;
pub mod ingest;
pub mod journal;
pub mod modem;
pub mod pipeline;
pub mod throttle;

pub use aggregate::{AggregatedCount, ClassTally, DetectionAggregator};
pub use alert::{Alert, AlertComposer, AlertId, AlertLocation};
pub use config::{EvacuationSite, SentinelConfig};
pub use detect::{BoundingBox, Detection, InferenceAdapter, InferenceWorker, TargetClass};
pub use dispatch::{DispatchQueue, DispatchRecord, DispatchSender, DispatchStatus, RetryPolicy};
pub use error::SentinelError;
pub use frame::{Frame, FrameSource};
pub use geo::{Fix, FixCache, FixStatus, GeolocationService, GpsReading, GpsReceiver};
pub use journal::{Journal, JournalEntry};
pub use modem::{NotificationChannel, SendAck};
pub use pipeline::{CycleOutcome, DetectionLoop};
pub use throttle::{AlertThrottle, ThrottleDecision, ThrottleState};

/// Returns a unique shared-cache in-memory SQLite URI (used by tests and `--once` dry runs).
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:field_sentinel_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Sleeps for up to `duration`, waking early when `shutdown` is raised.
///
/// Returns `true` if shutdown was requested.
pub fn sleep_unless_shutdown(shutdown: &AtomicBool, duration: Duration) -> bool {
    const SLICE: Duration = Duration::from_millis(100);
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(SLICE));
    }
}

/// Joins `handle`, giving up after `grace`. Returns `false` if the thread was still running
/// and has been detached.
pub fn join_with_grace(handle: JoinHandle<()>, grace: Duration, name: &str) -> bool {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    if !handle.is_finished() {
        log::warn!("{}: still busy after {}ms grace; detaching", name, grace.as_millis());
        return false;
    }
    if handle.join().is_err() {
        log::error!("{}: thread panicked", name);
    }
    true
}

/// Converts a std duration to a chrono duration, saturating on overflow.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
