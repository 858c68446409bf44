//! Local journal.
//!
//! Append-only, hash-chained record of every detection cycle, fix attempt, composed alert
//! and dispatch state transition. The journal never fails its caller: when the durable store
//! rejects a write, the journal logs loudly, buffers entries in a bounded in-memory store that
//! continues the same chain, and records a `Degraded` entry there. The durable store is retried
//! every few records and on every `flush`; once it accepts writes again the buffer is replayed
//! into it and a `Recovered` entry closes the gap.

mod store;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::aggregate::{AggregatedCount, ClassTally};
use crate::dispatch::DispatchStatus;
use crate::error::SentinelError;

pub use store::{
    hash_entry, verify_chain, verify_chain_with, ChainReport, InMemoryJournalStore,
    JournalStore, SqliteJournalStore,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    Cycle {
        at: DateTime<Utc>,
        sequence: u64,
        frame: ClassTally,
        raw_detections: usize,
        mean_confidence: Option<f32>,
        counts: AggregatedCount,
        decision: String,
    },
    CycleSkipped {
        at: DateTime<Utc>,
        code: String,
        reason: String,
    },
    FixAttempt {
        at: DateTime<Utc>,
        outcome: FixOutcome,
        latitude: Option<f64>,
        longitude: Option<f64>,
        accuracy_m: Option<f64>,
        detail: Option<String>,
    },
    AlertComposed {
        at: DateTime<Utc>,
        alert_id: String,
        format_version: u32,
        reason: String,
        location: String,
        site: String,
        recipients: usize,
    },
    Dispatch {
        at: DateTime<Utc>,
        record_id: i64,
        alert_id: String,
        destination: String,
        status: DispatchStatus,
        attempts: u32,
        event: String,
        detail: Option<String>,
    },
    Degraded {
        at: DateTime<Utc>,
        code: String,
        detail: String,
    },
    Recovered {
        at: DateTime<Utc>,
        component: String,
        detail: String,
    },
    Network {
        at: DateTime<Utc>,
        registration: String,
        signal_dbm: Option<i32>,
        operator: Option<String>,
        sim_ready: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixOutcome {
    Acquired,
    NoFix,
    Error,
}

impl JournalEntry {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            JournalEntry::Cycle { at, .. }
            | JournalEntry::CycleSkipped { at, .. }
            | JournalEntry::FixAttempt { at, .. }
            | JournalEntry::AlertComposed { at, .. }
            | JournalEntry::Dispatch { at, .. }
            | JournalEntry::Degraded { at, .. }
            | JournalEntry::Recovered { at, .. }
            | JournalEntry::Network { at, .. } => *at,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JournalEntry::Cycle { .. } => "cycle",
            JournalEntry::CycleSkipped { .. } => "cycle_skipped",
            JournalEntry::FixAttempt { .. } => "fix_attempt",
            JournalEntry::AlertComposed { .. } => "alert_composed",
            JournalEntry::Dispatch { .. } => "dispatch",
            JournalEntry::Degraded { .. } => "degraded",
            JournalEntry::Recovered { .. } => "recovered",
            JournalEntry::Network { .. } => "network",
        }
    }

    pub fn skipped(at: DateTime<Utc>, err: &SentinelError) -> Self {
        JournalEntry::CycleSkipped {
            at,
            code: err.code().to_string(),
            reason: err.to_string(),
        }
    }

    pub fn degraded(at: DateTime<Utc>, err: &SentinelError) -> Self {
        JournalEntry::Degraded {
            at,
            code: err.code().to_string(),
            detail: err.to_string(),
        }
    }
}

/// Entries kept in memory while the durable store is unavailable.
pub const DEFAULT_FALLBACK_CAPACITY: usize = 10_000;
/// Records appended to the fallback between attempts to reach the durable store.
const RECOVERY_RETRY_EVERY: usize = 32;

type StoreOpener = Box<dyn FnMut() -> Result<Box<dyn JournalStore>> + Send>;

struct JournalInner {
    /// Durable store; `None` only if it never opened.
    store: Option<Box<dyn JournalStore>>,
    /// Present while degraded.
    fallback: Option<InMemoryJournalStore>,
    reopen: Option<StoreOpener>,
    degraded: Option<SentinelError>,
    capacity: usize,
    since_retry: usize,
    dropped: u64,
}

impl JournalInner {
    fn new(store: Option<Box<dyn JournalStore>>, reopen: Option<StoreOpener>) -> Self {
        Self {
            store,
            fallback: None,
            reopen,
            degraded: None,
            capacity: DEFAULT_FALLBACK_CAPACITY,
            since_retry: 0,
            dropped: 0,
        }
    }

    fn head(&self) -> [u8; 32] {
        match (&self.fallback, &self.store) {
            (Some(memory), _) => memory.head(),
            (None, Some(store)) => store.head(),
            (None, None) => [0u8; 32],
        }
    }

    fn degrade(&mut self, failure: SentinelError, at: DateTime<Utc>) {
        if self.fallback.is_none() {
            self.fallback = Some(InMemoryJournalStore::continuing(self.head()));
        }
        self.since_retry = 0;
        self.buffer(&JournalEntry::degraded(at, &failure));
        self.degraded = Some(failure);
    }

    fn buffer(&mut self, entry: &JournalEntry) {
        let capacity = self.capacity;
        let Some(memory) = self.fallback.as_mut() else {
            return;
        };
        if memory.len() >= capacity {
            if self.dropped == 0 {
                log::error!(
                    "journal: in-memory buffer full ({} entries); dropping new entries",
                    capacity
                );
                // One entry past the cap so the gap itself is on the chain.
                let notice = JournalEntry::Degraded {
                    at: entry.at(),
                    code: "JOURNAL_OVERFLOW".to_string(),
                    detail: format!("buffer full at {} entries", capacity),
                };
                if let Err(err) = memory.append(&notice) {
                    log::error!("journal: in-memory append failed: {:#}", err);
                }
            }
            self.dropped += 1;
            return;
        }
        if let Err(err) = memory.append(entry) {
            log::error!("journal: in-memory append failed: {:#}", err);
        }
    }

    /// Replays the fallback buffer into the durable store. Returns `true` once not degraded.
    fn try_recover(&mut self) -> bool {
        self.since_retry = 0;
        let Some(memory) = self.fallback.as_mut() else {
            return true;
        };
        let mut pending = match memory.read_all() {
            Ok(entries) => entries,
            Err(err) => {
                log::error!("journal: cannot read fallback buffer: {:#}", err);
                return false;
            }
        };
        let buffered = pending.len();
        let now = Utc::now();
        if self.dropped > 0 {
            pending.push(JournalEntry::Degraded {
                at: now,
                code: "JOURNAL_OVERFLOW".to_string(),
                detail: format!(
                    "{} entries dropped while storage was unavailable",
                    self.dropped
                ),
            });
        }
        pending.push(JournalEntry::Recovered {
            at: now,
            component: "journal".to_string(),
            detail: format!("replayed {} buffered entries", buffered),
        });

        let fresh = match self.reopen.as_mut() {
            Some(open) => match open() {
                Ok(store) => Some(store),
                Err(err) => {
                    log::debug!("journal: store still unavailable: {:#}", err);
                    return false;
                }
            },
            None => None,
        };
        let replayed = match fresh {
            Some(mut store) => store.append_batch(&pending).map(|()| Some(store)),
            None => match self.store.as_mut() {
                Some(store) => store.append_batch(&pending).map(|()| None),
                None => return false,
            },
        };
        match replayed {
            Ok(replacement) => {
                if let Some(store) = replacement {
                    self.store = Some(store);
                }
                self.fallback = None;
                self.degraded = None;
                self.dropped = 0;
                log::warn!("journal: storage recovered; replayed {} entries", buffered);
                true
            }
            Err(err) => {
                log::debug!("journal: replay failed, staying in memory: {:#}", err);
                false
            }
        }
    }
}

/// Shared handle to the journal. Cheap to clone; all clones write to the same chain.
#[derive(Clone)]
pub struct Journal {
    inner: Arc<Mutex<JournalInner>>,
}

impl Journal {
    /// Opens the SQLite journal, buffering in memory until the database becomes usable.
    pub fn open(db_path: &str) -> Self {
        let path = db_path.to_string();
        let reopen: StoreOpener = Box::new(move || {
            SqliteJournalStore::open(&path).map(|store| Box::new(store) as Box<dyn JournalStore>)
        });
        match SqliteJournalStore::open(db_path) {
            Ok(store) => Self::from_inner(JournalInner::new(Some(Box::new(store)), Some(reopen))),
            Err(err) => {
                let failure = SentinelError::storage(&err);
                log::error!("journal: {}; buffering in memory", failure);
                let mut inner = JournalInner::new(None, Some(reopen));
                inner.degrade(failure, Utc::now());
                Self::from_inner(inner)
            }
        }
    }

    pub fn in_memory() -> Self {
        Self::with_store(Box::new(InMemoryJournalStore::default()))
    }

    /// Journal over `store`. After a failure the same store is retried.
    pub fn with_store(store: Box<dyn JournalStore>) -> Self {
        Self::from_inner(JournalInner::new(Some(store), None))
    }

    /// Caps the number of entries buffered while degraded.
    pub fn with_fallback_capacity(self, capacity: usize) -> Self {
        self.lock().capacity = capacity.max(1);
        self
    }

    fn from_inner(inner: JournalInner) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JournalInner> {
        // A panic while holding the lock leaves the store usable; keep journaling.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends an entry. Storage failures are never returned to the caller.
    pub fn record(&self, entry: JournalEntry) {
        let mut inner = self.lock();
        if inner.fallback.is_some() {
            inner.since_retry += 1;
            if inner.since_retry >= RECOVERY_RETRY_EVERY {
                inner.try_recover();
            }
        }
        if inner.fallback.is_none() {
            let Some(store) = inner.store.as_mut() else {
                return;
            };
            let Err(err) = store.append(&entry) else {
                return;
            };
            let failure = SentinelError::storage(&err);
            log::error!(
                "journal: {} backend failed ({}); buffering in memory",
                store.backend(),
                failure
            );
            inner.degrade(failure, entry.at());
        }
        inner.buffer(&entry);
    }

    /// Flushes the durable store, first trying to leave degraded mode.
    pub fn flush(&self) {
        let mut inner = self.lock();
        if inner.fallback.is_some() && !inner.try_recover() {
            log::warn!(
                "journal: still degraded; {} entries held in memory",
                inner.fallback.as_ref().map_or(0, InMemoryJournalStore::len)
            );
            return;
        }
        if let Some(store) = inner.store.as_mut() {
            if let Err(err) = store.flush() {
                log::warn!("journal: flush failed: {:#}", err);
            }
        }
    }

    /// The storage failure that forced the journal into memory, if any.
    pub fn degraded(&self) -> Option<SentinelError> {
        self.lock().degraded.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().degraded.is_some()
    }

    pub fn backend(&self) -> &'static str {
        let inner = self.lock();
        match (&inner.fallback, &inner.store) {
            (None, Some(store)) => store.backend(),
            _ => "memory",
        }
    }

    /// Entries of the active store: the durable one, or the fallback buffer while degraded.
    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        let mut inner = self.lock();
        let entries = match inner.fallback.as_mut() {
            Some(memory) => memory.read_all(),
            None => match inner.store.as_mut() {
                Some(store) => store.read_all(),
                None => Ok(Vec::new()),
            },
        };
        entries.map_err(|err| anyhow!("journal read failed: {:#}", err))
    }

    pub fn head(&self) -> [u8; 32] {
        self.lock().head()
    }
}
