use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

use super::store::{DispatchStore, InMemoryDispatchStore, SqliteDispatchStore};
use super::{DispatchRecord, DispatchStatus, RetryPolicy};
use crate::alert::Alert;
use crate::error::SentinelError;
use crate::journal::{Journal, JournalEntry};
use crate::modem::SendAck;

/// `claim_next` calls between attempts to leave degraded mode.
const RECOVERY_RETRY_EVERY: usize = 32;

type StoreOpener = Box<dyn FnMut() -> Result<Box<dyn DispatchStore>> + Send>;

struct QueueInner {
    /// Durable store; `None` only if it never opened.
    store: Option<Box<dyn DispatchStore>>,
    /// Present while degraded.
    fallback: Option<InMemoryDispatchStore>,
    reopen: Option<StoreOpener>,
    degraded: Option<SentinelError>,
    since_retry: usize,
}

impl QueueInner {
    fn new(store: Option<Box<dyn DispatchStore>>, reopen: Option<StoreOpener>) -> Self {
        Self {
            store,
            fallback: None,
            reopen,
            degraded: None,
            since_retry: 0,
        }
    }

    fn active(&mut self) -> &mut dyn DispatchStore {
        if self.fallback.is_none() {
            if let Some(store) = self.store.as_mut() {
                return &mut **store;
            }
        }
        self.fallback.get_or_insert_with(InMemoryDispatchStore::default)
    }
}

/// Shared handle to the dispatch store.
///
/// Every read-modify-write happens under one mutex, so the capture loop's enqueue and the
/// sender's state transitions never interleave. The lock is never held across a send.
///
/// When the durable store fails, records move to memory. The store is retried periodically;
/// on success the in-memory records are written back and the queue is durable again.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<Mutex<QueueInner>>,
    policy: RetryPolicy,
    journal: Journal,
}

impl DispatchQueue {
    /// Opens the SQLite-backed queue, falling back to memory if the database is unusable.
    pub fn open(db_path: &str, policy: RetryPolicy, journal: Journal) -> Self {
        let path = db_path.to_string();
        let reopen: StoreOpener = Box::new(move || {
            SqliteDispatchStore::open(&path)
                .map(|store| Box::new(store) as Box<dyn DispatchStore>)
        });
        match SqliteDispatchStore::open(db_path) {
            Ok(store) => {
                let inner = QueueInner::new(Some(Box::new(store)), Some(reopen));
                Self::from_inner(inner, policy, journal)
            }
            Err(err) => {
                let failure = SentinelError::storage(&err);
                log::error!(
                    "dispatch: {}; queue is volatile until the database recovers",
                    failure
                );
                journal.record(JournalEntry::degraded(Utc::now(), &failure));
                let mut inner = QueueInner::new(None, Some(reopen));
                inner.fallback = Some(InMemoryDispatchStore::default());
                inner.degraded = Some(failure);
                Self::from_inner(inner, policy, journal)
            }
        }
    }

    pub fn in_memory(policy: RetryPolicy, journal: Journal) -> Self {
        Self::with_store(Box::new(InMemoryDispatchStore::default()), policy, journal)
    }

    /// Queue over `store`. After a failure the same store is retried.
    pub fn with_store(store: Box<dyn DispatchStore>, policy: RetryPolicy, journal: Journal) -> Self {
        Self::from_inner(QueueInner::new(Some(store), None), policy, journal)
    }

    fn from_inner(inner: QueueInner, policy: RetryPolicy, journal: Journal) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
            policy,
            journal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().degraded.is_some()
    }

    pub fn backend(&self) -> &'static str {
        self.lock().active().backend()
    }

    /// Swaps a failing store for memory, carrying over what can still be read.
    fn degrade(&self, inner: &mut QueueInner, err: &anyhow::Error, carry: &[DispatchRecord]) {
        let failure = SentinelError::storage(err);
        if inner.fallback.is_some() {
            log::error!("dispatch: in-memory queue failed: {}", failure);
            return;
        }
        let backend = inner.store.as_ref().map_or("none", |store| store.backend());
        log::error!(
            "dispatch: {} store failed ({}); continuing with an in-memory queue",
            backend,
            failure
        );
        let mut salvaged = inner
            .store
            .as_mut()
            .and_then(|store| store.all().ok())
            .unwrap_or_default();
        for record in carry {
            match salvaged.iter_mut().find(|r| r.record_id == record.record_id) {
                Some(slot) => *slot = record.clone(),
                None => salvaged.push(record.clone()),
            }
        }
        inner.fallback = Some(InMemoryDispatchStore::from_records(salvaged));
        inner.degraded = Some(failure.clone());
        inner.since_retry = 0;
        self.journal
            .record(JournalEntry::degraded(Utc::now(), &failure));
    }

    /// Tries to move in-memory records back to the durable store. Returns `true` once the
    /// queue is durable again.
    ///
    /// Skipped while a record is in flight: restoring may renumber records, and the sender
    /// still holds the in-flight one by id.
    pub fn try_recover(&self) -> bool {
        let mut inner = self.lock();
        self.recover(&mut inner)
    }

    fn recover(&self, inner: &mut QueueInner) -> bool {
        inner.since_retry = 0;
        let Some(memory) = inner.fallback.as_ref() else {
            return true;
        };
        if memory.has_in_flight() {
            return false;
        }
        let alerts = memory.alerts().to_vec();
        let records = memory.records().to_vec();

        let fresh = match inner.reopen.as_mut() {
            Some(open) => match open() {
                Ok(store) => Some(store),
                Err(err) => {
                    log::debug!("dispatch: store still unavailable: {:#}", err);
                    return false;
                }
            },
            None => None,
        };
        let restored = match fresh {
            Some(mut store) => store.restore(&alerts, &records).map(|()| Some(store)),
            None => match inner.store.as_mut() {
                Some(store) => store.restore(&alerts, &records).map(|()| None),
                None => return false,
            },
        };
        match restored {
            Ok(replacement) => {
                if let Some(store) = replacement {
                    inner.store = Some(store);
                }
                inner.fallback = None;
                inner.degraded = None;
                let backend = inner.active().backend();
                log::warn!(
                    "dispatch: {} store recovered; {} records written back",
                    backend,
                    records.len()
                );
                self.journal.record(JournalEntry::Recovered {
                    at: Utc::now(),
                    component: "dispatch".to_string(),
                    detail: format!("{} records written back to {}", records.len(), backend),
                });
                true
            }
            Err(err) => {
                log::debug!("dispatch: restore failed, staying in memory: {:#}", err);
                false
            }
        }
    }

    /// Writes one `Pending` record per destination before anything is sent.
    pub fn enqueue(
        &self,
        alert: &Alert,
        destinations: &[String],
        now: DateTime<Utc>,
    ) -> Vec<DispatchRecord> {
        let mut inner = self.lock();
        let records = match inner.active().enqueue(alert, destinations, now) {
            Ok(records) => records,
            Err(err) => {
                self.degrade(&mut inner, &err, &[]);
                match inner.active().enqueue(alert, destinations, now) {
                    Ok(records) => records,
                    Err(err) => {
                        log::error!("dispatch: in-memory enqueue failed: {:#}", err);
                        Vec::new()
                    }
                }
            }
        };
        // Journaled under the lock: no record is claimable before its "enqueued" entry.
        for record in &records {
            self.journal_transition(record, "enqueued", None, now);
        }
        records
    }

    /// Takes the oldest ready record and marks it in flight.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Option<DispatchRecord> {
        let mut inner = self.lock();
        if inner.fallback.is_some() {
            inner.since_retry += 1;
            if inner.since_retry >= RECOVERY_RETRY_EVERY {
                self.recover(&mut inner);
            }
        }
        let ready = match inner.active().ready(now) {
            Ok(ready) => ready,
            Err(err) => {
                self.degrade(&mut inner, &err, &[]);
                inner.active().ready(now).unwrap_or_default()
            }
        };
        let mut record = ready.into_iter().next()?;
        record.status = DispatchStatus::Pending;
        record.in_flight = true;
        record.last_attempt_at = Some(now);
        self.persist(&mut inner, &record);
        drop(inner);

        let attempt = format!("attempt {}/{}", record.attempts + 1, self.policy.max_attempts);
        self.journal_transition(&record, "attempt", Some(attempt), now);
        Some(record)
    }

    /// Records a confirmed send.
    pub fn record_success(
        &self,
        mut record: DispatchRecord,
        ack: &SendAck,
        now: DateTime<Utc>,
    ) -> DispatchRecord {
        record.attempts = record.attempts.saturating_add(1);
        record.status = DispatchStatus::Sent;
        record.in_flight = false;
        record.last_error = None;
        self.persist(&mut self.lock(), &record);
        log::info!(
            "dispatch: {} sent to {} after {} attempt(s)",
            record.alert_id,
            record.destination,
            record.attempts
        );
        self.journal_transition(
            &record,
            "sent",
            Some(format!("message refs {:?}", ack.message_refs)),
            now,
        );
        record
    }

    /// Records a failed send: schedules a retry, or abandons the record at the ceiling.
    pub fn record_failure(
        &self,
        mut record: DispatchRecord,
        error: &SentinelError,
        now: DateTime<Utc>,
    ) -> DispatchRecord {
        record.attempts = record.attempts.saturating_add(1);
        record.in_flight = false;
        record.last_error = Some(error.to_string());
        self.settle_failure(&mut record, now);
        self.persist(&mut self.lock(), &record);
        self.report_failure(&record, "failed", now);
        record
    }

    fn settle_failure(&self, record: &mut DispatchRecord, now: DateTime<Utc>) {
        if self.policy.exhausted(record.attempts) {
            record.status = DispatchStatus::Abandoned;
        } else {
            record.status = DispatchStatus::Failed;
            record.next_attempt_at =
                now + crate::chrono_duration(self.policy.backoff_after(record.attempts));
        }
    }

    fn report_failure(&self, record: &DispatchRecord, event: &str, now: DateTime<Utc>) {
        if record.status == DispatchStatus::Abandoned {
            let abandoned = SentinelError::SendAbandoned {
                alert_id: record.alert_id.to_string(),
                destination: record.destination.clone(),
                attempts: record.attempts,
            };
            log::error!("dispatch: {} ({})", abandoned, abandoned.code());
            self.journal_transition(record, "abandoned", Some(abandoned.to_string()), now);
        } else {
            log::warn!(
                "dispatch: {} to {} {} (attempt {}/{}), retry at {}",
                record.alert_id,
                record.destination,
                event,
                record.attempts,
                self.policy.max_attempts,
                record.next_attempt_at
            );
            self.journal_transition(record, event, record.last_error.clone(), now);
        }
    }

    /// Resolves records left in flight by an interrupted run.
    ///
    /// Delivery of such a record is unknown. The interrupted attempt counts, and the record
    /// is re-queued once under the same alert id; at the retry ceiling it is abandoned
    /// instead. `Sent` records are never touched. Returns the number of records reconciled.
    pub fn reconcile(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let stranded: Vec<DispatchRecord> = match inner.active().all() {
            Ok(all) => all,
            Err(err) => {
                log::error!("dispatch: cannot read records to reconcile: {:#}", err);
                return 0;
            }
        }
        .into_iter()
        .filter(|r| r.in_flight && !r.status.is_terminal())
        .collect();

        let mut settled = Vec::with_capacity(stranded.len());
        for mut record in stranded {
            record.attempts = record.attempts.saturating_add(1);
            record.in_flight = false;
            record.last_error = Some("delivery unknown after restart".to_string());
            if self.policy.exhausted(record.attempts) {
                record.status = DispatchStatus::Abandoned;
            } else {
                record.status = DispatchStatus::Pending;
                record.next_attempt_at = now;
            }
            self.persist(&mut inner, &record);
            settled.push(record);
        }
        drop(inner);

        for record in &settled {
            if record.status == DispatchStatus::Abandoned {
                self.report_failure(record, "reconcile_resend", now);
            } else {
                log::warn!(
                    "dispatch: {} to {} was in flight at shutdown; re-sending once",
                    record.alert_id,
                    record.destination
                );
                self.journal_transition(record, "reconcile_resend", record.last_error.clone(), now);
            }
        }
        settled.len()
    }

    fn persist(&self, inner: &mut QueueInner, record: &DispatchRecord) {
        if let Err(err) = inner.active().update(record) {
            self.degrade(inner, &err, std::slice::from_ref(record));
        }
    }

    fn journal_transition(
        &self,
        record: &DispatchRecord,
        event: &str,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.journal.record(JournalEntry::Dispatch {
            at: now,
            record_id: record.record_id,
            alert_id: record.alert_id.to_string(),
            destination: record.destination.clone(),
            status: record.status,
            attempts: record.attempts,
            event: event.to_string(),
            detail,
        });
    }

    pub fn get(&self, record_id: i64) -> Result<Option<DispatchRecord>> {
        self.lock().active().get(record_id)
    }

    pub fn records(&self) -> Result<Vec<DispatchRecord>> {
        self.lock().active().all()
    }

    /// Records not yet `Sent` or `Abandoned`.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self
            .records()?
            .iter()
            .filter(|r| !r.status.is_terminal())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use crate::aggregate::AggregatedCount;
    use crate::alert::{AlertId, AlertLocation, ALERT_FORMAT_VERSION};
    use crate::config::EvacuationSite;
    use crate::journal::JournalStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    pub(crate) fn alert(id: &str) -> Alert {
        Alert {
            id: AlertId::from(id.to_string()),
            format_version: ALERT_FORMAT_VERSION,
            counts: AggregatedCount::empty(at(-10), at(0)),
            location: AlertLocation::Unavailable,
            evacuation_site: EvacuationSite {
                name: "Gym".into(),
                address: "Main St".into(),
                coordinates: None,
                primary: true,
            },
            created_at: at(0),
            body: format!("body of {}", id),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }

    fn failure() -> SentinelError {
        SentinelError::SendFailure {
            destination: "+639171234567".into(),
            reason: "no carrier".into(),
        }
    }

    fn sqlite_queue(uri: &str, max_attempts: u32) -> DispatchQueue {
        DispatchQueue::open(uri, policy(max_attempts), Journal::in_memory())
    }

    #[test]
    fn enqueue_is_written_before_any_send() -> Result<()> {
        let uri = crate::shared_memory_uri();
        let _keepalive = crate::open_db_connection(&uri)?;
        let queue = sqlite_queue(&uri, 5);
        let records = queue.enqueue(&alert("alert:a"), &["+639171234567".into()], at(0));
        assert_eq!(records.len(), 1);

        // A second handle on the same database sees the pending record.
        let reopened = sqlite_queue(&uri, 5);
        let stored = reopened.records()?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, DispatchStatus::Pending);
        assert_eq!(stored[0].attempts, 0);
        assert_eq!(stored[0].body, "body of alert:a");
        Ok(())
    }

    #[test]
    fn one_record_per_contact_and_no_duplicates() -> Result<()> {
        let queue = DispatchQueue::in_memory(policy(5), Journal::in_memory());
        let contacts = vec!["+639171234567".to_string(), "09171234567".to_string()];
        assert_eq!(queue.enqueue(&alert("alert:a"), &contacts, at(0)).len(), 2);
        assert_eq!(queue.enqueue(&alert("alert:a"), &contacts, at(1)).len(), 0);
        assert_eq!(queue.pending_count()?, 2);
        Ok(())
    }

    #[test]
    fn failures_back_off_then_abandon() -> Result<()> {
        let queue = DispatchQueue::in_memory(policy(3), Journal::in_memory());
        queue.enqueue(&alert("alert:a"), &["+639171234567".into()], at(0));

        let r = queue.claim_next(at(0)).expect("ready");
        let r = queue.record_failure(r, &failure(), at(0));
        assert_eq!((r.status, r.attempts), (DispatchStatus::Failed, 1));
        assert_eq!(r.next_attempt_at, at(5));
        assert!(queue.claim_next(at(4)).is_none());

        let r = queue.claim_next(at(5)).expect("ready after backoff");
        let r = queue.record_failure(r, &failure(), at(5));
        assert_eq!(r.next_attempt_at, at(15));

        let r = queue.claim_next(at(15)).expect("ready after backoff");
        let r = queue.record_failure(r, &failure(), at(15));
        assert_eq!((r.status, r.attempts), (DispatchStatus::Abandoned, 3));
        assert!(queue.claim_next(at(10_000)).is_none());
        assert_eq!(queue.pending_count()?, 0);
        Ok(())
    }

    #[test]
    fn a_backing_off_record_does_not_block_later_ones() {
        let queue = DispatchQueue::in_memory(policy(5), Journal::in_memory());
        queue.enqueue(&alert("alert:a"), &["+639171234567".into()], at(0));
        queue.enqueue(&alert("alert:b"), &["+639171234567".into()], at(0));

        let a = queue.claim_next(at(0)).unwrap();
        assert_eq!(a.alert_id.as_str(), "alert:a");
        queue.record_failure(a, &failure(), at(0));

        let b = queue.claim_next(at(1)).unwrap();
        assert_eq!(b.alert_id.as_str(), "alert:b");
    }

    #[test]
    fn claimed_records_are_not_handed_out_twice() {
        let queue = DispatchQueue::in_memory(policy(5), Journal::in_memory());
        queue.enqueue(&alert("alert:a"), &["+639171234567".into()], at(0));
        assert!(queue.claim_next(at(0)).is_some());
        assert!(queue.claim_next(at(0)).is_none());
    }

    #[test]
    fn reconcile_requeues_in_flight_records_once() -> Result<()> {
        let uri = crate::shared_memory_uri();
        let _keepalive = crate::open_db_connection(&uri)?;
        let queue = sqlite_queue(&uri, 5);
        queue.enqueue(&alert("alert:a"), &["+639171234567".into()], at(0));
        queue.enqueue(&alert("alert:b"), &["+639171234567".into()], at(0));
        let sent = queue.claim_next(at(0)).unwrap();
        queue.record_success(sent, &SendAck { message_refs: vec![1] }, at(1));
        // Crash while alert:b is being sent.
        let _ = queue.claim_next(at(2)).unwrap();
        drop(queue);

        let restarted = sqlite_queue(&uri, 5);
        assert_eq!(restarted.reconcile(at(100)), 1);
        let records = restarted.records()?;
        assert_eq!(records[0].status, DispatchStatus::Sent);
        assert_eq!(records[1].status, DispatchStatus::Pending);
        assert_eq!(records[1].attempts, 1);
        assert!(!records[1].in_flight);

        // Only alert:b is re-sent; reconciling again is a no-op.
        assert_eq!(restarted.reconcile(at(101)), 0);
        let again = restarted.claim_next(at(101)).unwrap();
        assert_eq!(again.alert_id.as_str(), "alert:b");
        assert!(restarted.claim_next(at(101)).is_none());
        Ok(())
    }

    #[test]
    fn reconcile_abandons_at_the_ceiling() {
        let queue = DispatchQueue::in_memory(policy(1), Journal::in_memory());
        queue.enqueue(&alert("alert:a"), &["+639171234567".into()], at(0));
        let _ = queue.claim_next(at(0)).unwrap();
        assert_eq!(queue.reconcile(at(5)), 1);
        let records = queue.records().unwrap();
        assert_eq!(records[0].status, DispatchStatus::Abandoned);
    }

    struct FailingStore;

    impl DispatchStore for FailingStore {
        fn enqueue(&mut self, _: &Alert, _: &[String], _: DateTime<Utc>) -> Result<Vec<DispatchRecord>> {
            Err(anyhow!("database is locked"))
        }
        fn ready(&mut self, _: DateTime<Utc>) -> Result<Vec<DispatchRecord>> {
            Err(anyhow!("database is locked"))
        }
        fn get(&mut self, _: i64) -> Result<Option<DispatchRecord>> {
            Err(anyhow!("database is locked"))
        }
        fn update(&mut self, _: &DispatchRecord) -> Result<()> {
            Err(anyhow!("database is locked"))
        }
        fn all(&mut self) -> Result<Vec<DispatchRecord>> {
            Err(anyhow!("database is locked"))
        }
        fn restore(&mut self, _: &[Alert], _: &[DispatchRecord]) -> Result<()> {
            Err(anyhow!("database is locked"))
        }
        fn backend(&self) -> &'static str {
            "failing"
        }
    }

    #[test]
    fn storage_failure_degrades_to_memory() {
        let journal = Journal::in_memory();
        let queue = DispatchQueue::with_store(Box::new(FailingStore), policy(5), journal.clone());
        let records = queue.enqueue(&alert("alert:a"), &["+639171234567".into()], at(0));
        assert_eq!(records.len(), 1);
        assert!(queue.is_degraded());
        assert_eq!(queue.backend(), "memory");
        assert!(queue.claim_next(at(0)).is_some());
        assert!(journal
            .read_all()
            .unwrap()
            .iter()
            .any(|e| e.kind() == "degraded"));
    }

    /// Memory store that can be switched into failing.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: Arc<Mutex<InMemoryDispatchStore>>,
        failing: Arc<AtomicBool>,
    }

    impl FlakyStore {
        fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn store(&self) -> Result<MutexGuard<'_, InMemoryDispatchStore>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(anyhow!("disk I/O error"));
            }
            Ok(self.inner.lock().unwrap())
        }
    }

    impl DispatchStore for FlakyStore {
        fn enqueue(
            &mut self,
            alert: &Alert,
            destinations: &[String],
            now: DateTime<Utc>,
        ) -> Result<Vec<DispatchRecord>> {
            self.store()?.enqueue(alert, destinations, now)
        }
        fn ready(&mut self, now: DateTime<Utc>) -> Result<Vec<DispatchRecord>> {
            self.store()?.ready(now)
        }
        fn get(&mut self, record_id: i64) -> Result<Option<DispatchRecord>> {
            self.store()?.get(record_id)
        }
        fn update(&mut self, record: &DispatchRecord) -> Result<()> {
            self.store()?.update(record)
        }
        fn all(&mut self) -> Result<Vec<DispatchRecord>> {
            self.store()?.all()
        }
        fn restore(&mut self, alerts: &[Alert], records: &[DispatchRecord]) -> Result<()> {
            self.store()?.restore(alerts, records)
        }
        fn backend(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn recovered_store_receives_records_kept_in_memory() -> Result<()> {
        let store = FlakyStore::default();
        let journal = Journal::in_memory();
        let queue = DispatchQueue::with_store(Box::new(store.clone()), policy(5), journal.clone());
        queue.enqueue(&alert("alert:a"), &["+639171234567".into()], at(0));
        store.fail(true);
        queue.enqueue(&alert("alert:b"), &["+639171234567".into()], at(1));
        assert!(queue.is_degraded());

        let b = queue.claim_next(at(1)).expect("alert:b is ready in memory");
        assert_eq!(b.alert_id.as_str(), "alert:b");
        store.fail(false);
        assert!(!queue.try_recover(), "an in-flight record holds recovery back");
        queue.record_success(b, &SendAck { message_refs: vec![9] }, at(2));

        assert!(queue.try_recover());
        assert!(!queue.is_degraded());
        assert_eq!(queue.backend(), "flaky");
        let states: Vec<(String, DispatchStatus)> = queue
            .records()?
            .into_iter()
            .map(|r| (r.alert_id.to_string(), r.status))
            .collect();
        assert_eq!(
            states,
            vec![
                ("alert:a".to_string(), DispatchStatus::Pending),
                ("alert:b".to_string(), DispatchStatus::Sent),
            ]
        );
        assert_eq!(
            queue
                .enqueue(&alert("alert:b"), &["+639171234567".into()], at(3))
                .len(),
            0
        );
        assert!(journal.read_all()?.iter().any(|e| e.kind() == "recovered"));
        Ok(())
    }

    #[test]
    fn queue_without_a_database_moves_to_sqlite_once_available() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let parent = dir.path().join("late");
        let path = parent.join("sentinel.db").to_string_lossy().to_string();
        let queue = sqlite_queue(&path, 5);
        assert!(queue.is_degraded());
        let contacts = vec!["+639171234567".to_string(), "09171234567".to_string()];
        queue.enqueue(&alert("alert:a"), &contacts, at(0));
        assert!(!queue.try_recover());

        std::fs::create_dir(&parent)?;
        assert!(queue.try_recover());
        assert_eq!(queue.backend(), "sqlite");

        let stored = sqlite_queue(&path, 5).records()?;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].body, "body of alert:a");
        assert_eq!(stored[1].destination, "09171234567");
        Ok(())
    }

    /// Journal store that notes whether the queue lock is held when "enqueued" is written.
    #[derive(Clone, Default)]
    struct LockWatchingStore {
        queue: Arc<Mutex<Option<DispatchQueue>>>,
        held: Arc<Mutex<Vec<bool>>>,
    }

    impl JournalStore for LockWatchingStore {
        fn append(&mut self, entry: &JournalEntry) -> Result<()> {
            if let JournalEntry::Dispatch { event, .. } = entry {
                if event == "enqueued" {
                    if let Some(queue) = self.queue.lock().unwrap().as_ref() {
                        let held = queue.inner.try_lock().is_err();
                        self.held.lock().unwrap().push(held);
                    }
                }
            }
            Ok(())
        }

        fn read_all(&mut self) -> Result<Vec<JournalEntry>> {
            Ok(Vec::new())
        }

        fn head(&self) -> [u8; 32] {
            [0u8; 32]
        }

        fn backend(&self) -> &'static str {
            "watching"
        }
    }

    #[test]
    fn enqueued_entries_are_written_before_records_become_claimable() {
        let store = LockWatchingStore::default();
        let journal = Journal::with_store(Box::new(store.clone()));
        let queue = DispatchQueue::in_memory(policy(5), journal);
        *store.queue.lock().unwrap() = Some(queue.clone());

        let contacts = vec!["+639171234567".to_string(), "09171234567".to_string()];
        queue.enqueue(&alert("alert:a"), &contacts, at(0));
        assert_eq!(*store.held.lock().unwrap(), vec![true, true]);
    }
}
