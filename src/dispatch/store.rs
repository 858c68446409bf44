use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{DispatchRecord, DispatchStatus};
use crate::alert::Alert;

/// Durable dispatch state. Both the enqueue path and the sender mutate it, always through
/// `DispatchQueue`, which serializes access.
pub trait DispatchStore: Send {
    /// Persists the alert and one `Pending` record per destination in one transaction.
    fn enqueue(
        &mut self,
        alert: &Alert,
        destinations: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<DispatchRecord>>;

    /// Records due at `now` that are not in flight, oldest first.
    fn ready(&mut self, now: DateTime<Utc>) -> Result<Vec<DispatchRecord>>;

    fn get(&mut self, record_id: i64) -> Result<Option<DispatchRecord>>;

    /// Writes the mutable fields of `record` back.
    fn update(&mut self, record: &DispatchRecord) -> Result<()>;

    fn all(&mut self) -> Result<Vec<DispatchRecord>>;

    /// Writes back records (and their alerts) that were kept elsewhere while this store was
    /// unavailable. Records are matched by alert and destination; unknown ones are added
    /// under a new record id.
    fn restore(&mut self, alerts: &[Alert], records: &[DispatchRecord]) -> Result<()>;

    fn backend(&self) -> &'static str;
}

pub struct SqliteDispatchStore {
    conn: Connection,
}

impl SqliteDispatchStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = crate::open_db_connection(db_path)?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        ensure_schema(&conn)?;
        Ok(Self { conn })
    }
}

pub(crate) fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS alerts (
          alert_id TEXT PRIMARY KEY,
          created_at INTEGER NOT NULL,
          format_version INTEGER NOT NULL,
          body TEXT NOT NULL,
          payload_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS dispatch_records (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          alert_id TEXT NOT NULL REFERENCES alerts(alert_id),
          destination TEXT NOT NULL,
          status TEXT NOT NULL,
          attempts INTEGER NOT NULL,
          in_flight INTEGER NOT NULL,
          enqueued_at INTEGER NOT NULL,
          last_attempt_at INTEGER,
          next_attempt_at INTEGER NOT NULL,
          last_error TEXT,
          UNIQUE(alert_id, destination)
        );

        CREATE INDEX IF NOT EXISTS idx_dispatch_ready
          ON dispatch_records(status, in_flight, next_attempt_at);
        "#,
    )?;
    Ok(())
}

const SELECT_RECORD: &str = r#"
    SELECT r.id, r.alert_id, r.destination, a.body, r.status, r.attempts, r.in_flight,
           r.enqueued_at, r.last_attempt_at, r.next_attempt_at, r.last_error
    FROM dispatch_records r JOIN alerts a ON a.alert_id = r.alert_id
"#;

fn millis_to_time(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn record_from_row(row: &Row<'_>) -> Result<DispatchRecord> {
    let status: String = row.get(4)?;
    let last_attempt_at: Option<i64> = row.get(8)?;
    Ok(DispatchRecord {
        record_id: row.get(0)?,
        alert_id: row.get::<_, String>(1)?.into(),
        destination: row.get(2)?,
        body: row.get(3)?,
        status: status.parse()?,
        attempts: row.get(5)?,
        in_flight: row.get::<_, i64>(6)? != 0,
        enqueued_at: millis_to_time(row.get(7)?)?,
        last_attempt_at: last_attempt_at.map(millis_to_time).transpose()?,
        next_attempt_at: millis_to_time(row.get(9)?)?,
        last_error: row.get(10)?,
    })
}

impl SqliteDispatchStore {
    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<DispatchRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(record_from_row(row)?);
        }
        Ok(out)
    }
}

fn insert_alert(conn: &Connection, alert: &Alert) -> Result<()> {
    let payload_json = serde_json::to_string(alert)?;
    conn.execute(
        r#"
        INSERT OR IGNORE INTO alerts(alert_id, created_at, format_version, body, payload_json)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            alert.id.as_str(),
            alert.created_at.timestamp_millis(),
            alert.format_version,
            alert.body,
            payload_json
        ],
    )?;
    Ok(())
}

impl DispatchStore for SqliteDispatchStore {
    fn enqueue(
        &mut self,
        alert: &Alert,
        destinations: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<DispatchRecord>> {
        let tx = self.conn.transaction()?;
        insert_alert(&tx, alert)?;
        let mut ids = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let inserted = tx.execute(
                r#"
                INSERT OR IGNORE INTO dispatch_records(
                  alert_id, destination, status, attempts, in_flight, enqueued_at, next_attempt_at)
                VALUES (?1, ?2, ?3, 0, 0, ?4, ?4)
                "#,
                params![
                    alert.id.as_str(),
                    destination,
                    DispatchStatus::Pending.as_str(),
                    now.timestamp_millis()
                ],
            )?;
            if inserted == 1 {
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn ready(&mut self, now: DateTime<Utc>) -> Result<Vec<DispatchRecord>> {
        self.query(
            &format!(
                "{} WHERE r.status IN ('pending', 'failed') AND r.in_flight = 0 \
                 AND r.next_attempt_at <= ?1 ORDER BY r.id ASC",
                SELECT_RECORD
            ),
            params![now.timestamp_millis()],
        )
    }

    fn get(&mut self, record_id: i64) -> Result<Option<DispatchRecord>> {
        let sql = format!("{} WHERE r.id = ?1", SELECT_RECORD);
        let mut stmt = self.conn.prepare(&sql)?;
        let record = stmt
            .query_row(params![record_id], |row| Ok(record_from_row(row)))
            .optional()?;
        record.transpose()
    }

    fn update(&mut self, record: &DispatchRecord) -> Result<()> {
        let changed = self.conn.execute(
            r#"
            UPDATE dispatch_records
            SET status = ?2, attempts = ?3, in_flight = ?4, last_attempt_at = ?5,
                next_attempt_at = ?6, last_error = ?7
            WHERE id = ?1
            "#,
            params![
                record.record_id,
                record.status.as_str(),
                record.attempts,
                record.in_flight as i64,
                record.last_attempt_at.map(|t| t.timestamp_millis()),
                record.next_attempt_at.timestamp_millis(),
                record.last_error
            ],
        )?;
        if changed != 1 {
            return Err(anyhow!("dispatch record {} not found", record.record_id));
        }
        Ok(())
    }

    fn all(&mut self) -> Result<Vec<DispatchRecord>> {
        self.query(&format!("{} ORDER BY r.id ASC", SELECT_RECORD), [])
    }

    fn restore(&mut self, alerts: &[Alert], records: &[DispatchRecord]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for alert in alerts {
            insert_alert(&tx, alert)?;
        }
        for record in records {
            let in_flight = record.in_flight as i64;
            let last_attempt_at = record.last_attempt_at.map(|t| t.timestamp_millis());
            let next_attempt_at = record.next_attempt_at.timestamp_millis();
            let changed = tx.execute(
                r#"
                UPDATE dispatch_records
                SET status = ?3, attempts = ?4, in_flight = ?5, last_attempt_at = ?6,
                    next_attempt_at = ?7, last_error = ?8
                WHERE alert_id = ?1 AND destination = ?2
                "#,
                params![
                    record.alert_id.as_str(),
                    record.destination,
                    record.status.as_str(),
                    record.attempts,
                    in_flight,
                    last_attempt_at,
                    next_attempt_at,
                    record.last_error
                ],
            )?;
            if changed == 0 {
                tx.execute(
                    r#"
                    INSERT INTO dispatch_records(
                      alert_id, destination, status, attempts, in_flight, last_attempt_at,
                      next_attempt_at, last_error, enqueued_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    "#,
                    params![
                        record.alert_id.as_str(),
                        record.destination,
                        record.status.as_str(),
                        record.attempts,
                        in_flight,
                        last_attempt_at,
                        next_attempt_at,
                        record.last_error,
                        record.enqueued_at.timestamp_millis()
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

/// Volatile store used in tests and as the degraded fallback.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDispatchStore {
    alerts: Vec<Alert>,
    records: Vec<DispatchRecord>,
    next_id: i64,
}

impl InMemoryDispatchStore {
    /// Seeds the store, e.g. with whatever could be salvaged from a failing database.
    pub fn from_records(mut records: Vec<DispatchRecord>) -> Self {
        records.sort_by_key(|r| r.record_id);
        let next_id = records.last().map_or(0, |r| r.record_id);
        Self {
            alerts: Vec::new(),
            records,
            next_id,
        }
    }

    /// Alerts enqueued into this store.
    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn records(&self) -> &[DispatchRecord] {
        &self.records
    }

    pub fn has_in_flight(&self) -> bool {
        self.records.iter().any(|r| r.in_flight)
    }

    fn remember(&mut self, alert: &Alert) {
        if !self.alerts.iter().any(|a| a.id == alert.id) {
            self.alerts.push(alert.clone());
        }
    }
}

impl DispatchStore for InMemoryDispatchStore {
    fn enqueue(
        &mut self,
        alert: &Alert,
        destinations: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<DispatchRecord>> {
        self.remember(alert);
        let mut out = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let duplicate = self
                .records
                .iter()
                .any(|r| r.alert_id == alert.id && &r.destination == destination);
            if duplicate {
                continue;
            }
            self.next_id += 1;
            let record = DispatchRecord::new(
                self.next_id,
                alert.id.clone(),
                destination.clone(),
                alert.body.clone(),
                now,
            );
            self.records.push(record.clone());
            out.push(record);
        }
        Ok(out)
    }

    fn ready(&mut self, now: DateTime<Utc>) -> Result<Vec<DispatchRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.is_ready(now))
            .cloned()
            .collect())
    }

    fn get(&mut self, record_id: i64) -> Result<Option<DispatchRecord>> {
        Ok(self
            .records
            .iter()
            .find(|r| r.record_id == record_id)
            .cloned())
    }

    fn update(&mut self, record: &DispatchRecord) -> Result<()> {
        let slot = self
            .records
            .iter_mut()
            .find(|r| r.record_id == record.record_id)
            .ok_or_else(|| anyhow!("dispatch record {} not found", record.record_id))?;
        *slot = record.clone();
        Ok(())
    }

    fn all(&mut self) -> Result<Vec<DispatchRecord>> {
        Ok(self.records.clone())
    }

    fn restore(&mut self, alerts: &[Alert], records: &[DispatchRecord]) -> Result<()> {
        for alert in alerts {
            self.remember(alert);
        }
        for record in records {
            let existing = self
                .records
                .iter_mut()
                .find(|r| r.alert_id == record.alert_id && r.destination == record.destination);
            match existing {
                Some(slot) => {
                    let record_id = slot.record_id;
                    *slot = record.clone();
                    slot.record_id = record_id;
                }
                None => {
                    self.next_id += 1;
                    let mut restored = record.clone();
                    restored.record_id = self.next_id;
                    self.records.push(restored);
                }
            }
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Per-status record counts, for health reporting and `journal_verify`.
pub fn status_counts(conn: &Connection) -> Result<Vec<(DispatchStatus, u64)>> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM dispatch_records GROUP BY status ORDER BY status",
    )?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let status: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        out.push((status.parse()?, count as u64));
    }
    Ok(out)
}

/// Records that exhausted their retries.
pub fn abandoned_records(conn: &Connection) -> Result<Vec<DispatchRecord>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE r.status = 'abandoned' ORDER BY r.id ASC",
        SELECT_RECORD
    ))?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(record_from_row(row)?);
    }
    Ok(out)
}
