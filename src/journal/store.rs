use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, Row};
use sha2::{Digest, Sha256};

use super::JournalEntry;

/// Hashes a journal payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

pub trait JournalStore: Send {
    fn append(&mut self, entry: &JournalEntry) -> Result<()>;

    /// Appends `entries` in order. Stores that can should make this all-or-nothing; the
    /// default appends one at a time.
    fn append_batch(&mut self, entries: &[JournalEntry]) -> Result<()> {
        for entry in entries {
            self.append(entry)?;
        }
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<JournalEntry>>;

    /// Hash of the newest entry, or zeroes for an empty journal.
    fn head(&self) -> [u8; 32];

    /// Pushes buffered writes to stable storage.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str;
}

pub struct SqliteJournalStore {
    conn: Connection,
    head: [u8; 32],
}

impl SqliteJournalStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = crate::open_db_connection(db_path)?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        ensure_schema(&conn)?;
        let head = last_entry_hash(&conn)?;
        Ok(Self { conn, head })
    }
}

pub(crate) fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS journal (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          recorded_at TEXT NOT NULL,
          kind TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          prev_hash BLOB NOT NULL,
          entry_hash BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_journal_kind ON journal(kind);
        "#,
    )?;
    Ok(())
}

fn last_entry_hash(conn: &Connection) -> Result<[u8; 32]> {
    let mut stmt = conn.prepare("SELECT entry_hash FROM journal ORDER BY id DESC LIMIT 1")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => blob32(row, 0),
        None => Ok([0u8; 32]),
    }
}

fn blob32(row: &Row<'_>, idx: usize) -> Result<[u8; 32]> {
    let bytes: Vec<u8> = row.get(idx)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("corrupt journal: expected 32-byte hash, found {}", bytes.len()))
}

fn insert_entry(conn: &Connection, prev_hash: &[u8; 32], entry: &JournalEntry) -> Result<[u8; 32]> {
    let payload_json = serde_json::to_string(entry)?;
    let entry_hash = hash_entry(prev_hash, payload_json.as_bytes());
    conn.execute(
        r#"
        INSERT INTO journal(recorded_at, kind, payload_json, prev_hash, entry_hash)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            entry.at().to_rfc3339(),
            entry.kind(),
            payload_json,
            prev_hash.to_vec(),
            entry_hash.to_vec()
        ],
    )?;
    Ok(entry_hash)
}

impl JournalStore for SqliteJournalStore {
    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        self.head = insert_entry(&self.conn, &self.head, entry)?;
        Ok(())
    }

    fn append_batch(&mut self, entries: &[JournalEntry]) -> Result<()> {
        let tx = self.conn.transaction()?;
        let mut head = self.head;
        for entry in entries {
            head = insert_entry(&tx, &head, entry)?;
        }
        tx.commit()?;
        self.head = head;
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<JournalEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json FROM journal ORDER BY id ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            out.push(serde_json::from_str(&payload)?);
        }
        Ok(out)
    }

    fn head(&self) -> [u8; 32] {
        self.head
    }

    fn flush(&mut self) -> Result<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

/// Volatile journal used in tests and as the degraded fallback.
#[derive(Clone, Debug, Default)]
pub struct InMemoryJournalStore {
    entries: Vec<(String, [u8; 32])>,
    genesis: [u8; 32],
}

impl InMemoryJournalStore {
    /// Continues an existing chain from `head` so a later merge stays verifiable.
    pub fn continuing(head: [u8; 32]) -> Self {
        Self {
            entries: Vec::new(),
            genesis: head,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl JournalStore for InMemoryJournalStore {
    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let payload_json = serde_json::to_string(entry)?;
        let entry_hash = hash_entry(&self.head(), payload_json.as_bytes());
        self.entries.push((payload_json, entry_hash));
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<JournalEntry>> {
        self.entries
            .iter()
            .map(|(payload, _)| serde_json::from_str(payload).map_err(Into::into))
            .collect()
    }

    fn head(&self) -> [u8; 32] {
        self.entries
            .last()
            .map_or(self.genesis, |(_, hash)| *hash)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Summary of a verified journal chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub entries: u64,
    pub head: [u8; 32],
}

/// Re-computes the journal hash chain, failing at the first broken link.
pub fn verify_chain_with<F>(conn: &Connection, mut on_entry: F) -> Result<ChainReport>
where
    F: FnMut(i64, &str, [u8; 32]),
{
    let mut stmt = conn.prepare(
        "SELECT id, kind, payload_json, prev_hash, entry_hash FROM journal ORDER BY id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut expected_prev = [0u8; 32];
    let mut entries = 0u64;

    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let kind: String = row.get(1)?;
        let payload: String = row.get(2)?;
        let prev_hash = blob32(row, 3)?;
        let entry_hash = blob32(row, 4)?;

        if prev_hash != expected_prev {
            return Err(anyhow!(
                "integrity check failed at id {}: prev_hash={}, expected_prev={}",
                id,
                hex::encode(prev_hash),
                hex::encode(expected_prev)
            ));
        }
        let computed = hash_entry(&expected_prev, payload.as_bytes());
        if computed != entry_hash {
            return Err(anyhow!(
                "integrity check failed at id {}: computed_hash={}, stored_hash={}",
                id,
                hex::encode(computed),
                hex::encode(entry_hash)
            ));
        }

        on_entry(id, &kind, entry_hash);
        expected_prev = entry_hash;
        entries += 1;
    }

    Ok(ChainReport {
        entries,
        head: expected_prev,
    })
}

pub fn verify_chain(conn: &Connection) -> Result<ChainReport> {
    verify_chain_with(conn, |_, _, _| {})
}
