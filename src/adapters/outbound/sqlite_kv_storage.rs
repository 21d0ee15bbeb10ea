//! SQLite Key-Value Storage
//!
//! Implements StreamableStorage on a versioned key-value table. Every write
//! gets a version from a hybrid logical clock, so a dump since a watermark
//! returns exactly the entries written after it.

use crate::domain::ports::StreamableStorage;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// One replicated entry, written as a JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub version: u64,
}

/// Versions are stored as SQLite INTEGER, so they must fit in an i64.
pub const MAX_VERSION: u64 = i64::MAX as u64;

/// Remote versions further ahead of the wall clock than this are not adopted
/// by the local clock.
const MAX_CLOCK_DRIFT_MICROS: u64 = 3_600 * 1_000_000;

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// SQLite-backed replicated store.
pub struct SqliteKvStorage {
    conn: Mutex<Connection>,
    clock: AtomicU64,
}

impl SqliteKvStorage {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                version INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS entries_version ON entries (version);",
        )?;
        let last: Option<i64> = conn.query_row("SELECT MAX(version) FROM entries", [], |row| row.get(0))?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock: AtomicU64::new(last.unwrap_or(0).max(0) as u64),
        })
    }

    /// Next version: wall clock when it moves forward, last version + 1 otherwise.
    fn next_version(&self) -> anyhow::Result<u64> {
        let now = wall_clock_micros();
        let mut current = self.clock.load(Ordering::SeqCst);
        loop {
            let next = match current.checked_add(1) {
                Some(next) if next <= MAX_VERSION => now.min(MAX_VERSION).max(next),
                _ => anyhow::bail!("version clock exhausted at {}", current),
            };
            match self
                .clock
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Store `value` under `key` and return its version.
    pub fn put(&self, key: &str, value: &str) -> anyhow::Result<u64> {
        let conn = self.conn.lock();
        let version = self.next_version()?;
        conn.execute(
            "INSERT INTO entries (key, value, version) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, version = excluded.version",
            params![key, value, i64::try_from(version)?],
        )?;
        Ok(version)
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<KvEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT key, value, version FROM entries WHERE key = ?1",
                params![key],
                |row| {
                    Ok(KvEntry {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        version: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    pub fn len(&self) -> anyhow::Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Entries written after `since`, oldest first.
    pub fn entries_since(&self, since: u64) -> anyhow::Result<Vec<KvEntry>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key, value, version FROM entries WHERE version > ?1 ORDER BY version")?;
        let since = i64::try_from(since).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![since], |row| {
            Ok(KvEntry {
                key: row.get(0)?,
                value: row.get(1)?,
                version: row.get::<_, i64>(2)? as u64,
            })
        })?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Apply remote entries. Identical values are skipped, changed ones get a
    /// fresh local version. Returns the number of entries written.
    ///
    /// Fails without writing anything if an entry carries a version above
    /// [`MAX_VERSION`].
    pub fn apply(&self, entries: &[KvEntry]) -> anyhow::Result<usize> {
        if let Some(entry) = entries.iter().find(|entry| entry.version > MAX_VERSION) {
            anyhow::bail!("entry {} has out of range version {}", entry.key, entry.version);
        }

        let horizon = wall_clock_micros().saturating_add(MAX_CLOCK_DRIFT_MICROS);
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut written = 0;

        for entry in entries {
            let current: Option<String> = tx
                .query_row("SELECT value FROM entries WHERE key = ?1", params![entry.key], |row| row.get(0))
                .optional()?;
            if current.as_deref() == Some(entry.value.as_str()) {
                continue;
            }

            // keep the local clock ahead of what peers have seen, within the drift bound
            if entry.version <= horizon {
                self.clock.fetch_max(entry.version, Ordering::SeqCst);
            } else {
                tracing::debug!("not adopting far-future version {} of {}", entry.version, entry.key);
            }
            let version = self.next_version()?;
            tx.execute(
                "INSERT INTO entries (key, value, version) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, version = excluded.version",
                params![entry.key, entry.value, i64::try_from(version)?],
            )?;
            written += 1;
        }

        tx.commit()?;
        Ok(written)
    }
}

#[async_trait]
impl StreamableStorage for SqliteKvStorage {
    async fn dump(&self, writer: &mut (dyn AsyncWrite + Send + Unpin), since: u64) -> anyhow::Result<u64> {
        let entries = self.entries_since(since)?;
        let mut watermark = since;

        for entry in &entries {
            let mut line = serde_json::to_vec(entry)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
            watermark = watermark.max(entry.version);
        }
        writer.flush().await?;

        tracing::debug!("dumped {} entries since {} (watermark {})", entries.len(), since, watermark);
        Ok(watermark)
    }

    async fn load(&self, reader: &mut (dyn AsyncRead + Send + Unpin)) -> anyhow::Result<()> {
        let mut lines = BufReader::new(reader).lines();
        let mut entries = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let entry: KvEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }

        let written = self.apply(&entries)?;
        tracing::debug!("loaded {} entries ({} changed)", entries.len(), written);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn dump_to_vec(storage: &SqliteKvStorage, since: u64) -> (Vec<u8>, u64) {
        let mut buf = Vec::new();
        let watermark = storage.dump(&mut buf, since).await.unwrap();
        (buf, watermark)
    }

    #[test]
    fn test_versions_increase() {
        let storage = SqliteKvStorage::open_in_memory().unwrap();
        let v1 = storage.put("a", "1").unwrap();
        let v2 = storage.put("b", "2").unwrap();
        let v3 = storage.put("a", "3").unwrap();

        assert!(v1 < v2 && v2 < v3);
        assert_eq!(storage.get("a").unwrap().unwrap().value, "3");
        assert_eq!(storage.len().unwrap(), 2);
        assert!(storage.get("missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dump_since_watermark() {
        let storage = SqliteKvStorage::open_in_memory().unwrap();
        storage.put("a", "1").unwrap();
        let mark = storage.put("b", "2").unwrap();
        let last = storage.put("c", "3").unwrap();

        let (buf, watermark) = dump_to_vec(&storage, mark).await;
        assert_eq!(watermark, last);

        let text = String::from_utf8(buf).unwrap();
        let keys: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<KvEntry>(l).unwrap().key)
            .collect();
        assert_eq!(keys, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_dump_keeps_watermark() {
        let storage = SqliteKvStorage::open_in_memory().unwrap();
        let (buf, watermark) = dump_to_vec(&storage, 42).await;
        assert!(buf.is_empty());
        assert_eq!(watermark, 42);
    }

    #[tokio::test]
    async fn test_load_replicates_and_replay_is_idempotent() {
        let source = SqliteKvStorage::open_in_memory().unwrap();
        source.put("pipeline/a", "{\"steps\":1}").unwrap();
        source.put("pipeline/b", "{\"steps\":2}").unwrap();
        let (delta, _) = dump_to_vec(&source, 0).await;

        let target = SqliteKvStorage::open_in_memory().unwrap();
        target.load(&mut delta.as_slice()).await.unwrap();
        assert_eq!(target.get("pipeline/a").unwrap().unwrap().value, "{\"steps\":1}");
        let version = target.get("pipeline/b").unwrap().unwrap().version;

        target.load(&mut delta.as_slice()).await.unwrap();
        assert_eq!(target.get("pipeline/b").unwrap().unwrap().version, version);
        assert_eq!(target.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_loaded_entries_are_dumped_onward() {
        let source = SqliteKvStorage::open_in_memory().unwrap();
        let target = SqliteKvStorage::open_in_memory().unwrap();
        let mark = target.put("local", "x").unwrap();

        source.put("remote", "y").unwrap();
        let (delta, _) = dump_to_vec(&source, 0).await;
        target.load(&mut delta.as_slice()).await.unwrap();

        let entries = target.entries_since(mark).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "remote");
    }

    #[tokio::test]
    async fn test_malformed_line_fails_load() {
        let target = SqliteKvStorage::open_in_memory().unwrap();
        let mut input: &[u8] = b"{\"key\":\"a\"\n";
        assert!(target.load(&mut input).await.is_err());
        assert!(target.is_empty().unwrap());
    }

    fn line(version: u64) -> String {
        format!("{{\"key\":\"k\",\"value\":\"v\",\"version\":{}}}\n", version)
    }

    #[tokio::test]
    async fn test_out_of_range_versions_are_rejected() {
        for version in [u64::MAX, MAX_VERSION + 10] {
            let target = SqliteKvStorage::open_in_memory().unwrap();
            let input = line(version);
            assert!(target.load(&mut input.as_bytes()).await.is_err());
            assert!(target.is_empty().unwrap());

            let local = target.put("local", "x").unwrap();
            assert!(local <= MAX_VERSION);
            let entries = target.entries_since(0).unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].key, "local");
        }
    }

    #[tokio::test]
    async fn test_far_future_version_does_not_exhaust_clock() {
        let target = SqliteKvStorage::open_in_memory().unwrap();
        let input = line(MAX_VERSION);
        target.load(&mut input.as_bytes()).await.unwrap();

        let loaded = target.get("k").unwrap().unwrap().version;
        assert!(loaded < MAX_VERSION);
        let local = target.put("local", "x").unwrap();
        assert!(local > loaded);
        assert_eq!(target.entries_since(0).unwrap().len(), 2);
    }

    #[test]
    fn test_exhausted_clock_is_an_error() {
        let storage = SqliteKvStorage::open_in_memory().unwrap();
        storage.clock.store(MAX_VERSION, Ordering::SeqCst);
        assert!(storage.put("a", "1").is_err());
        assert!(storage.is_empty().unwrap());
    }

    #[test]
    fn test_clock_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.db");

        let last = {
            let storage = SqliteKvStorage::open(&path).unwrap();
            storage.put("a", "1").unwrap()
        };

        let storage = SqliteKvStorage::open(&path).unwrap();
        assert!(storage.put("b", "2").unwrap() > last);
    }
}
