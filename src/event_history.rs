//! Append-only log of hashed events backing historical rule conditions.
use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::{Event, EventData, Result, Variant};

const BUSY_TIMEOUT_MS: u64 = 5_000;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Aggregate over matching history records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventHistoryResult {
    /// Number of matching records.
    pub count: u64,
    /// Oldest matching timestamp in milliseconds since the Unix epoch.
    pub oldest: Option<i64>,
    /// Newest matching timestamp in milliseconds since the Unix epoch.
    pub newest: Option<i64>,
}

/// A history lookup: the key-value mask identifying an event plus a time window.
///
/// `from == 0` means the beginning of history and `to == 0` means now. Both bounds are inclusive
/// and expressed in milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EventHistoryRequest {
    /// Key-value pairs whose hash is looked up.
    pub mask: EventData,
    /// Start of the range in milliseconds since the Unix epoch.
    pub from: i64,
    /// End of the range in milliseconds since the Unix epoch. `0` means now.
    pub to: i64,
}

impl EventHistoryRequest {
    /// Request counting events matching `mask` within `[from, to]`.
    pub fn new(mask: EventData, from: i64, to: i64) -> EventHistoryRequest {
        EventHistoryRequest { mask, from, to }
    }

    /// Hash identifying the events this request looks for.
    pub fn hash(&self) -> u32 {
        hash_mask(&self.mask, None)
    }
}

/// Storage backend for [`EventHistory`].
pub trait EventHistoryStore: Send + Sync {
    /// Append a record.
    fn insert(&self, hash: u32, timestamp: i64) -> Result<()>;

    /// Aggregate records with `hash` and a timestamp within `[from, to]`.
    fn select(&self, hash: u32, from: i64, to: i64) -> Result<EventHistoryResult>;

    /// Remove records with `hash` and a timestamp within `[from, to]`, returning how many were
    /// removed.
    fn delete(&self, hash: u32, from: i64, to: i64) -> Result<usize>;
}

/// [`EventHistoryStore`] backed by a SQLite database.
pub struct SqliteEventHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteEventHistoryStore {
    /// Open (creating if needed) a database file at an already sandboxed `path`.
    pub(crate) fn open(path: impl AsRef<Path>) -> Result<SqliteEventHistoryStore> {
        let conn = Connection::open(path.as_ref())?;
        // `journal_mode` reports the resulting mode as a row.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        SqliteEventHistoryStore::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<SqliteEventHistoryStore> {
        SqliteEventHistoryStore::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<SqliteEventHistoryStore> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                 event_hash INTEGER NOT NULL,
                 timestamp INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS events_hash_timestamp ON events (event_hash, timestamp);",
        )?;
        Ok(SqliteEventHistoryStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .expect("thread holding event history lock should not panic")
    }
}

impl EventHistoryStore for SqliteEventHistoryStore {
    fn insert(&self, hash: u32, timestamp: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO events (event_hash, timestamp) VALUES (?1, ?2)",
            params![hash, timestamp],
        )?;
        Ok(())
    }

    fn select(&self, hash: u32, from: i64, to: i64) -> Result<EventHistoryResult> {
        let (count, oldest, newest) = self.conn().query_row(
            "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM events
             WHERE event_hash = ?1 AND timestamp >= ?2 AND timestamp <= ?3",
            params![hash, from, to],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            },
        )?;
        Ok(EventHistoryResult {
            count: count.max(0) as u64,
            oldest,
            newest,
        })
    }

    fn delete(&self, hash: u32, from: i64, to: i64) -> Result<usize> {
        let deleted = self.conn().execute(
            "DELETE FROM events WHERE event_hash = ?1 AND timestamp >= ?2 AND timestamp <= ?3",
            params![hash, from, to],
        )?;
        Ok(deleted)
    }
}

/// Event history: records hashed events and answers range queries over them.
///
/// ```
/// # use eventhub::{EventData, EventHistory};
/// let history = EventHistory::in_memory().unwrap();
/// let hash = eventhub::hash_mask(&EventData::new().with("action", "purchase"), None);
/// history.insert(hash).unwrap();
/// assert_eq!(history.select(hash, 0, 0).unwrap().count, 1);
/// ```
#[derive(Clone)]
pub struct EventHistory {
    store: Arc<dyn EventHistoryStore>,
}

impl std::fmt::Debug for EventHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHistory").finish_non_exhaustive()
    }
}

impl EventHistory {
    /// Event history over a custom store.
    pub fn new(store: impl EventHistoryStore + 'static) -> EventHistory {
        EventHistory {
            store: Arc::new(store),
        }
    }

    /// Event history persisted to a SQLite database at an already sandboxed `path`.
    ///
    /// Opened publicly through [`Sandbox::event_history`](crate::storage::Sandbox::event_history).
    pub(crate) fn open(path: impl AsRef<Path>) -> Result<EventHistory> {
        Ok(EventHistory::new(SqliteEventHistoryStore::open(path)?))
    }

    /// Event history kept in memory for the lifetime of the value.
    pub fn in_memory() -> Result<EventHistory> {
        Ok(EventHistory::new(SqliteEventHistoryStore::in_memory()?))
    }

    /// Record `hash` at the current time.
    pub fn insert(&self, hash: u32) -> Result<()> {
        self.insert_at(hash, now_millis())
    }

    /// Record `hash` at `timestamp` (milliseconds since the Unix epoch).
    pub fn insert_at(&self, hash: u32, timestamp: i64) -> Result<()> {
        self.store.insert(hash, timestamp).inspect_err(|err| {
            log::error!(target: "eventhub", hash; "failed to record event history: {err}");
        })
    }

    /// Count records of `hash` within `[from, to]`. `from == 0` means the beginning of history and
    /// `to == 0` means now.
    pub fn select(&self, hash: u32, from: i64, to: i64) -> Result<EventHistoryResult> {
        let (from, to) = resolve_window(from, to);
        self.store.select(hash, from, to).inspect_err(|err| {
            log::error!(target: "eventhub", hash; "failed to query event history: {err}");
        })
    }

    /// Delete records of `hash` within `[from, to]`, with the same bounds as
    /// [`EventHistory::select`].
    pub fn delete(&self, hash: u32, from: i64, to: i64) -> Result<usize> {
        let (from, to) = resolve_window(from, to);
        self.store.delete(hash, from, to).inspect_err(|err| {
            log::error!(target: "eventhub", hash; "failed to delete event history: {err}");
        })
    }

    /// Record `event` if it carries a mask. Returns the recorded hash.
    pub fn record(&self, event: &Event) -> Result<Option<u32>> {
        let Some(mask) = event.mask() else {
            return Ok(None);
        };
        let hash = hash_mask(event.data(), Some(mask));
        if hash == 0 {
            return Ok(None);
        }
        self.insert_at(hash, event.timestamp().timestamp_millis())?;
        log::trace!(target: "eventhub", hash, sequence = event.sequence(); "recorded event into history");
        Ok(Some(hash))
    }

    /// Run several lookups.
    ///
    /// With `enforce_order`, each request only considers records at or after the oldest match of
    /// the previous request, and requests following a miss report nothing.
    pub fn get_events(
        &self,
        requests: &[EventHistoryRequest],
        enforce_order: bool,
    ) -> Result<Vec<EventHistoryResult>> {
        let mut results = Vec::with_capacity(requests.len());
        let mut previous_oldest = None;
        for request in requests {
            let from = match (enforce_order, previous_oldest) {
                (true, Some(oldest)) => request.from.max(oldest),
                _ => request.from,
            };
            let result = self.select(request.hash(), from, request.to)?;
            if enforce_order {
                if result.count == 0 {
                    results.resize(requests.len(), EventHistoryResult::default());
                    return Ok(results);
                }
                previous_oldest = result.oldest;
            }
            results.push(result);
        }
        Ok(results)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn resolve_window(from: i64, to: i64) -> (i64, i64) {
    let to = if to == 0 { now_millis() } else { to };
    (from.max(0), to)
}

/// Hash of the flattened `data`, restricted to `mask` keys when given.
///
/// Keys are sorted and each present, non-null value contributes `key:value` to the hashed string,
/// so the hash does not depend on insertion order or numeric representation (`5` and `5.0` hash
/// the same). Returns `0` if no key contributes.
pub fn hash_mask(data: &EventData, mask: Option<&[String]>) -> u32 {
    let flattened = data.flatten();
    let mut keys: Vec<&str> = match mask {
        Some(mask) => mask.iter().map(String::as_str).collect(),
        None => flattened.keys().map(String::as_str).collect(),
    };
    keys.sort_unstable();
    keys.dedup();

    let canonical: String = keys
        .into_iter()
        .filter(|key| !key.is_empty())
        .filter_map(|key| match flattened.get(key) {
            Some(value) if !value.is_null() => Some(canonical_pair(key, value)),
            _ => None,
        })
        .collect();

    if canonical.is_empty() {
        0
    } else {
        fnv1a32(canonical.as_bytes())
    }
}

fn canonical_pair(key: &str, value: &Variant) -> String {
    format!("{key}:{}", value.convert_to_string())
}

/// 32-bit FNV-1a.
pub(crate) fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}
