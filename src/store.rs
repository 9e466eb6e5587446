// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! SQLite-backed persisted store of HTTP exchanges keyed by `(method, url)`.
//!
//! All access goes through a `tokio_rusqlite::Connection`, which runs
//! statements on a dedicated background thread. Clones of [`Store`] share the
//! same connection, so every clone observes the same data.

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, TransactionBehavior};
use tokio_rusqlite::{params, Connection};
use tracing::{debug, info};

/// Multi-valued header map in its persisted shape. Names are lowercase, the
/// value order per name is the order the values were received in.
pub type Headers = BTreeMap<String, Vec<String>>;

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA busy_timeout=5000;";

/// Ordered schema migrations: (version, SQL). Every statement is idempotent.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS cache (
        method TEXT NOT NULL,
        url TEXT NOT NULL,
        status_code INTEGER NOT NULL,
        status TEXT NOT NULL,
        headers TEXT NOT NULL,
        body BLOB,
        timestamp DATETIME NOT NULL,
        PRIMARY KEY (method, url)
    );",
)];

const SELECT_COLUMNS: &str = "method, url, status_code, status, headers, body, timestamp";

/// Identifies one cached exchange. Both parts are compared as exact strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// One stored HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub status_code: u16,
    /// Full status text, e.g. `"200 OK"`.
    pub status: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Storage time, or the provenance time of a manually injected entry.
    /// Always whole seconds, matching the persisted precision.
    pub timestamp: DateTime<Utc>,
}

impl CacheEntry {
    /// Builds an entry stamped with the current time.
    pub fn new(key: CacheKey, status_code: u16, headers: Headers, body: Vec<u8>) -> Self {
        Self::with_timestamp(key, status_code, headers, body, Utc::now())
    }

    pub fn with_timestamp(
        key: CacheKey,
        status_code: u16,
        headers: Headers,
        body: Vec<u8>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            status_code,
            status: status_text(status_code),
            headers,
            body,
            timestamp: timestamp.trunc_subsecs(0),
        }
    }
}

/// `"<code> <canonical reason>"`, or just the code when none is known.
pub fn status_text(code: u16) -> String {
    match hyper::StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
    {
        Some(reason) => format!("{} {}", code, reason),
        None => code.to_string(),
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| Error::Timestamp {
            value: value.to_string(),
            source,
        })
}

fn encode_headers(headers: &Headers) -> Result<String> {
    Ok(serde_json::to_string(headers)?)
}

fn decode_headers(text: &str) -> Result<Headers> {
    Ok(serde_json::from_str(text)?)
}

/// Columns as read back from a row, before decoding.
struct RawRow {
    method: String,
    url: String,
    status_code: u16,
    status: String,
    headers: String,
    body: Option<Vec<u8>>,
    timestamp: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            method: row.get(0)?,
            url: row.get(1)?,
            status_code: row.get(2)?,
            status: row.get(3)?,
            headers: row.get(4)?,
            body: row.get(5)?,
            timestamp: row.get(6)?,
        })
    }

    fn decode(self) -> Result<CacheEntry> {
        Ok(CacheEntry {
            key: CacheKey::new(self.method, self.url),
            status_code: self.status_code,
            status: self.status,
            headers: decode_headers(&self.headers)?,
            body: self.body.unwrap_or_default(),
            timestamp: parse_timestamp(&self.timestamp)?,
        })
    }
}

const READER_PRAGMAS: &str = "PRAGMA busy_timeout=5000;
     PRAGMA query_only=ON;";

/// Durable `(method, url)` -> [`CacheEntry`] table.
///
/// File-backed stores keep a second, read-only connection so lookups run
/// beside writes instead of queueing behind them (WAL readers never wait on
/// the writer). In-memory stores use one connection for both.
#[derive(Clone, Debug)]
pub struct Store {
    conn: Connection,
    reader: Connection,
}

impl Store {
    /// Opens (creating if needed) the database file and initializes the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .await
            .map_err(|e| Error::Database(e.into()))?;
        let store = Self {
            reader: conn.clone(),
            conn,
        };
        store.initialize().await?;

        let reader = Connection::open(&path)
            .await
            .map_err(|e| Error::Database(e.into()))?;
        reader
            .call(|conn| -> Result<()> {
                conn.execute_batch(READER_PRAGMAS)?;
                Ok(())
            })
            .await?;
        info!(path = %path.display(), "opened cache store");
        Ok(Self { reader, ..store })
    }

    /// In-memory database with the same schema, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::Database(e.into()))?;
        let store = Self {
            reader: conn.clone(),
            conn,
        };
        store.initialize().await?;
        Ok(store)
    }

    /// Applies pragmas and any pending migrations. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<()> {
        self.conn
            .call(|conn| -> Result<()> {
                conn.execute_batch(PRAGMAS)?;
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS _migrations (
                        version INTEGER PRIMARY KEY,
                        applied_at TEXT NOT NULL
                    )",
                    [],
                )?;
                let current: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM _migrations",
                    [],
                    |row| row.get(0),
                )?;
                for (version, sql) in MIGRATIONS {
                    if *version <= current {
                        continue;
                    }
                    conn.execute_batch(sql)
                        .map_err(|e| Error::Migration(format!("version {}: {}", version, e)))?;
                    conn.execute(
                        "INSERT OR IGNORE INTO _migrations (version, applied_at) VALUES (?1, ?2)",
                        params![version, format_timestamp(&Utc::now())],
                    )?;
                }
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Point lookup. A missing row is `Ok(None)`.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let key = key.clone();
        self.reader
            .call(move |conn| -> Result<Option<CacheEntry>> {
                let raw = conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM cache WHERE method = ?1 AND url = ?2",
                            SELECT_COLUMNS
                        ),
                        params![key.method, key.url],
                        RawRow::from_row,
                    )
                    .optional()?;
                raw.map(RawRow::decode).transpose()
            })
            .await
            .map_err(Error::from)
    }

    /// Insert-if-absent. An existing row with identical headers and body is
    /// left untouched and reported as success; any difference is a conflict
    /// and nothing is written.
    pub async fn set(&self, entry: &CacheEntry) -> Result<()> {
        let headers = encode_headers(&entry.headers)?;
        let entry = entry.clone();
        self.conn
            .call(move |conn| -> Result<()> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let existing: Option<(String, Option<Vec<u8>>)> = tx
                    .query_row(
                        "SELECT headers, body FROM cache WHERE method = ?1 AND url = ?2",
                        params![entry.key.method, entry.key.url],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                match existing {
                    None => {
                        tx.execute(
                            "INSERT INTO cache (method, url, status_code, status, headers, body, timestamp)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            params![
                                entry.key.method,
                                entry.key.url,
                                entry.status_code,
                                entry.status,
                                headers,
                                entry.body,
                                format_timestamp(&entry.timestamp),
                            ],
                        )?;
                    }
                    Some((existing_headers, existing_body)) => {
                        if existing_headers != headers {
                            return Err(Error::HeadersConflict(entry.key));
                        }
                        if existing_body.unwrap_or_default() != entry.body {
                            return Err(Error::BodyConflict(entry.key));
                        }
                        debug!(key = %entry.key, "identical entry already stored");
                    }
                }

                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Removes the row if present. Deleting a missing key succeeds.
    pub async fn delete(&self, key: &CacheKey) -> Result<()> {
        let key = key.clone();
        self.conn
            .call(move |conn| -> Result<()> {
                conn.execute(
                    "DELETE FROM cache WHERE method = ?1 AND url = ?2",
                    params![key.method, key.url],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Every entry, newest first.
    pub async fn list_all(&self) -> Result<Vec<CacheEntry>> {
        self.reader
            .call(|conn| -> Result<Vec<CacheEntry>> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM cache ORDER BY timestamp DESC",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt.query_map([], RawRow::from_row)?;
                let mut entries = Vec::new();
                for raw in rows {
                    entries.push(raw?.decode()?);
                }
                Ok(entries)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn count(&self) -> Result<u64> {
        self.reader
            .call(|conn| -> Result<u64> {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;
                Ok(n.max(0) as u64)
            })
            .await
            .map_err(Error::from)
    }

    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &'static str) -> Result<()> {
        self.conn
            .call(move |conn| -> Result<()> {
                conn.execute_batch(sql)?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers(pairs: &[(&str, &[&str])]) -> Headers {
        pairs
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    fn entry(url: &str, body: &str) -> CacheEntry {
        CacheEntry::new(
            CacheKey::new("GET", url),
            200,
            headers(&[("content-type", &["text/plain"])]),
            body.as_bytes().to_vec(),
        )
    }

    #[tokio::test]
    async fn set_then_get_returns_all_fields() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let e = entry("https://example.com/test", "test body");
        store.set(&e).await?;

        let got = store.get(&e.key).await?.expect("entry stored");
        assert_eq!(got, e);
        assert_eq!(got.status, "200 OK");
        Ok(())
    }

    #[tokio::test]
    async fn get_missing_is_none() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let got = store.get(&CacheKey::new("GET", "https://nope/")).await?;
        assert!(got.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn identical_restore_is_a_no_op() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let e = entry("https://x/1", "A");
        store.set(&e).await?;

        let mut again = e.clone();
        again.timestamp = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
        store.set(&again).await?;

        assert_eq!(store.count().await?, 1);
        let got = store.get(&e.key).await?.expect("entry stored");
        assert_eq!(got.timestamp, e.timestamp);
        Ok(())
    }

    #[tokio::test]
    async fn different_body_conflicts_and_keeps_original() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let e = entry("https://x/1", "A");
        store.set(&e).await?;

        let err = store
            .set(&entry("https://x/1", "B"))
            .await
            .expect_err("body differs");
        assert!(matches!(err, Error::BodyConflict(ref k) if *k == e.key));

        let got = store.get(&e.key).await?.expect("entry stored");
        assert_eq!(got.body, b"A");
        Ok(())
    }

    #[tokio::test]
    async fn different_headers_conflict() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let e = entry("https://x/1", "A");
        store.set(&e).await?;

        let mut other = e.clone();
        other.headers = headers(&[("content-type", &["text/html"])]);
        let err = store.set(&other).await.expect_err("headers differ");
        assert!(matches!(err, Error::HeadersConflict(_)));
        Ok(())
    }

    #[tokio::test]
    async fn methods_are_distinct_keys() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let get = entry("https://x/1", "A");
        let mut head = entry("https://x/1", "");
        head.key.method = "HEAD".into();
        store.set(&get).await?;
        store.set(&head).await?;
        assert_eq!(store.count().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let e = entry("https://x/1", "A");
        store.set(&e).await?;
        store.delete(&e.key).await?;
        store.delete(&e.key).await?;
        assert!(store.get(&e.key).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn list_all_is_newest_first() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        for (i, url) in ["https://x/old", "https://x/new", "https://x/mid"]
            .iter()
            .enumerate()
        {
            let year = [2001, 2003, 2002][i];
            let e = CacheEntry::with_timestamp(
                CacheKey::new("GET", *url),
                200,
                Headers::new(),
                Vec::new(),
                Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap(),
            );
            store.set(&e).await?;
        }

        let urls: Vec<_> = store
            .list_all()
            .await?
            .into_iter()
            .map(|e| e.key.url)
            .collect();
        assert_eq!(urls, vec!["https://x/new", "https://x/mid", "https://x/old"]);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_timestamp_is_an_error() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        store
            .execute_raw(
                "INSERT INTO cache (method, url, status_code, status, headers, body, timestamp)
                 VALUES ('GET', 'https://x/bad', 200, '200 OK', '{}', x'', 'yesterday')",
            )
            .await?;
        let err = store
            .get(&CacheKey::new("GET", "https://x/bad"))
            .await
            .expect_err("timestamp is not RFC3339");
        assert!(matches!(err, Error::Timestamp { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn initialize_is_idempotent_and_reopen_keeps_rows() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!(
            "scrape_cache_store_{}.sqlite",
            uuid::Uuid::new_v4()
        ));
        {
            let store = Store::open(&path).await?;
            store.initialize().await?;
            store.set(&entry("https://x/1", "A")).await?;
        }
        let store = Store::open(&path).await?;
        assert_eq!(store.count().await?, 1);

        drop(store);
        let _ = tokio::fs::remove_file(&path).await;
        Ok(())
    }

    #[tokio::test]
    async fn reads_do_not_wait_for_busy_writer() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!(
            "scrape_cache_store_{}.sqlite",
            uuid::Uuid::new_v4()
        ));
        let store = Store::open(&path).await?;
        let e = entry("https://x/read", "A");
        store.set(&e).await?;

        // Park the writer thread inside a transaction on another key.
        let writer = store.clone();
        let busy = tokio::spawn(async move {
            writer
                .conn
                .call(|conn| -> Result<()> {
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    tx.execute(
                        "DELETE FROM cache WHERE url = 'https://x/other'",
                        [],
                    )?;
                    std::thread::sleep(std::time::Duration::from_millis(800));
                    tx.commit()?;
                    Ok(())
                })
                .await
                .map_err(Error::from)
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let got = store.get(&e.key).await?;
        assert_eq!(got, Some(e));
        assert!(started.elapsed() < std::time::Duration::from_millis(500));

        busy.await??;
        drop(store);
        let _ = tokio::fs::remove_file(&path).await;
        Ok(())
    }

    #[tokio::test]
    async fn reader_sees_committed_writes() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!(
            "scrape_cache_store_{}.sqlite",
            uuid::Uuid::new_v4()
        ));
        let store = Store::open(&path).await?;
        assert!(store.get(&CacheKey::new("GET", "https://x/new")).await?.is_none());
        store.set(&entry("https://x/new", "A")).await?;
        assert!(store.get(&CacheKey::new("GET", "https://x/new")).await?.is_some());
        assert_eq!(store.count().await?, 1);
        store.delete(&CacheKey::new("GET", "https://x/new")).await?;
        assert!(store.list_all().await?.is_empty());

        drop(store);
        let _ = tokio::fs::remove_file(&path).await;
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_identical_writers_all_succeed() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let e = entry("https://x/race", "same");
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let e = e.clone();
            tasks.push(tokio::spawn(async move { store.set(&e).await }));
        }
        for t in tasks {
            t.await??;
        }
        assert_eq!(store.count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_differing_writers_exactly_one_wins() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let e = entry("https://x/race", &format!("body {}", i));
            tasks.push(tokio::spawn(async move { store.set(&e).await }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for t in tasks {
            match t.await? {
                Ok(()) => ok += 1,
                Err(e) if e.is_conflict() => conflicts += 1,
                Err(e) => return Err(e.into()),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 15);
        Ok(())
    }

    #[test]
    fn status_text_uses_canonical_reason() {
        assert_eq!(status_text(200), "200 OK");
        assert_eq!(status_text(404), "404 Not Found");
        assert_eq!(status_text(599), "599");
    }

    #[test]
    fn timestamps_round_trip_at_second_precision() -> anyhow::Result<()> {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let s = format_timestamp(&ts);
        assert_eq!(s, "2024-05-01T10:00:00Z");
        assert_eq!(parse_timestamp(&s)?, ts);
        assert_eq!(
            parse_timestamp("2024-05-01T12:00:00+02:00")?,
            ts,
            "offsets are normalized to UTC"
        );
        Ok(())
    }
}
