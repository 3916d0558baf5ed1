use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

mod predictions;

pub use predictions::{AccuracyStats, DailyAccuracy, Outcome, PipelineRow, Prediction, TypeAccuracy};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store not initialized; call initialize() first")]
    NotInitialized,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("join error: {0}")]
    Join(String),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Versioned cache plus append-only event log, backed by SQLite.
///
/// Every mutation goes through one writer connection, so per-category
/// version bumps and their `cache_update` log entries are never interleaved.
/// Reads open short-lived connections and see the last committed write (WAL).
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    writer: Arc<Mutex<Option<Connection>>>,
    ready: Arc<AtomicBool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CacheEntry {
    pub category: String,
    pub data: Value,
    pub version: i64,
    pub last_updated: String,
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EventRow {
    pub id: i64,
    pub timestamp: String,
    pub event_type: String,
    pub category: Option<String>,
    pub data: Option<Value>,
    pub metadata: Option<Value>,
}

/// Filters for [`Kernel::get_events`]; set fields are ANDed.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub event_type: Option<String>,
    pub category: Option<String>,
    pub limit: i64,
}

impl EventQuery {
    pub fn recent(limit: i64) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

pub fn now_iso() -> String {
    fmt_ts(&Utc::now())
}

pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn conversion_failure(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_failure(idx, e))
}

/// Decode a stored JSON column; corrupt text is a conversion error.
pub(crate) fn parse_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn parse_json_opt(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<Value>> {
    raw.map(|s| parse_json(idx, &s)).transpose()
}

impl Kernel {
    /// Describe a store at `db_path` without touching disk. Every operation
    /// fails with [`StoreError::NotInitialized`] until [`Kernel::initialize`].
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            writer: Arc::new(Mutex::new(None)),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Convenience: `hub.db` inside `dir`, initialized.
    pub fn open(dir: &Path) -> Result<Self> {
        let kernel = Self::new(dir.join("hub.db"));
        kernel.initialize()?;
        Ok(kernel)
    }

    pub fn initialize(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.db_path)?;
        // Pragmas tuned for a single writer with concurrent readers
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(busy_timeout())?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        *self.writer.lock() = Some(conn);
        self.ready.store(true, Ordering::SeqCst);
        debug!(path = %self.db_path.display(), "store initialized");
        Ok(())
    }

    pub fn close(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.writer.lock().take();
    }

    pub fn is_initialized(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache (
              category TEXT PRIMARY KEY,
              data TEXT NOT NULL,
              version INTEGER NOT NULL DEFAULT 1,
              last_updated TEXT NOT NULL,
              metadata TEXT
            );

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp TEXT NOT NULL,
              event_type TEXT NOT NULL,
              category TEXT,
              data TEXT,
              metadata TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

            -- Shadow predictions: one row per prediction, resolved exactly once
            CREATE TABLE IF NOT EXISTS predictions (
              id TEXT PRIMARY KEY,
              timestamp TEXT NOT NULL,
              context TEXT NOT NULL,
              predicted_actions TEXT NOT NULL,
              outcome TEXT NOT NULL DEFAULT 'pending',
              actual TEXT,
              confidence REAL NOT NULL,
              is_exploration INTEGER NOT NULL DEFAULT 0,
              propagated_count INTEGER NOT NULL DEFAULT 0,
              window_seconds INTEGER NOT NULL,
              resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_predictions_timestamp ON predictions(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_predictions_outcome ON predictions(outcome);

            -- Human decisions on suggested predictions; at most one per prediction
            CREATE TABLE IF NOT EXISTS suggestion_decisions (
              prediction_id TEXT PRIMARY KEY,
              approved INTEGER NOT NULL,
              decided_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_decided_at ON suggestion_decisions(decided_at);

            -- Singleton rollout state (id is always 1)
            CREATE TABLE IF NOT EXISTS pipeline_state (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              current_stage TEXT NOT NULL,
              stage_entered_at TEXT NOT NULL,
              backtest_accuracy REAL,
              shadow_accuracy_7d REAL,
              suggest_approval_rate_14d REAL,
              autonomous_contexts TEXT,
              updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub(crate) fn reader(&self) -> Result<Connection> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(busy_timeout())?;
        Ok(conn)
    }

    pub(crate) fn write<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.writer.lock();
        let conn = guard.as_mut().ok_or(StoreError::NotInitialized)?;
        f(conn)
    }

    // ---------- Cache ----------

    pub fn get(&self, category: &str) -> Result<Option<CacheEntry>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT category,data,version,last_updated,metadata FROM cache WHERE category=?",
        )?;
        let entry = stmt
            .query_row([category], |row| {
                let data_s: String = row.get(1)?;
                Ok(CacheEntry {
                    category: row.get(0)?,
                    data: parse_json(1, &data_s)?,
                    version: row.get(2)?,
                    last_updated: row.get(3)?,
                    metadata: parse_json_opt(4, row.get(4)?)?,
                })
            })
            .optional()?;
        Ok(entry)
    }

    /// Write `data` under `category` and return the new version (previous + 1,
    /// starting at 1). The upsert and its `cache_update` log entry commit
    /// together.
    pub fn set(&self, category: &str, data: &Value, metadata: Option<&Value>) -> Result<i64> {
        let data_s = serde_json::to_string(data)?;
        let meta_s = metadata.map(serde_json::to_string).transpose()?;
        let version = self.write(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<i64> = tx
                .query_row(
                    "SELECT version FROM cache WHERE category=?",
                    [category],
                    |row| row.get(0),
                )
                .optional()?;
            let version = current.unwrap_or(0) + 1;
            let now = now_iso();
            tx.execute(
                "INSERT INTO cache(category,data,version,last_updated,metadata) VALUES(?,?,?,?,?)
                 ON CONFLICT(category) DO UPDATE SET
                   data=excluded.data,
                   version=excluded.version,
                   last_updated=excluded.last_updated,
                   metadata=excluded.metadata",
                params![category, data_s, version, now, meta_s],
            )?;
            insert_event(
                &tx,
                &now,
                aria_topics::EVENT_CACHE_UPDATE,
                Some(category),
                None,
                Some(&json!({ "version": version })),
            )?;
            tx.commit()?;
            Ok(version)
        })?;
        #[cfg(feature = "metrics")]
        metrics::counter!("aria_cache_writes_total").increment(1);
        Ok(version)
    }

    /// Remove `category`; returns whether a row existed. Only an actual
    /// removal is logged.
    pub fn delete(&self, category: &str) -> Result<bool> {
        self.write(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let n = tx.execute("DELETE FROM cache WHERE category=?", [category])?;
            if n > 0 {
                insert_event(
                    &tx,
                    &now_iso(),
                    aria_topics::EVENT_CACHE_DELETE,
                    Some(category),
                    None,
                    None,
                )?;
            }
            tx.commit()?;
            Ok(n > 0)
        })
    }

    pub fn list_categories(&self) -> Result<Vec<String>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT category FROM cache ORDER BY category")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---------- Event log ----------

    pub fn log_event(
        &self,
        event_type: &str,
        category: Option<&str>,
        data: Option<&Value>,
        metadata: Option<&Value>,
    ) -> Result<i64> {
        self.write(|conn| insert_event(conn, &now_iso(), event_type, category, data, metadata))
    }

    /// Newest first: timestamp descending, id descending among equal timestamps.
    pub fn get_events(&self, query: &EventQuery) -> Result<Vec<EventRow>> {
        let conn = self.reader()?;
        let mut sql = String::from(
            "SELECT id,timestamp,event_type,category,data,metadata FROM events WHERE 1=1",
        );
        let mut args: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(t) = query.event_type.as_ref() {
            sql.push_str(" AND event_type=?");
            args.push(t);
        }
        if let Some(c) = query.category.as_ref() {
            sql.push_str(" AND category=?");
            args.push(c);
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
        let limit = query.limit.max(0);
        args.push(&limit);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), |row| {
            Ok(EventRow {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                event_type: row.get(2)?,
                category: row.get(3)?,
                data: parse_json_opt(4, row.get(4)?)?,
                metadata: parse_json_opt(5, row.get(5)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------
    // These helpers offload rusqlite work from the async scheduler.

    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Kernel) -> Result<T> + Send + 'static,
    {
        let k = self.clone();
        tokio::task::spawn_blocking(move || f(k))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn get_async(&self, category: &str) -> Result<Option<CacheEntry>> {
        let category = category.to_string();
        self.blocking(move |k| k.get(&category)).await
    }

    pub async fn set_async(
        &self,
        category: &str,
        data: Value,
        metadata: Option<Value>,
    ) -> Result<i64> {
        let category = category.to_string();
        self.blocking(move |k| k.set(&category, &data, metadata.as_ref()))
            .await
    }

    pub async fn delete_async(&self, category: &str) -> Result<bool> {
        let category = category.to_string();
        self.blocking(move |k| k.delete(&category)).await
    }

    pub async fn list_categories_async(&self) -> Result<Vec<String>> {
        self.blocking(|k| k.list_categories()).await
    }

    pub async fn log_event_async(
        &self,
        event_type: &str,
        category: Option<&str>,
        data: Option<Value>,
        metadata: Option<Value>,
    ) -> Result<i64> {
        let event_type = event_type.to_string();
        let category = category.map(|s| s.to_string());
        self.blocking(move |k| {
            k.log_event(
                &event_type,
                category.as_deref(),
                data.as_ref(),
                metadata.as_ref(),
            )
        })
        .await
    }

    pub async fn get_events_async(&self, query: EventQuery) -> Result<Vec<EventRow>> {
        self.blocking(move |k| k.get_events(&query)).await
    }
}

fn insert_event(
    conn: &Connection,
    timestamp: &str,
    event_type: &str,
    category: Option<&str>,
    data: Option<&Value>,
    metadata: Option<&Value>,
) -> Result<i64> {
    let data_s = data.map(serde_json::to_string).transpose()?;
    let meta_s = metadata.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO events(timestamp,event_type,category,data,metadata) VALUES (?,?,?,?,?)",
        params![timestamp, event_type, category, data_s, meta_s],
    )?;
    #[cfg(feature = "metrics")]
    metrics::counter!("aria_events_appended_total").increment(1);
    Ok(conn.last_insert_rowid())
}

fn busy_timeout() -> std::time::Duration {
    // Busy timeout (default 5000ms; override with ARIA_SQLITE_BUSY_MS)
    let busy_ms: u64 = std::env::var("ARIA_SQLITE_BUSY_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5000);
    std::time::Duration::from_millis(busy_ms)
}
