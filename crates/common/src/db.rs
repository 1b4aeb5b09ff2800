use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OpenFlags};

use crate::object_store::RecordReader;
use crate::types::{format_ts, Exchange, LoadError, DATE_FORMAT};

/// Synchronous handle over the analytical store file. One writer per process;
/// readers (the dashboard) open separate read-only connections.
pub struct Database {
    pub conn: Connection,
}

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open the store at `path`, set PRAGMAs (WAL, busy_timeout) and create
    /// the ledger/stats schema — all on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        // Schema init requires a write lock. The dashboard and a concurrent
        // admin sqlite3 session can hold the file briefly; retry with backoff
        // instead of crash-looping under systemd.
        //
        // Use a short SQLite busy_timeout per attempt so backoff is handled here.
        let mut backoff = std::time::Duration::from_secs(1);
        let max_backoff = std::time::Duration::from_secs(30);
        let max_total_wait = std::time::Duration::from_secs(10 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    conn.execute_batch(SCHEMA)?;
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    let is_locked = matches!(
                        err,
                        rusqlite::Error::SqliteFailure(
                            rusqlite::ffi::Error {
                                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                                ..
                            },
                            _,
                        )
                    );
                    if !is_locked {
                        return Err(
                            anyhow::Error::from(err).context("AsyncDb::open: schema init failed")
                        );
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: schema init failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying schema init"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and
    /// errors. Measures full wall-clock time including queueing on the
    /// dedicated SQLite thread.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        match &res {
            Ok(_) => {
                metrics::histogram!(
                    "lake_db_query_latency_ms",
                    "op" => op,
                    "status" => "ok"
                )
                .record(ms);
            }
            Err(_) => {
                metrics::histogram!(
                    "lake_db_query_latency_ms",
                    "op" => op,
                    "status" => "err"
                )
                .record(ms);
                metrics::counter!("lake_db_query_errors_total", "op" => op).increment(1);
            }
        }

        res
    }
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // busy_timeout via the rusqlite API — makes SQLite retry for up to 30s
        // when the file is locked by another connection.
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Read-only connection for the dashboard. Each request gets a fresh
    /// connection; WAL handles concurrent reads without blocking the writer.
    pub fn open_readonly(path: &str) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

/// Ledger, projection and state tables. Bronze fact tables are created per
/// exchange at first load, with their column set discovered from the file.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS load_progress (
    exchange TEXT NOT NULL,            -- LSE, CME, NYQ
    data_date TEXT NOT NULL,           -- YYYY-MM-DD
    file_path TEXT NOT NULL,           -- object-store key
    file_size_bytes INTEGER,           -- compressed size from head()
    start_time TEXT NOT NULL,
    end_time TEXT,
    status TEXT NOT NULL,              -- started, completed, failed, skipped
    records_loaded INTEGER,            -- set iff completed
    error_message TEXT,                -- set iff failed
    owner_pid INTEGER,                 -- claimer's pid, for liveness checks
    PRIMARY KEY (exchange, data_date)
);

CREATE TABLE IF NOT EXISTS gold_daily_stats (
    stats_date TEXT NOT NULL,
    exchange TEXT NOT NULL,
    total_files INTEGER NOT NULL,
    successful_files INTEGER NOT NULL,
    failed_files INTEGER NOT NULL,
    total_records INTEGER NOT NULL,
    avg_records_per_file TEXT NOT NULL,        -- wide fixed-point, 2dp
    total_processing_time_seconds REAL NOT NULL,
    total_file_size_bytes INTEGER NOT NULL,
    avg_file_size_bytes REAL NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (stats_date, exchange)
);

CREATE TABLE IF NOT EXISTS gold_weekly_stats (
    week_ending TEXT NOT NULL,         -- Sunday closing the 7-day window
    exchange TEXT NOT NULL,
    total_files INTEGER NOT NULL,
    successful_files INTEGER NOT NULL,
    failed_files INTEGER NOT NULL,
    total_records INTEGER NOT NULL,
    active_days INTEGER NOT NULL,      -- days in window with >=1 completed file
    avg_daily_records TEXT NOT NULL,   -- wide fixed-point, 2dp
    total_processing_time_seconds REAL NOT NULL,
    total_file_size_bytes INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (week_ending, exchange)
);

-- Small key/value surface the dashboard reads (remote_degraded banner).
CREATE TABLE IF NOT EXISTS loader_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_load_progress_status ON load_progress(status);
CREATE INDEX IF NOT EXISTS idx_load_progress_date ON load_progress(data_date);
CREATE INDEX IF NOT EXISTS idx_load_progress_start_time ON load_progress(start_time);
CREATE INDEX IF NOT EXISTS idx_gold_daily_stats_date ON gold_daily_stats(stats_date);
"#;

/// Metadata columns appended to every bronze row. Source files must not
/// carry columns with these names.
pub const METADATA_COLUMNS: [&str; 4] =
    ["data_date", "exchange", "source_file", "ingestion_timestamp"];

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Columns currently pinned on a bronze table, in declaration order.
/// Empty when the table does not exist yet.
pub fn bronze_columns(conn: &Connection, exchange: Exchange) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let cols = stmt
        .query_map([exchange.bronze_table()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(cols)
}

/// Pin or widen the bronze table for `exchange` so it covers `headers`.
///
/// First file: CREATE TABLE with the file's columns (all TEXT) plus the four
/// metadata columns. Later files: union-by-name, adding unseen columns via
/// ALTER TABLE so older rows read NULL for them.
fn ensure_bronze_table(
    conn: &Connection,
    exchange: Exchange,
    headers: &[String],
) -> Result<(), LoadError> {
    let mut seen = std::collections::HashSet::new();
    for h in headers {
        if METADATA_COLUMNS.contains(&h.as_str()) {
            return Err(LoadError::malformed(format!(
                "source column {h:?} collides with a reserved metadata column"
            )));
        }
        if !seen.insert(h.as_str()) {
            return Err(LoadError::malformed(format!(
                "duplicate column {h:?} in source header"
            )));
        }
    }

    let existing = bronze_columns(conn, exchange)
        .map_err(|e| LoadError::transient(format!("pragma_table_info: {e}")))?;

    if existing.is_empty() {
        let mut cols: Vec<String> = headers.iter().map(|h| format!("{} TEXT", quote_ident(h))).collect();
        cols.push("data_date TEXT NOT NULL".to_string());
        cols.push("exchange TEXT NOT NULL".to_string());
        cols.push("source_file TEXT NOT NULL".to_string());
        cols.push("ingestion_timestamp TEXT NOT NULL".to_string());
        let sql = format!(
            "CREATE TABLE {} ({})",
            quote_ident(exchange.bronze_table()),
            cols.join(", ")
        );
        conn.execute(&sql, [])
            .map_err(|e| LoadError::transient(format!("create bronze table: {e}")))?;
        let idx = format!(
            "CREATE INDEX {} ON {} (data_date)",
            quote_ident(&format!("idx_{}_data_date", exchange.bronze_table())),
            quote_ident(exchange.bronze_table())
        );
        conn.execute(&idx, [])
            .map_err(|e| LoadError::transient(format!("create bronze index: {e}")))?;
    } else {
        for h in headers {
            if !existing.iter().any(|c| c == h) {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {} TEXT",
                    quote_ident(exchange.bronze_table()),
                    quote_ident(h)
                );
                conn.execute(&sql, [])
                    .map_err(|e| LoadError::transient(format!("widen bronze table: {e}")))?;
            }
        }
    }
    Ok(())
}

/// Stream every record of `reader` into the exchange's bronze table inside
/// one transaction. Commit means all rows are visible; any error rolls the
/// whole file back (the transaction is dropped un-committed).
///
/// The slice for `(data_date, exchange)` is cleared first, so a crash after
/// a committed load but before the ledger's `complete` cannot double rows on
/// the retry.
pub fn bulk_load_csv(
    conn: &mut Connection,
    exchange: Exchange,
    data_date: NaiveDate,
    source_file: &str,
    mut reader: RecordReader,
    loaded_at: DateTime<Utc>,
) -> Result<u64> {
    let headers: Vec<String> = reader.headers().to_vec();

    let tx = conn.transaction()?;
    ensure_bronze_table(&tx, exchange, &headers)?;

    let date_str = data_date.format(DATE_FORMAT).to_string();
    tx.execute(
        &format!(
            "DELETE FROM {} WHERE data_date = ?1 AND exchange = ?2",
            quote_ident(exchange.bronze_table())
        ),
        rusqlite::params![date_str, exchange.as_str()],
    )?;

    let mut columns: Vec<String> = headers.iter().map(|h| quote_ident(h)).collect();
    columns.extend(METADATA_COLUMNS.iter().map(|c| (*c).to_string()));
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let insert_sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(exchange.bronze_table()),
        columns.join(", "),
        placeholders.join(", ")
    );

    let ts_str = format_ts(loaded_at);
    let mut inserted = 0_u64;
    {
        let mut stmt = tx.prepare(&insert_sql)?;
        while let Some(record) = reader.next_record()? {
            let mut values: Vec<&str> = Vec::with_capacity(columns.len());
            for field in record.iter() {
                values.push(field);
            }
            values.push(&date_str);
            values.push(exchange.as_str());
            values.push(source_file);
            values.push(&ts_str);
            stmt.execute(rusqlite::params_from_iter(values))?;
            inserted += 1;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

/// Post-commit row count for one ingested file.
pub fn count_loaded_records(
    conn: &Connection,
    exchange: Exchange,
    data_date: NaiveDate,
    source_file: &str,
) -> Result<i64> {
    if bronze_columns(conn, exchange)?.is_empty() {
        return Ok(0);
    }
    let count = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE data_date = ?1 AND exchange = ?2 AND source_file = ?3",
            quote_ident(exchange.bronze_table())
        ),
        rusqlite::params![
            data_date.format(DATE_FORMAT).to_string(),
            exchange.as_str(),
            source_file
        ],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Row count of the whole `(exchange, data_date)` bronze slice, source file
/// regardless. Used by invariant checks.
pub fn bronze_slice_count(
    conn: &Connection,
    exchange: Exchange,
    data_date: NaiveDate,
) -> Result<i64> {
    if bronze_columns(conn, exchange)?.is_empty() {
        return Ok(0);
    }
    let count = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE data_date = ?1 AND exchange = ?2",
            quote_ident(exchange.bronze_table())
        ),
        rusqlite::params![data_date.format(DATE_FORMAT).to_string(), exchange.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::RecordReader;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gz_reader(csv_text: &str) -> RecordReader {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(csv_text.as_bytes()).unwrap();
        let bytes = enc.finish().unwrap();
        RecordReader::from_gzip_bytes(&bytes).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_schema_init_idempotent() {
        let db = Database::open(":memory:").unwrap();
        db.init_schema().unwrap();
        db.init_schema().unwrap(); // second call must not fail

        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(std::result::Result::ok)
            .collect();
        assert!(tables.contains(&"load_progress".to_string()));
        assert!(tables.contains(&"gold_daily_stats".to_string()));
        assert!(tables.contains(&"gold_weekly_stats".to_string()));
        assert!(tables.contains(&"loader_state".to_string()));
    }

    #[test]
    fn test_bulk_load_pins_schema_and_counts() {
        let mut db = Database::open(":memory:").unwrap();
        db.init_schema().unwrap();

        let reader = gz_reader("Ric,Price,Volume\nVOD.L,101.5,2000\nBARC.L,2.11,900\n");
        let n = bulk_load_csv(
            &mut db.conn,
            Exchange::Lse,
            date("2025-01-15"),
            "lse-file.csv.gz",
            reader,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(n, 2);

        let cols = bronze_columns(&db.conn, Exchange::Lse).unwrap();
        assert_eq!(
            cols,
            vec![
                "Ric",
                "Price",
                "Volume",
                "data_date",
                "exchange",
                "source_file",
                "ingestion_timestamp"
            ]
        );
        assert_eq!(
            count_loaded_records(&db.conn, Exchange::Lse, date("2025-01-15"), "lse-file.csv.gz")
                .unwrap(),
            2
        );
    }

    #[test]
    fn test_bulk_load_unions_new_columns_by_name() {
        let mut db = Database::open(":memory:").unwrap();
        db.init_schema().unwrap();

        let first = gz_reader("Ric,Price\nVOD.L,101.5\n");
        bulk_load_csv(
            &mut db.conn,
            Exchange::Lse,
            date("2025-01-15"),
            "day1.csv.gz",
            first,
            Utc::now(),
        )
        .unwrap();

        // Day 2 introduces a Venue column; day 1 rows must read NULL for it.
        let second = gz_reader("Ric,Price,Venue\nVOD.L,102.0,XLON\n");
        bulk_load_csv(
            &mut db.conn,
            Exchange::Lse,
            date("2025-01-16"),
            "day2.csv.gz",
            second,
            Utc::now(),
        )
        .unwrap();

        let cols = bronze_columns(&db.conn, Exchange::Lse).unwrap();
        assert!(cols.contains(&"Venue".to_string()));

        let old_venue: Option<String> = db
            .conn
            .query_row(
                "SELECT \"Venue\" FROM lse_market_data_raw WHERE data_date = '2025-01-15'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(old_venue, None);
    }

    #[test]
    fn test_bulk_load_rolls_back_on_malformed_row() {
        let mut db = Database::open(":memory:").unwrap();
        db.init_schema().unwrap();

        // Second data row has a field count mismatch.
        let reader = gz_reader("Ric,Price\nVOD.L,101.5\nBARC.L,2.11,extra\n");
        let res = bulk_load_csv(
            &mut db.conn,
            Exchange::Cme,
            date("2025-01-15"),
            "bad.csv.gz",
            reader,
            Utc::now(),
        );
        assert!(res.is_err());
        let msg = format!("{:#}", res.unwrap_err());
        assert!(msg.contains("malformed"), "got: {msg}");

        // Atomicity: nothing from the file is visible.
        assert_eq!(
            bronze_slice_count(&db.conn, Exchange::Cme, date("2025-01-15")).unwrap(),
            0
        );
    }

    #[test]
    fn test_bulk_load_clears_stale_slice_before_insert() {
        let mut db = Database::open(":memory:").unwrap();
        db.init_schema().unwrap();

        let first = gz_reader("Ric,Price\nVOD.L,1\nVOD.L,2\nVOD.L,3\n");
        bulk_load_csv(
            &mut db.conn,
            Exchange::Nyq,
            date("2025-01-15"),
            "f.csv.gz",
            first,
            Utc::now(),
        )
        .unwrap();

        // A retry of the same (exchange, date) must replace, not append.
        let retry = gz_reader("Ric,Price\nVOD.L,1\nVOD.L,2\n");
        let n = bulk_load_csv(
            &mut db.conn,
            Exchange::Nyq,
            date("2025-01-15"),
            "f.csv.gz",
            retry,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            bronze_slice_count(&db.conn, Exchange::Nyq, date("2025-01-15")).unwrap(),
            2
        );
    }

    #[test]
    fn test_bulk_load_header_only_file_is_empty_success() {
        let mut db = Database::open(":memory:").unwrap();
        db.init_schema().unwrap();

        let reader = gz_reader("Ric,Price,Volume\n");
        let n = bulk_load_csv(
            &mut db.conn,
            Exchange::Lse,
            date("2025-01-15"),
            "empty.csv.gz",
            reader,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(n, 0);
        // The table is still pinned from the header row.
        assert!(!bronze_columns(&db.conn, Exchange::Lse).unwrap().is_empty());
    }

    #[test]
    fn test_bulk_load_rejects_reserved_column() {
        let mut db = Database::open(":memory:").unwrap();
        db.init_schema().unwrap();

        let reader = gz_reader("Ric,exchange\nVOD.L,LSE\n");
        let res = bulk_load_csv(
            &mut db.conn,
            Exchange::Lse,
            date("2025-01-15"),
            "clash.csv.gz",
            reader,
            Utc::now(),
        );
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_async_db_open_creates_schema() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let tables: Vec<String> = db
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .filter_map(std::result::Result::ok)
                    .collect();
                Ok(rows)
            })
            .await
            .unwrap();
        assert!(tables.contains(&"load_progress".to_string()));
        assert!(tables.contains(&"gold_weekly_stats".to_string()));
    }

    #[tokio::test]
    async fn test_async_db_call_returns_error_on_bad_sql() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let result: Result<()> = db
            .call(|conn| {
                conn.execute("INVALID SQL", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
    }
}
