//! One invocation: a set of dates crossed with the chosen exchanges, run
//! sequentially against this process's store file. The runner never raises
//! for a failed exchange; it walks the full list and folds the outcomes
//! into the process exit code.

use anyhow::Result;
use chrono::NaiveDate;
use common::db::AsyncDb;
use common::object_store::ObjectStore;
use common::types::{Exchange, ProgressStatus, DATE_FORMAT};
use tokio_util::sync::CancellationToken;

use crate::ledger::Ledger;
use crate::stats::week_ending;
use crate::worker::{self, WorkerResult};

pub async fn run_date<S: ObjectStore>(
    db: &AsyncDb,
    ledger: &mut Ledger,
    store: &S,
    date: NaiveDate,
    exchanges: &[Exchange],
    idempotent: bool,
    cancel: &CancellationToken,
) -> Result<Vec<WorkerResult>> {
    let mut results = Vec::with_capacity(exchanges.len());
    for &exchange in exchanges {
        let result =
            worker::run_worker(db, ledger, store, exchange, date, idempotent, cancel).await?;
        tracing::info!(
            exchange = %exchange,
            date = %date,
            status = result.status.as_str(),
            records = result.records_loaded,
            elapsed_secs = result.duration.as_secs_f64(),
            message = result.message.as_deref().unwrap_or(""),
            "exchange finished"
        );
        results.push(result);
    }
    Ok(results)
}

/// 0 when every exchange ended `completed` or `skipped`.
pub fn exit_code(results: &[WorkerResult]) -> i32 {
    if results.iter().any(|r| r.status == ProgressStatus::Failed) {
        1
    } else {
        0
    }
}

/// Operator-facing wrap-up read straight from the gold tables.
pub async fn print_statistics(db: &AsyncDb, dates: &[NaiveDate]) -> Result<()> {
    let date_strs: Vec<String> = dates
        .iter()
        .map(|d| d.format(DATE_FORMAT).to_string())
        .collect();
    let mut weeks: Vec<String> = dates
        .iter()
        .map(|d| week_ending(*d).format(DATE_FORMAT).to_string())
        .collect();
    weeks.sort();
    weeks.dedup();

    let daily = {
        let date_strs = date_strs.clone();
        db.call(move |conn| {
            let mut rows = Vec::new();
            let mut stmt = conn.prepare(
                "SELECT stats_date, exchange, total_files, successful_files, failed_files,
                        total_records, avg_records_per_file, total_processing_time_seconds,
                        total_file_size_bytes
                 FROM gold_daily_stats WHERE stats_date = ?1 AND exchange = ?2",
            )?;
            for date in &date_strs {
                for exchange in Exchange::ALL {
                    let row = stmt
                        .query_row(rusqlite::params![date, exchange.as_str()], |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, i64>(3)?,
                                row.get::<_, i64>(4)?,
                                row.get::<_, i64>(5)?,
                                row.get::<_, String>(6)?,
                                row.get::<_, f64>(7)?,
                                row.get::<_, i64>(8)?,
                            ))
                        })
                        .ok();
                    if let Some(row) = row {
                        rows.push(row);
                    }
                }
            }
            Ok(rows)
        })
        .await?
    };

    println!("\n================ DAILY STATISTICS SUMMARY ================");
    println!(
        "{:<12} {:<5} {:>6} {:>5} {:>5} {:>14} {:>16} {:>10} {:>14}",
        "date", "exch", "files", "ok", "fail", "records", "avg_records", "secs", "bytes"
    );
    for (date, exchange, files, ok, fail, records, avg, secs, bytes) in daily {
        println!(
            "{date:<12} {exchange:<5} {files:>6} {ok:>5} {fail:>5} {records:>14} {avg:>16} {secs:>10.1} {bytes:>14}"
        );
    }

    let weekly = db
        .call(move |conn| {
            let mut rows = Vec::new();
            let mut stmt = conn.prepare(
                "SELECT week_ending, exchange, total_files, successful_files, failed_files,
                        total_records, active_days, avg_daily_records
                 FROM gold_weekly_stats WHERE week_ending = ?1 AND exchange = ?2",
            )?;
            for week in &weeks {
                for exchange in Exchange::ALL {
                    let row = stmt
                        .query_row(rusqlite::params![week, exchange.as_str()], |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, i64>(3)?,
                                row.get::<_, i64>(4)?,
                                row.get::<_, i64>(5)?,
                                row.get::<_, i64>(6)?,
                                row.get::<_, String>(7)?,
                            ))
                        })
                        .ok();
                    if let Some(row) = row {
                        rows.push(row);
                    }
                }
            }
            Ok(rows)
        })
        .await?;

    println!("\n================ WEEKLY ROLLING STATISTICS ================");
    println!(
        "{:<12} {:<5} {:>6} {:>5} {:>5} {:>14} {:>6} {:>16}",
        "week_ending", "exch", "files", "ok", "fail", "records", "days", "avg_daily"
    );
    for (week, exchange, files, ok, fail, records, days, avg) in weekly {
        println!(
            "{week:<12} {exchange:<5} {files:>6} {ok:>5} {fail:>5} {records:>14} {days:>6} {avg:>16}"
        );
    }
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteLedger;
    use common::object_store::FsObjectStore;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn write_blob(root: &std::path::Path, exchange: Exchange, d: NaiveDate, csv_text: &str) {
        let key = common::object_store::blob_key("lseg", "tick-history", exchange, d);
        let path = root.join(&key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = std::fs::File::create(&path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(csv_text.as_bytes()).unwrap();
        enc.finish().unwrap();
    }

    #[tokio::test]
    async fn test_clean_single_date_all_exchanges() {
        let dir = tempfile::tempdir().unwrap();
        let d = date("2025-01-15");
        for exchange in Exchange::ALL {
            write_blob(dir.path(), exchange, d, "a,b\n1,2\n3,4\n");
        }

        let db = AsyncDb::open(":memory:").await.unwrap();
        let mut ledger = Ledger::new(db.clone(), RemoteLedger::disabled(), 2);
        let store = FsObjectStore::new(dir.path(), "lseg", "tick-history");
        let cancel = CancellationToken::new();

        let results = run_date(&db, &mut ledger, &store, d, &Exchange::ALL, true, &cancel)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|r| r.status == ProgressStatus::Completed));
        assert_eq!(exit_code(&results), 0);

        // One daily row per exchange.
        let rows: i64 = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM gold_daily_stats WHERE stats_date = '2025-01-15'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(rows, 3);

        print_statistics(&db, &[d]).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_date_all_skipped_exit_zero() {
        let dir = tempfile::tempdir().unwrap();
        let db = AsyncDb::open(":memory:").await.unwrap();
        let mut ledger = Ledger::new(db.clone(), RemoteLedger::disabled(), 2);
        let store = FsObjectStore::new(dir.path(), "lseg", "tick-history");
        let cancel = CancellationToken::new();

        let results = run_date(
            &db,
            &mut ledger,
            &store,
            date("2025-02-29"),
            &Exchange::ALL,
            true,
            &cancel,
        )
        .await
        .unwrap();

        assert!(results.iter().all(|r| r.status == ProgressStatus::Skipped));
        assert_eq!(exit_code(&results), 0);

        // Daily rows exist with zeros.
        let zeros: i64 = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM gold_daily_stats
                     WHERE stats_date = '2025-02-29' AND successful_files = 0",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(zeros, 3);
    }

    #[tokio::test]
    async fn test_one_bad_exchange_fails_run_but_not_others() {
        let dir = tempfile::tempdir().unwrap();
        let d = date("2025-01-15");
        write_blob(dir.path(), Exchange::Lse, d, "a,b\n1,2\n");
        write_blob(dir.path(), Exchange::Cme, d, "a,b\n1,2\nbad,row,extra\n");
        write_blob(dir.path(), Exchange::Nyq, d, "a,b\n5,6\n");

        let db = AsyncDb::open(":memory:").await.unwrap();
        let mut ledger = Ledger::new(db.clone(), RemoteLedger::disabled(), 2);
        let store = FsObjectStore::new(dir.path(), "lseg", "tick-history");
        let cancel = CancellationToken::new();

        let results = run_date(&db, &mut ledger, &store, d, &Exchange::ALL, true, &cancel)
            .await
            .unwrap();

        assert_eq!(results[0].status, ProgressStatus::Completed);
        assert_eq!(results[1].status, ProgressStatus::Failed);
        assert_eq!(results[2].status, ProgressStatus::Completed);
        assert_eq!(exit_code(&results), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_skips_remaining_exchanges() {
        let dir = tempfile::tempdir().unwrap();
        let d = date("2025-01-15");
        for exchange in Exchange::ALL {
            write_blob(dir.path(), exchange, d, "a,b\n1,2\n");
        }

        let db = AsyncDb::open(":memory:").await.unwrap();
        let mut ledger = Ledger::new(db.clone(), RemoteLedger::disabled(), 2);
        let store = FsObjectStore::new(dir.path(), "lseg", "tick-history");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = run_date(&db, &mut ledger, &store, d, &Exchange::ALL, true, &cancel)
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.status == ProgressStatus::Skipped));
        assert!(results
            .iter()
            .all(|r| r.message.as_deref() == Some("shutdown")));

        // No bronze rows appeared anywhere.
        for exchange in Exchange::ALL {
            let count = db
                .call(move |conn| common::db::bronze_slice_count(conn, exchange, d))
                .await
                .unwrap();
            assert_eq!(count, 0);
        }
    }
}
