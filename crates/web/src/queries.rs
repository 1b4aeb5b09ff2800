/// SQL queries for the dashboard. All read-only.
use anyhow::Result;
use rusqlite::Connection;

use crate::models::*;

pub fn overview(conn: &Connection, shutdown_requested: bool) -> Result<Overview> {
    let mut per_exchange: Vec<ExchangeOverview> = ["LSE", "CME", "NYQ"]
        .iter()
        .map(|ex| ExchangeOverview {
            exchange: (*ex).to_string(),
            completed: 0,
            failed: 0,
            skipped: 0,
            started: 0,
            records_loaded: 0,
        })
        .collect();

    let mut stmt = conn.prepare(
        "SELECT exchange, status, COUNT(*), COALESCE(SUM(records_loaded), 0)
         FROM load_progress GROUP BY exchange, status",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;
    for row in rows {
        let (exchange, status, count, records) = row?;
        let Some(entry) = per_exchange.iter_mut().find(|e| e.exchange == exchange) else {
            continue;
        };
        match status.as_str() {
            "completed" => {
                entry.completed = count;
                entry.records_loaded = records;
            }
            "failed" => entry.failed = count,
            "skipped" => entry.skipped = count,
            "started" => entry.started = count,
            _ => {}
        }
    }

    let total_records = per_exchange.iter().map(|e| e.records_loaded).sum();

    let is_running: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM load_progress
         WHERE status = 'started' AND start_time >= datetime('now', '-2 minutes')",
        [],
        |row| row.get(0),
    )?;

    let remote_state: String = conn
        .query_row(
            "SELECT value FROM loader_state WHERE key = 'remote_state'",
            [],
            |row| row.get(0),
        )
        .unwrap_or_else(|_| "disabled".to_string());

    Ok(Overview {
        exchanges: per_exchange,
        total_records,
        is_running,
        shutdown_requested,
        remote_state,
    })
}

/// Daily statistics as a time series, oldest first, suitable for plotting.
pub fn progress_detail(conn: &Connection) -> Result<Vec<DailyStatsRow>> {
    let mut stmt = conn.prepare(
        "SELECT stats_date, exchange, total_files, successful_files, failed_files,
                total_records, avg_records_per_file, total_processing_time_seconds,
                total_file_size_bytes, avg_file_size_bytes
         FROM gold_daily_stats
         ORDER BY stats_date ASC, exchange ASC",
    )?;
    let rows = stmt.query_map([], daily_row)?;
    Ok(rows.filter_map(std::result::Result::ok).collect())
}

pub fn recent_errors(conn: &Connection, limit: i64) -> Result<Vec<ErrorRow>> {
    let mut stmt = conn.prepare(
        "SELECT exchange, data_date, file_path, end_time, error_message
         FROM load_progress
         WHERE status = 'failed'
         ORDER BY end_time DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit], |row| {
        Ok(ErrorRow {
            exchange: row.get(0)?,
            data_date: row.get(1)?,
            file_path: row.get(2)?,
            end_time: row.get(3)?,
            error_message: row.get(4)?,
        })
    })?;
    Ok(rows.filter_map(std::result::Result::ok).collect())
}

/// Most recent daily and weekly aggregate rows.
pub fn statistics(conn: &Connection) -> Result<Statistics> {
    let mut stmt = conn.prepare(
        "SELECT stats_date, exchange, total_files, successful_files, failed_files,
                total_records, avg_records_per_file, total_processing_time_seconds,
                total_file_size_bytes, avg_file_size_bytes
         FROM gold_daily_stats
         ORDER BY stats_date DESC, exchange ASC
         LIMIT 30",
    )?;
    let daily = stmt
        .query_map([], daily_row)?
        .filter_map(std::result::Result::ok)
        .collect();

    let mut stmt = conn.prepare(
        "SELECT week_ending, exchange, total_files, successful_files, failed_files,
                total_records, active_days, avg_daily_records,
                total_processing_time_seconds, total_file_size_bytes
         FROM gold_weekly_stats
         ORDER BY week_ending DESC, exchange ASC
         LIMIT 12",
    )?;
    let weekly = stmt
        .query_map([], |row| {
            Ok(WeeklyStatsRow {
                week_ending: row.get(0)?,
                exchange: row.get(1)?,
                total_files: row.get(2)?,
                successful_files: row.get(3)?,
                failed_files: row.get(4)?,
                total_records: row.get(5)?,
                active_days: row.get(6)?,
                avg_daily_records: row.get(7)?,
                total_processing_time_seconds: row.get(8)?,
                total_file_size_bytes: row.get(9)?,
            })
        })?
        .filter_map(std::result::Result::ok)
        .collect();

    Ok(Statistics { daily, weekly })
}

fn daily_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyStatsRow> {
    Ok(DailyStatsRow {
        stats_date: row.get(0)?,
        exchange: row.get(1)?,
        total_files: row.get(2)?,
        successful_files: row.get(3)?,
        failed_files: row.get(4)?,
        total_records: row.get(5)?,
        avg_records_per_file: row.get(6)?,
        total_processing_time_seconds: row.get(7)?,
        total_file_size_bytes: row.get(8)?,
        avg_file_size_bytes: row.get(9)?,
    })
}
