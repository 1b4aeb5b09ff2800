//! Daily and weekly statistics projection over the progress ledger.
//!
//! Both refreshes are full recomputations — a scan over at most a handful of
//! rows — so they stay trivially consistent with the ledger no matter which
//! transition triggered them.

use anyhow::Result;
use chrono::{Datelike, Duration, NaiveDate};
use common::types::{Exchange, DATE_FORMAT};
use rusqlite::Connection;
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub struct DailyStats {
    pub stats_date: NaiveDate,
    pub exchange: Exchange,
    pub total_files: i64,
    pub successful_files: i64,
    pub failed_files: i64,
    pub total_records: i64,
    pub avg_records_per_file: Decimal,
    pub total_processing_time_seconds: f64,
    pub total_file_size_bytes: i64,
    pub avg_file_size_bytes: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyStats {
    pub week_ending: NaiveDate,
    pub exchange: Exchange,
    pub total_files: i64,
    pub successful_files: i64,
    pub failed_files: i64,
    pub total_records: i64,
    pub active_days: i64,
    pub avg_daily_records: Decimal,
    pub total_processing_time_seconds: f64,
    pub total_file_size_bytes: i64,
}

/// The Sunday closing the rolling week that contains `date`; the window is
/// `[week_ending - 6, week_ending]`.
pub fn week_ending(date: NaiveDate) -> NaiveDate {
    let days_to_sunday = (7 - date.weekday().num_days_from_sunday()) % 7;
    date + Duration::days(i64::from(days_to_sunday))
}

fn wide_average(total: i64, denominator: i64) -> Decimal {
    // Decimal holds 28 significant digits, comfortably past the
    // trillion-scale record counts the projection has to carry.
    let mut avg = (Decimal::from(total) / Decimal::from(denominator.max(1))).round_dp(2);
    avg.rescale(2);
    avg
}

/// Recompute the daily row for `(stats_date, exchange)` from the progress
/// ledger and upsert it. Returns the row for the remote mirror.
pub fn recompute_daily(
    conn: &Connection,
    stats_date: NaiveDate,
    exchange: Exchange,
    now_str: &str,
) -> Result<DailyStats> {
    let date_str = stats_date.format(DATE_FORMAT).to_string();
    let (total_files, successful_files, failed_files, total_records, processing_secs, size_bytes) =
        conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(status = 'completed'), 0),
                COALESCE(SUM(status = 'failed'), 0),
                COALESCE(SUM(CASE WHEN status = 'completed' THEN records_loaded ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'completed' AND end_time IS NOT NULL
                    THEN (julianday(end_time) - julianday(start_time)) * 86400.0 ELSE 0 END), 0.0),
                COALESCE(SUM(CASE WHEN status = 'completed'
                    THEN COALESCE(file_size_bytes, 0) ELSE 0 END), 0)
             FROM load_progress
             WHERE data_date = ?1 AND exchange = ?2",
            rusqlite::params![date_str, exchange.as_str()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )?;

    let stats = DailyStats {
        stats_date,
        exchange,
        total_files,
        successful_files,
        failed_files,
        total_records,
        avg_records_per_file: wide_average(total_records, successful_files),
        total_processing_time_seconds: processing_secs,
        total_file_size_bytes: size_bytes,
        avg_file_size_bytes: size_bytes as f64 / successful_files.max(1) as f64,
    };

    conn.execute(
        "INSERT INTO gold_daily_stats
            (stats_date, exchange, total_files, successful_files, failed_files,
             total_records, avg_records_per_file, total_processing_time_seconds,
             total_file_size_bytes, avg_file_size_bytes, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(stats_date, exchange) DO UPDATE SET
            total_files = excluded.total_files,
            successful_files = excluded.successful_files,
            failed_files = excluded.failed_files,
            total_records = excluded.total_records,
            avg_records_per_file = excluded.avg_records_per_file,
            total_processing_time_seconds = excluded.total_processing_time_seconds,
            total_file_size_bytes = excluded.total_file_size_bytes,
            avg_file_size_bytes = excluded.avg_file_size_bytes,
            updated_at = excluded.updated_at",
        rusqlite::params![
            date_str,
            exchange.as_str(),
            stats.total_files,
            stats.successful_files,
            stats.failed_files,
            stats.total_records,
            stats.avg_records_per_file.to_string(),
            stats.total_processing_time_seconds,
            stats.total_file_size_bytes,
            stats.avg_file_size_bytes,
            now_str,
        ],
    )?;

    Ok(stats)
}

/// Recompute the weekly row whose window contains `changed_date` from the
/// trailing daily rows and upsert it. Days with zero completed files add
/// nothing to the sums and stay out of `active_days`.
pub fn recompute_weekly(
    conn: &Connection,
    changed_date: NaiveDate,
    exchange: Exchange,
    now_str: &str,
) -> Result<WeeklyStats> {
    let ending = week_ending(changed_date);
    let window_start = ending - Duration::days(6);
    let ending_str = ending.format(DATE_FORMAT).to_string();
    let start_str = window_start.format(DATE_FORMAT).to_string();

    let (total_files, successful_files, failed_files, total_records, active_days, processing_secs, size_bytes) =
        conn.query_row(
            "SELECT
                COALESCE(SUM(total_files), 0),
                COALESCE(SUM(successful_files), 0),
                COALESCE(SUM(failed_files), 0),
                COALESCE(SUM(total_records), 0),
                COALESCE(SUM(successful_files > 0), 0),
                COALESCE(SUM(total_processing_time_seconds), 0.0),
                COALESCE(SUM(total_file_size_bytes), 0)
             FROM gold_daily_stats
             WHERE exchange = ?1 AND stats_date BETWEEN ?2 AND ?3",
            rusqlite::params![exchange.as_str(), start_str, ending_str],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )?;

    // active_days == 0 implies total_records == 0, so the guarded
    // denominator inside wide_average yields 0.00.
    let avg_daily_records = wide_average(total_records, active_days);

    let stats = WeeklyStats {
        week_ending: ending,
        exchange,
        total_files,
        successful_files,
        failed_files,
        total_records,
        active_days,
        avg_daily_records,
        total_processing_time_seconds: processing_secs,
        total_file_size_bytes: size_bytes,
    };

    conn.execute(
        "INSERT INTO gold_weekly_stats
            (week_ending, exchange, total_files, successful_files, failed_files,
             total_records, active_days, avg_daily_records,
             total_processing_time_seconds, total_file_size_bytes, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(week_ending, exchange) DO UPDATE SET
            total_files = excluded.total_files,
            successful_files = excluded.successful_files,
            failed_files = excluded.failed_files,
            total_records = excluded.total_records,
            active_days = excluded.active_days,
            avg_daily_records = excluded.avg_daily_records,
            total_processing_time_seconds = excluded.total_processing_time_seconds,
            total_file_size_bytes = excluded.total_file_size_bytes,
            updated_at = excluded.updated_at",
        rusqlite::params![
            ending_str,
            exchange.as_str(),
            stats.total_files,
            stats.successful_files,
            stats.failed_files,
            stats.total_records,
            stats.active_days,
            stats.avg_daily_records.to_string(),
            stats.total_processing_time_seconds,
            stats.total_file_size_bytes,
            now_str,
        ],
    )?;

    Ok(stats)
}
