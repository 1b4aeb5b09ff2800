//! JSON response shapes for the dashboard API.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeOverview {
    pub exchange: String,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub started: i64,
    pub records_loaded: i64,
}

#[derive(Debug, Serialize)]
pub struct Overview {
    pub exchanges: Vec<ExchangeOverview>,
    pub total_records: i64,
    /// Any `started` progress record younger than two minutes.
    pub is_running: bool,
    /// The rendezvous file exists.
    pub shutdown_requested: bool,
    /// "disabled", "active" or "degraded" (drives the banner).
    pub remote_state: String,
}

#[derive(Debug, Serialize)]
pub struct DailyStatsRow {
    pub stats_date: String,
    pub exchange: String,
    pub total_files: i64,
    pub successful_files: i64,
    pub failed_files: i64,
    pub total_records: i64,
    pub avg_records_per_file: String,
    pub total_processing_time_seconds: f64,
    pub total_file_size_bytes: i64,
    pub avg_file_size_bytes: f64,
}

#[derive(Debug, Serialize)]
pub struct WeeklyStatsRow {
    pub week_ending: String,
    pub exchange: String,
    pub total_files: i64,
    pub successful_files: i64,
    pub failed_files: i64,
    pub total_records: i64,
    pub active_days: i64,
    pub avg_daily_records: String,
    pub total_processing_time_seconds: f64,
    pub total_file_size_bytes: i64,
}

#[derive(Debug, Serialize)]
pub struct ErrorRow {
    pub exchange: String,
    pub data_date: String,
    pub file_path: String,
    pub end_time: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Statistics {
    pub daily: Vec<DailyStatsRow>,
    pub weekly: Vec<WeeklyStatsRow>,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub shutdown_requested: bool,
}
