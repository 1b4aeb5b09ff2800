//! Best-effort mirror of the progress ledger and gold projections into the
//! remote relational store. The local store stays authoritative: a mirror
//! failure degrades this process's mirroring and never touches the local
//! transaction.

use anyhow::Result;
use common::config::RemoteConfig;
use common::types::{parse_ts, ProgressRecord};
use tokio_postgres::{Client, NoTls};

use crate::stats::{DailyStats, WeeklyStats};

const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

const REMOTE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS load_progress (
    exchange TEXT NOT NULL,
    data_date DATE NOT NULL,
    file_path TEXT NOT NULL,
    file_size_bytes BIGINT,
    start_time TIMESTAMPTZ,
    end_time TIMESTAMPTZ,
    status TEXT NOT NULL,
    records_loaded BIGINT,
    error_message TEXT,
    PRIMARY KEY (exchange, data_date)
);
CREATE TABLE IF NOT EXISTS gold_daily_stats (
    stats_date DATE NOT NULL,
    exchange TEXT NOT NULL,
    total_files BIGINT NOT NULL,
    successful_files BIGINT NOT NULL,
    failed_files BIGINT NOT NULL,
    total_records BIGINT NOT NULL,
    avg_records_per_file NUMERIC(20,2) NOT NULL,
    total_processing_time_seconds DOUBLE PRECISION NOT NULL,
    total_file_size_bytes BIGINT NOT NULL,
    avg_file_size_bytes DOUBLE PRECISION NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (stats_date, exchange)
);
CREATE TABLE IF NOT EXISTS gold_weekly_stats (
    week_ending DATE NOT NULL,
    exchange TEXT NOT NULL,
    total_files BIGINT NOT NULL,
    successful_files BIGINT NOT NULL,
    failed_files BIGINT NOT NULL,
    total_records BIGINT NOT NULL,
    active_days BIGINT NOT NULL,
    avg_daily_records NUMERIC(20,2) NOT NULL,
    total_processing_time_seconds DOUBLE PRECISION NOT NULL,
    total_file_size_bytes BIGINT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (week_ending, exchange)
);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// No credentials in the environment; mirroring was never on.
    Disabled,
    Active,
    /// Configured but unreachable; stays degraded for the process lifetime.
    Degraded,
}

pub struct RemoteLedger {
    client: Option<Client>,
    state: RemoteState,
}

impl RemoteLedger {
    pub fn disabled() -> Self {
        Self {
            client: None,
            state: RemoteState::Disabled,
        }
    }

    /// Connect once at startup. Every failure path logs a single line and
    /// returns a ledger whose mirror calls are no-ops.
    pub async fn connect(config: Option<RemoteConfig>) -> Self {
        let Some(config) = config else {
            tracing::info!("remote ledger not configured; mirroring disabled");
            return Self::disabled();
        };

        match Self::try_connect(&config).await {
            Ok(client) => {
                tracing::info!(host = %config.host, "remote ledger mirroring enabled");
                Self {
                    client: Some(client),
                    state: RemoteState::Active,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, host = %config.host, "remote ledger unreachable; continuing without mirror");
                Self {
                    client: None,
                    state: RemoteState::Degraded,
                }
            }
        }
    }

    async fn try_connect(config: &RemoteConfig) -> Result<Client> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .user(&config.user)
            .password(&config.password)
            .dbname(&config.dbname)
            .connect_timeout(CONNECT_TIMEOUT);

        let (client, connection) = pg.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "remote ledger connection task ended");
            }
        });

        client.batch_execute(REMOTE_SCHEMA).await?;
        Ok(client)
    }

    pub fn state(&self) -> RemoteState {
        self.state
    }

    pub fn is_degraded(&self) -> bool {
        self.state == RemoteState::Degraded
    }

    fn degrade(&mut self, op: &'static str, error: &tokio_postgres::Error) {
        tracing::warn!(error = %error, op, "remote mirror write failed; degrading for this run");
        metrics::counter!("lake_remote_mirror_failures_total", "op" => op).increment(1);
        self.client = None;
        self.state = RemoteState::Degraded;
    }

    pub async fn mirror_progress(&mut self, record: &ProgressRecord) {
        let Some(client) = &self.client else { return };
        let start_time = parse_ts(&record.start_time);
        let end_time = record.end_time.as_deref().and_then(parse_ts);
        let res = client
            .execute(
                "INSERT INTO load_progress
                    (exchange, data_date, file_path, file_size_bytes, start_time,
                     end_time, status, records_loaded, error_message)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (exchange, data_date) DO UPDATE SET
                    file_path = EXCLUDED.file_path,
                    file_size_bytes = EXCLUDED.file_size_bytes,
                    start_time = EXCLUDED.start_time,
                    end_time = EXCLUDED.end_time,
                    status = EXCLUDED.status,
                    records_loaded = EXCLUDED.records_loaded,
                    error_message = EXCLUDED.error_message",
                &[
                    &record.exchange.as_str(),
                    &record.data_date,
                    &record.file_path,
                    &record.file_size_bytes,
                    &start_time,
                    &end_time,
                    &record.status.as_str(),
                    &record.records_loaded,
                    &record.error_message,
                ],
            )
            .await;
        if let Err(e) = res {
            self.degrade("progress", &e);
        }
    }

    pub async fn mirror_daily(&mut self, stats: &DailyStats) {
        let Some(client) = &self.client else { return };
        let res = client
            .execute(
                "INSERT INTO gold_daily_stats
                    (stats_date, exchange, total_files, successful_files, failed_files,
                     total_records, avg_records_per_file, total_processing_time_seconds,
                     total_file_size_bytes, avg_file_size_bytes, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, CAST($7 AS NUMERIC(20,2)), $8, $9, $10, now())
                 ON CONFLICT (stats_date, exchange) DO UPDATE SET
                    total_files = EXCLUDED.total_files,
                    successful_files = EXCLUDED.successful_files,
                    failed_files = EXCLUDED.failed_files,
                    total_records = EXCLUDED.total_records,
                    avg_records_per_file = EXCLUDED.avg_records_per_file,
                    total_processing_time_seconds = EXCLUDED.total_processing_time_seconds,
                    total_file_size_bytes = EXCLUDED.total_file_size_bytes,
                    avg_file_size_bytes = EXCLUDED.avg_file_size_bytes,
                    updated_at = now()",
                &[
                    &stats.stats_date,
                    &stats.exchange.as_str(),
                    &stats.total_files,
                    &stats.successful_files,
                    &stats.failed_files,
                    &stats.total_records,
                    &stats.avg_records_per_file.to_string(),
                    &stats.total_processing_time_seconds,
                    &stats.total_file_size_bytes,
                    &stats.avg_file_size_bytes,
                ],
            )
            .await;
        if let Err(e) = res {
            self.degrade("daily_stats", &e);
        }
    }

    pub async fn mirror_weekly(&mut self, stats: &WeeklyStats) {
        let Some(client) = &self.client else { return };
        let res = client
            .execute(
                "INSERT INTO gold_weekly_stats
                    (week_ending, exchange, total_files, successful_files, failed_files,
                     total_records, active_days, avg_daily_records,
                     total_processing_time_seconds, total_file_size_bytes, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, CAST($8 AS NUMERIC(20,2)), $9, $10, now())
                 ON CONFLICT (week_ending, exchange) DO UPDATE SET
                    total_files = EXCLUDED.total_files,
                    successful_files = EXCLUDED.successful_files,
                    failed_files = EXCLUDED.failed_files,
                    total_records = EXCLUDED.total_records,
                    active_days = EXCLUDED.active_days,
                    avg_daily_records = EXCLUDED.avg_daily_records,
                    total_processing_time_seconds = EXCLUDED.total_processing_time_seconds,
                    total_file_size_bytes = EXCLUDED.total_file_size_bytes,
                    updated_at = now()",
                &[
                    &stats.week_ending,
                    &stats.exchange.as_str(),
                    &stats.total_files,
                    &stats.successful_files,
                    &stats.failed_files,
                    &stats.total_records,
                    &stats.active_days,
                    &stats.avg_daily_records.to_string(),
                    &stats.total_processing_time_seconds,
                    &stats.total_file_size_bytes,
                ],
            )
            .await;
        if let Err(e) = res {
            self.degrade("weekly_stats", &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use common::types::{Exchange, ProgressStatus};
    use rust_decimal::Decimal;

    fn record() -> ProgressRecord {
        ProgressRecord {
            exchange: Exchange::Lse,
            data_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            file_path: "k".to_string(),
            file_size_bytes: Some(1),
            start_time: "2025-01-15 10:00:00.000".to_string(),
            end_time: None,
            status: ProgressStatus::Started,
            records_loaded: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_disabled_mirror_is_a_noop() {
        let mut remote = RemoteLedger::disabled();
        assert_eq!(remote.state(), RemoteState::Disabled);
        assert!(!remote.is_degraded());

        // Mirror calls must be safe with no client behind them.
        remote.mirror_progress(&record()).await;
        remote
            .mirror_daily(&DailyStats {
                stats_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
                exchange: Exchange::Lse,
                total_files: 1,
                successful_files: 1,
                failed_files: 0,
                total_records: 10,
                avg_records_per_file: Decimal::new(1000, 2),
                total_processing_time_seconds: 1.0,
                total_file_size_bytes: 1,
                avg_file_size_bytes: 1.0,
            })
            .await;
        assert_eq!(remote.state(), RemoteState::Disabled);
    }

    #[tokio::test]
    async fn test_missing_config_disables_mirroring() {
        let remote = RemoteLedger::connect(None).await;
        assert_eq!(remote.state(), RemoteState::Disabled);
    }
}
