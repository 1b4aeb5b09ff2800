use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Timestamp format used everywhere in the analytical store. SQLite's date
/// functions (`julianday`, `datetime`) parse it natively.
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Exchange {
    Lse,
    Cme,
    Nyq,
}

impl Exchange {
    /// Dispatch order for a run. Workers always walk exchanges in this order.
    pub const ALL: [Exchange; 3] = [Exchange::Lse, Exchange::Cme, Exchange::Nyq];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lse => "LSE",
            Self::Cme => "CME",
            Self::Nyq => "NYQ",
        }
    }

    /// Bronze fact table for this exchange.
    pub fn bronze_table(&self) -> &'static str {
        match self {
            Self::Lse => "lse_market_data_raw",
            Self::Cme => "cme_market_data_raw",
            Self::Nyq => "nyq_market_data_raw",
        }
    }
}

impl std::str::FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LSE" => Ok(Self::Lse),
            "CME" => Ok(Self::Cme),
            "NYQ" => Ok(Self::Nyq),
            other => Err(format!("unknown exchange: {other}")),
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProgressStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

impl std::str::FromStr for ProgressStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown progress status: {other}")),
        }
    }
}

/// One row of the progress ledger: a single `(exchange, data_date)` load
/// attempt and its terminal outcome.
#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub exchange: Exchange,
    pub data_date: NaiveDate,
    pub file_path: String,
    pub file_size_bytes: Option<i64>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: ProgressStatus,
    pub records_loaded: Option<i64>,
    pub error_message: Option<String>,
}

/// Error taxonomy for a single load. Kinds map one-to-one onto the worker's
/// surfaced outcomes: `NotFound`/`Cancelled` become `skipped`, everything
/// else becomes `failed` with the message recorded in the ledger.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("source file not found: {path}")]
    NotFound { path: String },

    #[error("transient I/O failure: {message}")]
    TransientIo { message: String },

    #[error("malformed data: {message}")]
    DataMalformed { message: String },

    #[error("ledger conflict: {message}")]
    LedgerConflict { message: String },

    #[error("cancelled by shutdown request")]
    Cancelled,

    #[error("remote ledger degraded: {message}")]
    RemoteDegraded { message: String },
}

impl LoadError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::DataMalformed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_exchange_round_trip_and_order() {
        for ex in Exchange::ALL {
            assert_eq!(Exchange::from_str(ex.as_str()).unwrap(), ex);
        }
        assert_eq!(
            Exchange::ALL.map(|e| e.as_str()),
            ["LSE", "CME", "NYQ"],
            "dispatch order is fixed"
        );
        assert!(Exchange::from_str("NASDAQ").is_err());
    }

    #[test]
    fn test_bronze_table_names() {
        assert_eq!(Exchange::Lse.bronze_table(), "lse_market_data_raw");
        assert_eq!(Exchange::Cme.bronze_table(), "cme_market_data_raw");
        assert_eq!(Exchange::Nyq.bronze_table(), "nyq_market_data_raw");
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            ProgressStatus::Started,
            ProgressStatus::Completed,
            ProgressStatus::Failed,
            ProgressStatus::Skipped,
        ] {
            assert_eq!(ProgressStatus::from_str(s.as_str()).unwrap(), s);
        }
        assert!(!ProgressStatus::Started.is_terminal());
        assert!(ProgressStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_ts_format_round_trip() {
        let now = Utc::now();
        let s = format_ts(now);
        let back = parse_ts(&s).unwrap();
        // Millisecond precision survives the round trip.
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
