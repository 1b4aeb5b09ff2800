//! The unit of ingestion: exactly one `(exchange, date)` job. All failures
//! funnel into the ledger's `fail` branch and come back as a normal
//! `WorkerResult`; the runner decides the process exit code from those.

use std::time::Instant;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use common::db::{self, AsyncDb};
use common::object_store::ObjectStore;
use common::types::{Exchange, LoadError, ProgressStatus};
use tokio_util::sync::CancellationToken;

use crate::ledger::{ClaimOutcome, Ledger};

#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub exchange: Exchange,
    pub date: NaiveDate,
    pub status: ProgressStatus,
    pub records_loaded: Option<i64>,
    pub duration: std::time::Duration,
    pub message: Option<String>,
}

impl WorkerResult {
    fn new(
        exchange: Exchange,
        date: NaiveDate,
        status: ProgressStatus,
        records_loaded: Option<i64>,
        started: Instant,
        message: Option<String>,
    ) -> Self {
        Self {
            exchange,
            date,
            status,
            records_loaded,
            duration: started.elapsed(),
            message,
        }
    }
}

/// Run one `(exchange, date)` load.
///
/// The cancellation token is observed only before the ledger claim; once the
/// load transaction is open the file runs to commit or rollback through the
/// normal path, so shutdown can never tear a partial load.
pub async fn run_worker<S: ObjectStore>(
    db: &AsyncDb,
    ledger: &mut Ledger,
    store: &S,
    exchange: Exchange,
    date: NaiveDate,
    idempotent: bool,
    cancel: &CancellationToken,
) -> Result<WorkerResult> {
    let started = Instant::now();

    if cancel.is_cancelled() {
        ledger.skip(exchange, date, "shutdown").await?;
        metrics::counter!("lake_files_skipped_total", "reason" => "shutdown").increment(1);
        return Ok(WorkerResult::new(
            exchange,
            date,
            ProgressStatus::Skipped,
            None,
            started,
            Some("shutdown".to_string()),
        ));
    }

    let meta = match store.head(exchange, date).await {
        Ok(meta) => meta,
        Err(LoadError::NotFound { path }) => {
            tracing::info!(exchange = %exchange, date = %date, path, "no source file");
            ledger.skip(exchange, date, "no source file").await?;
            metrics::counter!("lake_files_skipped_total", "reason" => "not_found").increment(1);
            return Ok(WorkerResult::new(
                exchange,
                date,
                ProgressStatus::Skipped,
                None,
                started,
                Some("no source file".to_string()),
            ));
        }
        Err(e) => return fail(ledger, exchange, date, started, &e.to_string()).await,
    };

    match ledger
        .claim(exchange, date, meta.path.clone(), meta.size_bytes, idempotent)
        .await?
    {
        ClaimOutcome::Proceed => {}
        ClaimOutcome::AlreadyDone => {
            tracing::info!(exchange = %exchange, date = %date, "already completed; skipping");
            return Ok(WorkerResult::new(
                exchange,
                date,
                ProgressStatus::Skipped,
                None,
                started,
                Some("idempotent: already completed".to_string()),
            ));
        }
        ClaimOutcome::Conflict(message) => {
            // The record belongs to another actor; leave it untouched.
            tracing::warn!(exchange = %exchange, date = %date, message, "claim conflict");
            return Ok(WorkerResult::new(
                exchange,
                date,
                ProgressStatus::Failed,
                None,
                started,
                Some(message),
            ));
        }
    }

    tracing::info!(
        exchange = %exchange,
        date = %date,
        path = %meta.path,
        size_bytes = meta.size_bytes,
        "loading"
    );

    let blob = match store.fetch(exchange, date).await {
        Ok(blob) => blob,
        Err(e) => return fail(ledger, exchange, date, started, &e.to_string()).await,
    };

    let source_file = meta.path.clone();
    let load_result = {
        let source_file = source_file.clone();
        db.call_named("worker.bulk_load", move |conn| {
            let reader = blob.into_reader()?;
            db::bulk_load_csv(conn, exchange, date, &source_file, reader, Utc::now())
        })
        .await
    };

    let inserted = match load_result {
        Ok(inserted) => inserted,
        Err(e) => {
            // The transaction is already rolled back; record the failure and
            // return normally.
            return fail(ledger, exchange, date, started, &format!("{e:#}")).await;
        }
    };

    let records_loaded = {
        let source_file = source_file.clone();
        db.call_named("worker.count_records", move |conn| {
            db::count_loaded_records(conn, exchange, date, &source_file)
        })
        .await?
    };
    ledger.complete(exchange, date, records_loaded).await?;

    metrics::counter!("lake_files_completed_total", "exchange" => exchange.as_str())
        .increment(1);
    metrics::counter!("lake_records_loaded_total", "exchange" => exchange.as_str())
        .increment(records_loaded.max(0) as u64);
    metrics::histogram!("lake_file_load_seconds").record(started.elapsed().as_secs_f64());

    tracing::info!(
        exchange = %exchange,
        date = %date,
        inserted,
        records_loaded,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "load completed"
    );

    Ok(WorkerResult::new(
        exchange,
        date,
        ProgressStatus::Completed,
        Some(records_loaded),
        started,
        None,
    ))
}

async fn fail(
    ledger: &mut Ledger,
    exchange: Exchange,
    date: NaiveDate,
    started: Instant,
    message: &str,
) -> Result<WorkerResult> {
    tracing::warn!(exchange = %exchange, date = %date, error = message, "load failed");
    ledger.fail(exchange, date, message).await?;
    metrics::counter!("lake_files_failed_total", "exchange" => exchange.as_str()).increment(1);
    Ok(WorkerResult::new(
        exchange,
        date,
        ProgressStatus::Failed,
        None,
        started,
        Some(message.to_string()),
    ))
}
