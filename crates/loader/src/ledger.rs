//! The progress ledger: sole writer of `load_progress` and the gold
//! projections. Every transition runs in one local transaction (the
//! authoritative write) and is then mirrored to the remote store
//! best-effort.

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use common::db::AsyncDb;
use common::types::{format_ts, parse_ts, Exchange, ProgressRecord, ProgressStatus, DATE_FORMAT};
use rusqlite::{Connection, OptionalExtension};

use crate::remote::{RemoteLedger, RemoteState};
use crate::stats;

/// Error messages are abbreviated before they land in the ledger; full
/// detail stays in the log.
const MAX_ERROR_LEN: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the record; it is now `started`.
    Proceed,
    /// A completed record exists; idempotent resume skips the file.
    AlreadyDone,
    /// The record is held elsewhere (or requires `--resume` to retry).
    Conflict(String),
}

pub struct Ledger {
    db: AsyncDb,
    remote: RemoteLedger,
    stale_after: Duration,
}

impl Ledger {
    pub fn new(db: AsyncDb, remote: RemoteLedger, claim_stale_hours: i64) -> Self {
        Self {
            db,
            remote,
            stale_after: Duration::hours(claim_stale_hours),
        }
    }

    pub fn remote_state(&self) -> RemoteState {
        self.remote.state()
    }

    /// Claim `(exchange, date)` for loading.
    ///
    /// Decision table:
    /// - no record: insert `started`, `Proceed`;
    /// - `completed`: `AlreadyDone`;
    /// - `failed`/`skipped` in idempotent mode: reset to `started`, `Proceed`;
    /// - `started` held by a live process (same pid, or a foreign pid that is
    ///   still running; when liveness cannot be probed, any record fresher
    ///   than the staleness threshold): `Conflict`;
    /// - `started` whose owner is gone (dead pid, or older than the
    ///   threshold) in idempotent mode: reclaim;
    /// - anything else outside idempotent mode: `Conflict`.
    pub async fn claim(
        &mut self,
        exchange: Exchange,
        date: NaiveDate,
        file_path: String,
        file_size_bytes: Option<i64>,
        idempotent: bool,
    ) -> Result<ClaimOutcome> {
        let stale_after = self.stale_after;
        let (outcome, record) = self
            .db
            .call_named("ledger.claim", move |conn| {
                let now = Utc::now();
                let tx = conn.transaction()?;

                let existing: Option<(String, String, Option<i64>)> = tx
                    .query_row(
                        "SELECT status, start_time, owner_pid FROM load_progress
                         WHERE exchange = ?1 AND data_date = ?2",
                        rusqlite::params![exchange.as_str(), date.format(DATE_FORMAT).to_string()],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;

                let outcome = match &existing {
                    None => ClaimOutcome::Proceed,
                    Some((status, start_time, owner_pid)) => match status.as_str() {
                        "completed" => ClaimOutcome::AlreadyDone,
                        "started" => {
                            let age = parse_ts(start_time)
                                .map_or(Duration::zero(), |started_at| now - started_at);
                            if claim_is_held(*owner_pid, age, stale_after) {
                                ClaimOutcome::Conflict(
                                    "already in progress elsewhere".to_string(),
                                )
                            } else if idempotent {
                                ClaimOutcome::Proceed
                            } else {
                                ClaimOutcome::Conflict(format!(
                                    "abandoned started record (age {}h); re-run with --resume to reclaim",
                                    age.num_hours()
                                ))
                            }
                        }
                        terminal => {
                            if idempotent {
                                ClaimOutcome::Proceed
                            } else {
                                ClaimOutcome::Conflict(format!(
                                    "previous attempt ended {terminal}; re-run with --resume to retry"
                                ))
                            }
                        }
                    },
                };

                let mut record = None;
                if outcome == ClaimOutcome::Proceed {
                    tx.execute(
                        "INSERT INTO load_progress
                            (exchange, data_date, file_path, file_size_bytes, start_time,
                             end_time, status, records_loaded, error_message, owner_pid)
                         VALUES (?1, ?2, ?3, ?4, ?5, NULL, 'started', NULL, NULL, ?6)
                         ON CONFLICT(exchange, data_date) DO UPDATE SET
                            file_path = excluded.file_path,
                            file_size_bytes = excluded.file_size_bytes,
                            start_time = excluded.start_time,
                            end_time = NULL,
                            status = 'started',
                            records_loaded = NULL,
                            error_message = NULL,
                            owner_pid = excluded.owner_pid",
                        rusqlite::params![
                            exchange.as_str(),
                            date.format(DATE_FORMAT).to_string(),
                            file_path,
                            file_size_bytes,
                            format_ts(now),
                            i64::from(std::process::id()),
                        ],
                    )?;
                    record = Some(read_progress(&tx, exchange, date)?);
                }
                tx.commit()?;
                Ok((outcome, record))
            })
            .await?;

        if let Some(record) = record {
            self.remote.mirror_progress(&record).await;
            self.publish_remote_state().await?;
        }
        Ok(outcome)
    }

    /// Terminal transition to `completed`; refreshes the projections.
    pub async fn complete(
        &mut self,
        exchange: Exchange,
        date: NaiveDate,
        records_loaded: i64,
    ) -> Result<()> {
        self.finish(exchange, date, ProgressStatus::Completed, Some(records_loaded), None)
            .await
    }

    /// Terminal transition to `failed` with the abbreviated error message.
    pub async fn fail(&mut self, exchange: Exchange, date: NaiveDate, error: &str) -> Result<()> {
        self.finish(
            exchange,
            date,
            ProgressStatus::Failed,
            None,
            Some(abbreviate(error)),
        )
        .await
    }

    /// Terminal transition to `skipped`. The reason is logged but not stored:
    /// `error_message` is reserved for failures.
    pub async fn skip(&mut self, exchange: Exchange, date: NaiveDate, reason: &str) -> Result<()> {
        tracing::info!(exchange = %exchange, date = %date, reason, "skipping");
        self.finish(exchange, date, ProgressStatus::Skipped, None, None)
            .await
    }

    async fn finish(
        &mut self,
        exchange: Exchange,
        date: NaiveDate,
        status: ProgressStatus,
        records_loaded: Option<i64>,
        error_message: Option<String>,
    ) -> Result<()> {
        let (record, daily, weekly) = self
            .db
            .call_named("ledger.finish", move |conn| {
                let now_str = format_ts(Utc::now());
                let tx = conn.transaction()?;

                // A completed record can only be displaced by an explicit
                // idempotent re-claim, never by a stray skip/fail (e.g. a
                // shutdown skip landing on a date loaded in an earlier run).
                let guard = if status == ProgressStatus::Completed {
                    ""
                } else {
                    " WHERE load_progress.status != 'completed'"
                };
                tx.execute(
                    &format!(
                        "INSERT INTO load_progress
                            (exchange, data_date, file_path, file_size_bytes, start_time,
                             end_time, status, records_loaded, error_message)
                         VALUES (?1, ?2, '', NULL, ?3, ?3, ?4, ?5, ?6)
                         ON CONFLICT(exchange, data_date) DO UPDATE SET
                            end_time = excluded.end_time,
                            status = excluded.status,
                            records_loaded = excluded.records_loaded,
                            error_message = excluded.error_message{guard}"
                    ),
                    rusqlite::params![
                        exchange.as_str(),
                        date.format(DATE_FORMAT).to_string(),
                        now_str,
                        status.as_str(),
                        records_loaded,
                        error_message,
                    ],
                )?;

                let daily = stats::recompute_daily(&tx, date, exchange, &now_str)?;
                let weekly = stats::recompute_weekly(&tx, date, exchange, &now_str)?;
                let record = read_progress(&tx, exchange, date)?;
                tx.commit()?;
                Ok((record, daily, weekly))
            })
            .await?;

        self.remote.mirror_progress(&record).await;
        self.remote.mirror_daily(&daily).await;
        self.remote.mirror_weekly(&weekly).await;
        self.publish_remote_state().await?;
        Ok(())
    }

    /// Write the mirror's health into `loader_state` so the dashboard can
    /// show the degraded banner without talking to the remote store itself.
    pub async fn publish_remote_state(&self) -> Result<()> {
        let state = match self.remote.state() {
            RemoteState::Disabled => "disabled",
            RemoteState::Active => "active",
            RemoteState::Degraded => "degraded",
        };
        self.db
            .call_named("ledger.remote_state", move |conn| {
                conn.execute(
                    "INSERT INTO loader_state (key, value, updated_at)
                     VALUES ('remote_state', ?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value, updated_at = excluded.updated_at",
                    rusqlite::params![state, format_ts(Utc::now())],
                )?;
                Ok(())
            })
            .await
    }
}

/// Is a `started` record still owned by a live claimer?
///
/// Within one store file the owner is identified by pid: our own pid means a
/// double-claim in this process, a foreign pid is probed for liveness. When
/// the probe is unavailable (no record of the pid, or a platform without
/// /proc) the staleness threshold decides instead.
fn claim_is_held(owner_pid: Option<i64>, age: Duration, stale_after: Duration) -> bool {
    match owner_pid {
        Some(pid) if pid == i64::from(std::process::id()) => true,
        Some(pid) => match process_alive(pid) {
            Some(alive) => alive,
            None => age < stale_after,
        },
        None => age < stale_after,
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: i64) -> Option<bool> {
    if pid <= 0 {
        return None;
    }
    Some(std::path::Path::new(&format!("/proc/{pid}")).exists())
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: i64) -> Option<bool> {
    None
}

pub fn read_progress(
    conn: &Connection,
    exchange: Exchange,
    date: NaiveDate,
) -> Result<ProgressRecord> {
    let record = conn.query_row(
        "SELECT file_path, file_size_bytes, start_time, end_time, status,
                records_loaded, error_message
         FROM load_progress WHERE exchange = ?1 AND data_date = ?2",
        rusqlite::params![exchange.as_str(), date.format(DATE_FORMAT).to_string()],
        |row| {
            Ok(ProgressRecord {
                exchange,
                data_date: date,
                file_path: row.get(0)?,
                file_size_bytes: row.get(1)?,
                start_time: row.get(2)?,
                end_time: row.get(3)?,
                status: row
                    .get::<_, String>(4)?
                    .parse()
                    .unwrap_or(ProgressStatus::Failed),
                records_loaded: row.get(5)?,
                error_message: row.get(6)?,
            })
        },
    )?;
    Ok(record)
}

fn abbreviate(error: &str) -> String {
    let first_line = error.lines().next().unwrap_or("");
    if first_line.len() <= MAX_ERROR_LEN {
        first_line.to_string()
    } else {
        let cut = first_line
            .char_indices()
            .take_while(|(i, _)| *i < MAX_ERROR_LEN)
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
        format!("{}…", &first_line[..cut])
    }
}
