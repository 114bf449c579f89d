//! Leave sync engine: cursor-paged reads from the HR leave table, hash-based
//! change detection, guarded event inserts.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tokio::sync::watch;

use fls_db::{LeaveOutbox, LeaveSourceReader};
use fls_payload::{build_leave_payload, canonical_with_fingerprint, leave_event_description};
use fls_schemas::{
    LeaveCursor, LeaveCycleReport, LeaveKey, LeaveSourceRow, NewLeaveEvent, Operation,
};

/// Provenance recorded on every leave event.
const LEAVE_SOURCE_TABLE: &str = "R038AFA";

pub struct LeaveSyncEngine {
    source: LeaveSourceReader,
    outbox: LeaveOutbox,
    source_db: String,
    batch_size: i64,
    start_date: NaiveDate,
}

impl LeaveSyncEngine {
    pub fn new(
        source: LeaveSourceReader,
        outbox: LeaveOutbox,
        source_db: &str,
        batch_size: i64,
        start_date: NaiveDate,
    ) -> Self {
        LeaveSyncEngine {
            source,
            outbox,
            source_db: source_db.trim().to_string(),
            batch_size: batch_size.max(1),
            start_date,
        }
    }

    /// Drops hash state and cursor so the next cycle rescans from the
    /// beginning of the stream.
    pub async fn reset_sync_state(&self) -> Result<()> {
        self.outbox.ensure_aux_tables().await?;
        self.outbox.reset_sync_state(&self.source_db).await
    }

    pub async fn run_cycle(&self) -> Result<LeaveCycleReport> {
        let mut report = LeaveCycleReport::default();

        self.outbox.ensure_aux_tables().await?;
        let cursor = self.outbox.load_cursor(&self.source_db).await?;

        let rows = self
            .source
            .fetch_rows_by_cursor(self.batch_size, &cursor, self.start_date)
            .await?;

        if rows.is_empty() {
            // End of stream: drop back to the sentinel so the next cycle
            // rescans. Hashes keep unchanged rows from re-emitting.
            if !cursor.is_initial() {
                self.outbox
                    .save_cursor(&self.source_db, &LeaveCursor::initial())
                    .await?;
                report.cursor_reset = true;
            }
            return Ok(report);
        }

        report.source_rows = rows.len();

        let mut payloads = HashMap::new();
        for row in &rows {
            if let Some(payload) = build_leave_payload(row) {
                payloads.insert(key_of(row), payload);
            }
        }
        report.valid_payloads = payloads.len();

        let keys: Vec<LeaveKey> = payloads.keys().copied().collect();
        let prior_hashes = self.outbox.load_hashes(&self.source_db, &keys).await?;

        let mut events: Vec<NewLeaveEvent> = Vec::new();
        for row in &rows {
            let key = key_of(row);
            let Some(payload) = payloads.get(&key) else {
                continue;
            };

            let (payload_json, payload_hash) =
                canonical_with_fingerprint(payload).context("canonicalize leave payload")?;
            let prior = prior_hashes.get(&key);
            if prior == Some(&payload_hash) {
                continue;
            }

            let operation = if prior.is_none() {
                Operation::Insert
            } else {
                Operation::Update
            };

            events.push(NewLeaveEvent {
                key,
                leave_time: row.leave_time,
                end_date: row.end_date,
                end_time: row.end_time,
                description: leave_event_description(row),
                situation_description: payload.descricaodasituacao.clone(),
                operation,
                payload_hash,
                payload_json,
                source_table: LEAVE_SOURCE_TABLE.to_string(),
            });
        }

        report.events_generated = events.len();
        report.events_inserted = self.outbox.record_events(&self.source_db, &events).await?;

        let last = rows.last().expect("rows non-empty");
        self.outbox
            .save_cursor(
                &self.source_db,
                &LeaveCursor {
                    company_id: last.company_id,
                    employee_type: last.employee_type,
                    employee_id: last.employee_id,
                    leave_date: last.leave_date,
                    leave_time: last.leave_time.unwrap_or(0),
                    seq: last.seq.unwrap_or(0),
                },
            )
            .await?;

        Ok(report)
    }

    /// Periodic loop. A failed cycle is logged and retried on the next
    /// tick; the shutdown signal also interrupts the in-between sleep.
    pub async fn run_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = std::time::Instant::now();
            match self.run_cycle().await {
                Ok(report) => tracing::info!(
                    source_db = %self.source_db,
                    rows = report.source_rows,
                    payloads = report.valid_payloads,
                    events = report.events_generated,
                    inserted = report.events_inserted,
                    cursor_reset = report.cursor_reset,
                    "leave sync cycle"
                ),
                Err(e) => tracing::error!(
                    source_db = %self.source_db,
                    error = %format!("{e:#}"),
                    "leave sync cycle failed"
                ),
            }

            let sleep_for = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!(source_db = %self.source_db, "leave sync loop stopped");
    }
}

fn key_of(row: &LeaveSourceRow) -> LeaveKey {
    LeaveKey {
        company_id: row.company_id,
        employee_type: row.employee_type,
        employee_id: row.employee_id,
        leave_date: row.leave_date.date(),
        situation: row.situation,
    }
}
