//! Driver sync engine: two independently-checkpointed source tables feed one
//! work set of changed ids, unioned, re-read in full and diffed by hash.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use fls_db::source::ChangedId;
use fls_db::{DriverOutbox, DriverSourceReader, SourceTable};
use fls_payload::{build_driver_payload, canonical_with_fingerprint, DriverPayload};
use fls_schemas::{
    DriverCheckpoint, DriverCycleReport, DriverMirror, DriverSourceRow, NewDriverEvent, Operation,
};

#[derive(Debug, Clone, Copy, Default)]
struct ChangeOrigin {
    primary: bool,
    complement: bool,
}

impl ChangeOrigin {
    fn source_table(&self) -> String {
        match (self.primary, self.complement) {
            (true, false) => SourceTable::Primary.as_str().to_string(),
            (false, true) => SourceTable::Complement.as_str().to_string(),
            _ => format!(
                "{}/{}",
                SourceTable::Complement.as_str(),
                SourceTable::Primary.as_str()
            ),
        }
    }
}

pub struct DriverSyncEngine {
    source: DriverSourceReader,
    outbox: DriverOutbox,
    source_db: String,
    batch_size: i64,
}

impl DriverSyncEngine {
    pub fn new(
        source: DriverSourceReader,
        outbox: DriverOutbox,
        source_db: &str,
        batch_size: i64,
    ) -> Self {
        DriverSyncEngine {
            source,
            outbox,
            source_db: source_db.trim().to_string(),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn reset_sync_state(&self) -> Result<()> {
        self.outbox.ensure_aux_tables().await?;
        self.outbox.reset_sync_state(&self.source_db).await
    }

    pub async fn run_cycle(&self) -> Result<DriverCycleReport> {
        let mut report = DriverCycleReport::default();

        self.outbox.ensure_aux_tables().await?;

        let cp_primary = self
            .outbox
            .load_checkpoint(&self.source_db, SourceTable::Primary)
            .await?;
        let cp_complement = self
            .outbox
            .load_checkpoint(&self.source_db, SourceTable::Complement)
            .await?;

        let changed_primary = self
            .source
            .list_changed_ids(SourceTable::Primary, self.batch_size, &cp_primary)
            .await?;
        let changed_complement = self
            .source
            .list_changed_ids(SourceTable::Complement, self.batch_size, &cp_complement)
            .await?;

        report.changed_primary = changed_primary.len();
        report.changed_complement = changed_complement.len();

        let mut origins: BTreeMap<i32, ChangeOrigin> = BTreeMap::new();
        for c in &changed_primary {
            origins.entry(c.id).or_default().primary = true;
        }
        for c in &changed_complement {
            origins.entry(c.id).or_default().complement = true;
        }

        let ids: Vec<i32> = origins.keys().copied().collect();
        report.ids_processed = ids.len();
        if ids.is_empty() {
            self.save_checkpoints(&changed_primary, &changed_complement)
                .await?;
            return Ok(report);
        }

        let rows = self.source.fetch_driver_rows(&ids).await?;
        report.source_rows = rows.len();

        let mut rows_by_id: HashMap<i32, &DriverSourceRow> = HashMap::new();
        let mut payloads: HashMap<i32, DriverPayload> = HashMap::new();
        for row in &rows {
            rows_by_id.insert(row.employee_id, row);
            if let Some(payload) = build_driver_payload(row) {
                payloads.insert(row.employee_id, payload);
            }
        }
        report.valid_payloads = payloads.len();

        let prior_hashes = self.outbox.load_hashes(&self.source_db, &ids).await?;

        let mut events: Vec<NewDriverEvent> = Vec::new();
        for id in &ids {
            let Some(payload) = payloads.get(id) else {
                continue;
            };
            let Some(row) = rows_by_id.get(id) else {
                continue;
            };
            let origin = origins.get(id).copied().unwrap_or_default();

            let (payload_json, payload_hash) =
                canonical_with_fingerprint(payload).context("canonicalize driver payload")?;
            let prior = prior_hashes.get(id);

            // A change in the primary table always emits, even when the
            // payload reverted to its last-sent shape. The downstream API
            // must see the revert.
            if prior == Some(&payload_hash) && !origin.primary {
                continue;
            }

            let operation = if prior.is_none() {
                Operation::Insert
            } else {
                Operation::Update
            };

            events.push(NewDriverEvent {
                source_id: *id,
                company_id: Some(row.company_id),
                operation,
                payload_hash,
                payload_json,
                source_table: origin.source_table(),
                mirror: mirror_of(row, payload),
            });
        }

        report.events_generated = events.len();
        report.events_inserted = self.outbox.record_events(&self.source_db, &events).await?;

        self.save_checkpoints(&changed_primary, &changed_complement)
            .await?;
        Ok(report)
    }

    /// Checkpoints advance to the last row of each page even when nothing
    /// was emitted, so filtered-out changes are not revisited forever.
    async fn save_checkpoints(
        &self,
        changed_primary: &[ChangedId],
        changed_complement: &[ChangedId],
    ) -> Result<()> {
        if let Some(last) = changed_primary.last() {
            self.outbox
                .save_checkpoint(
                    &self.source_db,
                    SourceTable::Primary,
                    &DriverCheckpoint {
                        last_change: last.changed_at,
                        last_id: last.id,
                    },
                )
                .await?;
        }
        if let Some(last) = changed_complement.last() {
            self.outbox
                .save_checkpoint(
                    &self.source_db,
                    SourceTable::Complement,
                    &DriverCheckpoint {
                        last_change: last.changed_at,
                        last_id: last.id,
                    },
                )
                .await?;
        }
        Ok(())
    }

    pub async fn run_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = std::time::Instant::now();
            match self.run_cycle().await {
                Ok(report) => tracing::info!(
                    source_db = %self.source_db,
                    primary = report.changed_primary,
                    complement = report.changed_complement,
                    ids = report.ids_processed,
                    payloads = report.valid_payloads,
                    events = report.events_generated,
                    inserted = report.events_inserted,
                    "driver sync cycle"
                ),
                Err(e) => tracing::error!(
                    source_db = %self.source_db,
                    error = %format!("{e:#}"),
                    "driver sync cycle failed"
                ),
            }

            let sleep_for = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!(source_db = %self.source_db, "driver sync loop stopped");
    }
}

fn mirror_of(row: &DriverSourceRow, payload: &DriverPayload) -> DriverMirror {
    DriverMirror {
        cpf: Some(payload.cpf.clone()),
        registration: Some(payload.matricula.clone()),
        name: Some(payload.nome.clone()),
        cost_center: row.cost_center.clone(),
        employee_type: Some(row.employee_type),
        situation: row.situation,
        birth_date: row.birth_date,
        gender: row.gender_code.clone(),
        residence_state: row.state.clone(),
        country: row.country.clone(),
        birthplace: row.birthplace,
        city: row.city.clone(),
        street: row.street.clone(),
        district: row.district.clone(),
        house_number: row.house_number.clone(),
        phone_area: row.phone_area.clone(),
        phone_number: row.phone_number.clone(),
        rg_number: row.rg_number.clone(),
        rg_issuer: row.rg_issuer.clone(),
        cnh_number: row.cnh_number.clone(),
        cnh_category: row.cnh_category.clone(),
        cnh_issue_date: row.cnh_issue_date,
        cnh_expiry_date: row.cnh_expiry_date,
        cnh_first_license: row.cnh_first_license,
        marital_status: row.marital_status.clone(),
        mother_name: row.mother_name.clone(),
    }
}
