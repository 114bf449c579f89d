//! Outbox store for driver events.
//!
//! The outbox table itself (`MotoristaCadastro` by default) belongs to the
//! installation and is never created or migrated here; its columns are
//! resolved reflectively at construction. The auxiliary hash-state and
//! checkpoint tables are owned by this store and created on demand.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use fls_config::{quoted, safe_identifier};
use fls_schemas::{
    ClaimedDriverEvent, DriverCheckpoint, DriverMirror, EventStatus, EventType, NewDriverEvent,
    Settlement, PAYLOAD_VERSION, SOURCE_SYSTEM,
};

use crate::columns::TableColumns;
use crate::params::{push_bind, SqlParam};
use crate::source::SourceTable;

const HASH_CHUNK: usize = 300;

pub const LEASE_EXPIRED_ERROR: &str =
    "Lease expirado durante o processamento. Evento reenfileirado automaticamente.";

/// Optional denormalized columns written next to the payload when the
/// installation's table carries them.
const MIRROR_COLUMNS: &[&str] = &[
    "Cpf",
    "Matricula",
    "Nome",
    "CentroDeCusto",
    "TipoDeColaborador",
    "Situacao",
    "NomeDoMotorista",
    "NumeroDoCPF",
    "DataDoNascimento",
    "Sexo",
    "EstadoDeResidencia",
    "PaisDoCadastro",
    "Naturalidade",
    "Pais",
    "OrgaoExpedidorDoRG",
    "DataDeEmissaoDaCNH",
    "DataDeVencimentoDaCNH",
    "NumeroDoRG",
    "NumeroDaCNH",
    "CategoriaDaCNH",
    "NumeroDoRegistroDaCNH",
    "EstadoCivil",
    "NomeDaMae",
    "Cidade",
    "Logradouro",
    "Bairro",
    "NumeroDaResidencia",
    "DDD",
    "NumeroDeTelefone",
];

#[derive(Debug, Clone)]
struct DriverColumns {
    source_id: String,
    operation: String,
    event_type: String,
    payload_version: String,
    payload_hash: String,
    payload_json: String,
    status: String,
    attempts: String,
    source_table: String,
    created_at: String,
    updated_at: String,

    company_id: Option<String>,
    source_system: Option<String>,
    lock_id: Option<String>,
    locked_at: Option<String>,
    next_retry_at: Option<String>,
    last_error: Option<String>,
    http_status: Option<String>,
    response_summary: Option<String>,
    processed_at: Option<String>,
    mirrors: Vec<String>,
}

impl DriverColumns {
    fn resolve(tc: &TableColumns) -> Result<Self> {
        let required = tc.require_all(&[
            "IdDeOrigem",
            "Operacao",
            "EventoTipo",
            "VersaoPayload",
            "HashPayload",
            "PayloadJson",
            "Status",
            "Tentativas",
            "OrigemTabela",
            "CriadoEm",
            "AtualizadoEm",
        ])?;
        let mut it = required.into_iter();

        Ok(DriverColumns {
            source_id: it.next().expect("required"),
            operation: it.next().expect("required"),
            event_type: it.next().expect("required"),
            payload_version: it.next().expect("required"),
            payload_hash: it.next().expect("required"),
            payload_json: it.next().expect("required"),
            status: it.next().expect("required"),
            attempts: it.next().expect("required"),
            source_table: it.next().expect("required"),
            created_at: it.next().expect("required"),
            updated_at: it.next().expect("required"),

            company_id: tc.get("NumEmp"),
            source_system: tc.get("OrigemSistema"),
            lock_id: tc.get("LockId"),
            locked_at: tc.get("LockEm"),
            next_retry_at: tc.get("ProximaTentativaEm"),
            last_error: tc.get("UltimoErro"),
            http_status: tc.get("HttpStatus"),
            response_summary: tc.get("RespostaResumo"),
            processed_at: tc.get("ProcessadoEm"),
            mirrors: MIRROR_COLUMNS.iter().filter_map(|m| tc.get(m)).collect(),
        })
    }
}

pub struct DriverOutbox {
    pool: PgPool,
    schema: String,
    table: String,
    cols: DriverColumns,
}

impl DriverOutbox {
    pub async fn connect(pool: PgPool, schema: &str, table: &str) -> Result<Self> {
        let schema = safe_identifier(schema, "Schema de destino")?;
        let table = safe_identifier(table, "Tabela de motoristas")?;
        let tc = TableColumns::load(&pool, &schema, &table).await?;
        let cols = DriverColumns::resolve(&tc)?;
        Ok(DriverOutbox {
            pool,
            schema,
            table,
            cols,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn qualified(&self) -> String {
        format!("{}.{}", quoted(&self.schema), quoted(&self.table))
    }

    fn aux(&self, name: &str) -> String {
        format!("{}.{}", quoted(&self.schema), quoted(name))
    }

    /// Dispatch needs the lease columns; sync does not. Called by the
    /// dispatch engine at construction so a table without them fails fast.
    pub fn validate_dispatch_columns(&self) -> Result<()> {
        for (col, logical) in [(&self.cols.lock_id, "LockId"), (&self.cols.locked_at, "LockEm")] {
            if col.is_none() {
                anyhow::bail!(
                    "tabela {:?}.{:?} sem coluna {logical}; dispatch requer colunas de lease",
                    self.schema,
                    self.table
                );
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Auxiliary state tables
    // -----------------------------------------------------------------

    pub async fn ensure_aux_tables(&self) -> Result<()> {
        let state = self.aux("MotoristaSyncEstado");
        let checkpoint = self.aux("MotoristaSyncCheckpoint");

        sqlx::query(&format!(
            r#"
            create table if not exists {state} (
                "DatabaseOrigem" text not null,
                "IdDeOrigem" integer not null,
                "HashPayload" bytea not null,
                "AtualizadoEm" timestamptz not null default now(),
                constraint "PK_MotoristaSyncEstado"
                    primary key ("DatabaseOrigem", "IdDeOrigem")
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .context("create MotoristaSyncEstado failed")?;

        sqlx::query(&format!(
            r#"
            create table if not exists {checkpoint} (
                "DatabaseOrigem" text not null,
                "TabelaOrigem" text not null,
                "UltimaAlteracao" timestamp not null,
                "UltimoNumCad" integer not null,
                "AtualizadoEm" timestamptz not null default now(),
                constraint "PK_MotoristaSyncCheckpoint"
                    primary key ("DatabaseOrigem", "TabelaOrigem")
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .context("create MotoristaSyncCheckpoint failed")?;

        Ok(())
    }

    /// Clears hash state and checkpoints for one source database, forcing a
    /// full re-scan on the next cycles.
    pub async fn reset_sync_state(&self, source_db: &str) -> Result<()> {
        let state = self.aux("MotoristaSyncEstado");
        let checkpoint = self.aux("MotoristaSyncCheckpoint");

        sqlx::query(&format!(
            r#"delete from {state} where "DatabaseOrigem" = $1"#
        ))
        .bind(source_db)
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            r#"delete from {checkpoint} where "DatabaseOrigem" = $1"#
        ))
        .bind(source_db)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_checkpoint(
        &self,
        source_db: &str,
        table: SourceTable,
    ) -> Result<DriverCheckpoint> {
        let checkpoint = self.aux("MotoristaSyncCheckpoint");
        let row = sqlx::query(&format!(
            r#"
            select "UltimaAlteracao", "UltimoNumCad"
            from {checkpoint}
            where "DatabaseOrigem" = $1 and "TabelaOrigem" = $2
            "#
        ))
        .bind(source_db)
        .bind(table.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("load_checkpoint failed")?;

        match row {
            Some(row) => Ok(DriverCheckpoint {
                last_change: row.try_get("UltimaAlteracao")?,
                last_id: row.try_get("UltimoNumCad")?,
            }),
            None => Ok(DriverCheckpoint::initial()),
        }
    }

    pub async fn save_checkpoint(
        &self,
        source_db: &str,
        table: SourceTable,
        cp: &DriverCheckpoint,
    ) -> Result<()> {
        let checkpoint = self.aux("MotoristaSyncCheckpoint");
        sqlx::query(&format!(
            r#"
            insert into {checkpoint}
                ("DatabaseOrigem", "TabelaOrigem", "UltimaAlteracao", "UltimoNumCad")
            values ($1, $2, $3, $4)
            on conflict ("DatabaseOrigem", "TabelaOrigem") do update
                set "UltimaAlteracao" = excluded."UltimaAlteracao",
                    "UltimoNumCad" = excluded."UltimoNumCad",
                    "AtualizadoEm" = now()
            "#
        ))
        .bind(source_db)
        .bind(table.as_str())
        .bind(cp.last_change)
        .bind(cp.last_id)
        .execute(&self.pool)
        .await
        .context("save_checkpoint failed")?;
        Ok(())
    }

    /// Last-seen payload hashes for a set of driver ids, chunked to bound
    /// statement size.
    pub async fn load_hashes(
        &self,
        source_db: &str,
        ids: &[i32],
    ) -> Result<HashMap<i32, Vec<u8>>> {
        let state = self.aux("MotoristaSyncEstado");
        let mut out = HashMap::new();

        for chunk in ids.chunks(HASH_CHUNK) {
            let rows = sqlx::query(&format!(
                r#"
                select "IdDeOrigem", "HashPayload"
                from {state}
                where "DatabaseOrigem" = $1 and "IdDeOrigem" = any($2)
                "#
            ))
            .bind(source_db)
            .bind(chunk)
            .fetch_all(&self.pool)
            .await
            .context("load_hashes failed")?;

            for row in rows {
                out.insert(row.try_get("IdDeOrigem")?, row.try_get("HashPayload")?);
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Event insertion (sync side)
    // -----------------------------------------------------------------

    /// Inserts the generated events and upserts their hashes in a single
    /// transaction. Returns how many events were actually inserted; rows
    /// already queued with the same key + hash (guard or unique-violation
    /// race) are skipped silently.
    pub async fn record_events(&self, source_db: &str, events: &[NewDriverEvent]) -> Result<u64> {
        if events.is_empty() {
            return Ok(0);
        }

        let state = self.aux("MotoristaSyncEstado");
        let mut tx = self.pool.begin().await.context("begin record_events")?;
        let mut inserted = 0u64;

        for ev in events {
            let (sql, params) = self.insert_event_sql(ev);
            let mut q = sqlx::query(&sql);
            for p in params {
                q = push_bind(q, p);
            }
            match q.execute(&mut *tx).await {
                Ok(done) => inserted += done.rows_affected(),
                Err(e) if crate::is_unique_violation(&e) => continue,
                Err(e) => return Err(e).context("insert driver event failed"),
            }
        }

        for ev in events {
            sqlx::query(&format!(
                r#"
                insert into {state} ("DatabaseOrigem", "IdDeOrigem", "HashPayload")
                values ($1, $2, $3)
                on conflict ("DatabaseOrigem", "IdDeOrigem") do update
                    set "HashPayload" = excluded."HashPayload",
                        "AtualizadoEm" = now()
                "#
            ))
            .bind(source_db)
            .bind(ev.source_id)
            .bind(&ev.payload_hash)
            .execute(&mut *tx)
            .await
            .context("upsert driver hash failed")?;
        }

        tx.commit().await.context("commit record_events")?;
        Ok(inserted)
    }

    fn insert_event_sql(&self, ev: &NewDriverEvent) -> (String, Vec<SqlParam>) {
        let c = &self.cols;
        let mut columns: Vec<String> = Vec::new();
        let mut params: Vec<SqlParam> = Vec::new();

        let push = |col: &str, p: SqlParam, columns: &mut Vec<String>, params: &mut Vec<SqlParam>| {
            columns.push(quoted(col));
            params.push(p);
        };

        push(&c.source_id, SqlParam::Int(Some(ev.source_id)), &mut columns, &mut params);
        push(
            &c.operation,
            SqlParam::Text(Some(ev.operation.as_str().to_string())),
            &mut columns,
            &mut params,
        );
        push(
            &c.event_type,
            SqlParam::Text(Some(EventType::DriverUpsert.as_str().to_string())),
            &mut columns,
            &mut params,
        );
        push(
            &c.payload_version,
            SqlParam::Text(Some(PAYLOAD_VERSION.to_string())),
            &mut columns,
            &mut params,
        );
        push(
            &c.payload_hash,
            SqlParam::Bytes(Some(ev.payload_hash.clone())),
            &mut columns,
            &mut params,
        );
        push(
            &c.payload_json,
            SqlParam::Text(Some(ev.payload_json.clone())),
            &mut columns,
            &mut params,
        );
        push(
            &c.status,
            SqlParam::Text(Some(EventStatus::Pending.as_str().to_string())),
            &mut columns,
            &mut params,
        );
        push(&c.attempts, SqlParam::Int(Some(0)), &mut columns, &mut params);
        push(
            &c.source_table,
            SqlParam::Text(Some(ev.source_table.clone())),
            &mut columns,
            &mut params,
        );

        if let Some(col) = &c.company_id {
            push(col, SqlParam::Int(ev.company_id), &mut columns, &mut params);
        }
        if let Some(col) = &c.source_system {
            push(
                col,
                SqlParam::Text(Some(SOURCE_SYSTEM.to_string())),
                &mut columns,
                &mut params,
            );
        }
        for col in &c.mirrors {
            push(col, mirror_param(col, &ev.mirror), &mut columns, &mut params);
        }

        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${i}")).collect();
        let table = self.qualified();

        // Insert guard: an identical un-dispatched event must not queue twice.
        let mut guard = vec![
            format!("t.{} = ${}", quoted(&c.source_id), params.len() + 1),
            format!("t.{} = ${}", quoted(&c.event_type), params.len() + 2),
            format!("t.{} = ${}", quoted(&c.payload_version), params.len() + 3),
            format!("t.{} = ${}", quoted(&c.payload_hash), params.len() + 4),
        ];
        let mut guard_params = vec![
            SqlParam::Int(Some(ev.source_id)),
            SqlParam::Text(Some(EventType::DriverUpsert.as_str().to_string())),
            SqlParam::Text(Some(PAYLOAD_VERSION.to_string())),
            SqlParam::Bytes(Some(ev.payload_hash.clone())),
        ];
        if let (Some(col), Some(company_id)) = (&c.company_id, ev.company_id) {
            guard.push(format!(
                "t.{} = ${}",
                quoted(col),
                params.len() + guard_params.len() + 1
            ));
            guard_params.push(SqlParam::Int(Some(company_id)));
        }
        guard.push(format!(
            "t.{} in ('{}', '{}')",
            quoted(&c.status),
            EventStatus::Pending.as_str(),
            EventStatus::Error.as_str()
        ));

        let sql = format!(
            "insert into {table} ({}, {}, {})\n\
             select {}, now(), now()\n\
             where not exists (select 1 from {table} as t where {})",
            columns.join(", "),
            quoted(&c.created_at),
            quoted(&c.updated_at),
            placeholders.join(", "),
            guard.join(" and ")
        );

        params.extend(guard_params);
        (sql, params)
    }

    // -----------------------------------------------------------------
    // Lease claim / settle (dispatch side)
    // -----------------------------------------------------------------

    /// Requeues rows whose lease outlived the timeout. Runs before each
    /// claim so a crashed worker's batch becomes dispatchable again.
    pub async fn sweep_expired_leases(&self, lock_timeout_minutes: i64) -> Result<u64> {
        let c = &self.cols;
        self.validate_dispatch_columns()?;
        let lock_id = c.lock_id.as_deref().expect("validated");
        let locked_at = c.locked_at.as_deref().expect("validated");

        let cutoff = Utc::now() - Duration::minutes(lock_timeout_minutes.max(1));
        let mut sets = vec![
            format!("{} = '{}'", quoted(&c.status), EventStatus::Error.as_str()),
            format!("{} = null", quoted(lock_id)),
            format!("{} = null", quoted(locked_at)),
        ];
        if let Some(col) = &c.last_error {
            sets.push(format!("{} = $2", quoted(col)));
        }
        sets.push(format!("{} = now()", quoted(&c.updated_at)));

        let sql = format!(
            "update {} set {} where {} = '{}' and {} is not null and {} < $1",
            self.qualified(),
            sets.join(", "),
            quoted(&c.status),
            EventStatus::Processing.as_str(),
            quoted(lock_id),
            quoted(locked_at),
        );

        let mut q = sqlx::query(&sql).bind(cutoff);
        if c.last_error.is_some() {
            q = q.bind(LEASE_EXPIRED_ERROR);
        }
        let done = q
            .execute(&self.pool)
            .await
            .context("sweep_expired_leases failed")?;
        Ok(done.rows_affected())
    }

    /// Atomically claims up to `batch_size` dispatchable rows for this lock
    /// id. `FOR UPDATE SKIP LOCKED` keeps concurrent dispatchers disjoint.
    pub async fn claim_batch(
        &self,
        lock_id: &str,
        batch_size: i64,
        max_attempts: i32,
        lock_timeout_minutes: i64,
    ) -> Result<Vec<ClaimedDriverEvent>> {
        let c = &self.cols;
        self.validate_dispatch_columns()?;
        let lock_col = c.lock_id.as_deref().expect("validated");
        let locked_col = c.locked_at.as_deref().expect("validated");

        let cutoff = Utc::now() - Duration::minutes(lock_timeout_minutes.max(1));

        let mut conditions = vec![
            format!(
                "t.{} in ('{}', '{}')",
                quoted(&c.status),
                EventStatus::Pending.as_str(),
                EventStatus::Error.as_str()
            ),
            format!("coalesce(t.{}, 0) < $1", quoted(&c.attempts)),
            format!(
                "(t.{lock} is null or t.{locked} < $2)",
                lock = quoted(lock_col),
                locked = quoted(locked_col)
            ),
        ];
        let mut order = Vec::new();
        if let Some(col) = &c.next_retry_at {
            conditions.push(format!(
                "(t.{col} is null or t.{col} <= now())",
                col = quoted(col)
            ));
            order.push(format!(
                "coalesce(t.{}, t.{}) asc",
                quoted(col),
                quoted(&c.created_at)
            ));
        }
        order.push(format!("t.{} asc", quoted(&c.created_at)));
        order.push(format!("t.{} asc", quoted(&c.source_id)));

        let sets = vec![
            format!("{} = '{}'", quoted(&c.status), EventStatus::Processing.as_str()),
            format!("{} = $4", quoted(lock_col)),
            format!("{} = now()", quoted(locked_col)),
            format!("{} = now()", quoted(&c.updated_at)),
        ];

        let company_select = match &c.company_id {
            Some(col) => format!("t.{} as company_id", quoted(col)),
            None => "null::integer as company_id".to_string(),
        };

        let sql = format!(
            r#"
            with batch as (
                select t.ctid as row_id
                from {table} as t
                where {conditions}
                order by {order}
                limit $3
                for update skip locked
            )
            update {table} as t
            set {sets}
            from batch
            where t.ctid = batch.row_id
            returning
                t.{source_id} as source_id,
                {company_select},
                t.{event_type} as event_type,
                t.{payload_version} as payload_version,
                t.{payload_hash} as payload_hash,
                t.{payload_json} as payload_json,
                coalesce(t.{attempts}, 0) as attempts
            "#,
            table = self.qualified(),
            conditions = conditions.join(" and "),
            order = order.join(", "),
            sets = sets.join(", "),
            source_id = quoted(&c.source_id),
            event_type = quoted(&c.event_type),
            payload_version = quoted(&c.payload_version),
            payload_hash = quoted(&c.payload_hash),
            payload_json = quoted(&c.payload_json),
            attempts = quoted(&c.attempts),
        );

        let rows = sqlx::query(&sql)
            .bind(max_attempts.max(1))
            .bind(cutoff)
            .bind(batch_size.max(1))
            .bind(lock_id)
            .fetch_all(&self.pool)
            .await
            .context("claim_batch (drivers) failed")?;

        rows.iter()
            .map(|row| {
                Ok(ClaimedDriverEvent {
                    source_id: row.try_get("source_id")?,
                    company_id: row.try_get("company_id")?,
                    event_type: row.try_get("event_type")?,
                    payload_version: row.try_get("payload_version")?,
                    payload_hash: row.try_get("payload_hash")?,
                    payload_json: row.try_get("payload_json")?,
                    attempts: row.try_get("attempts")?,
                })
            })
            .collect()
    }

    /// Settles one claimed row. Returns false when the lease was stolen
    /// (another worker's lock id owns the row now).
    pub async fn settle(
        &self,
        ev: &ClaimedDriverEvent,
        lock_id: &str,
        success: bool,
        outcome: &Settlement,
    ) -> Result<bool> {
        let c = &self.cols;
        self.validate_dispatch_columns()?;
        let lock_col = c.lock_id.as_deref().expect("validated");
        let locked_col = c.locked_at.as_deref().expect("validated");

        let status = if success {
            EventStatus::Done
        } else {
            EventStatus::Error
        };

        let mut sets = vec![
            format!("{} = $1", quoted(&c.status)),
            format!(
                "{col} = coalesce({col}, 0) + 1",
                col = quoted(&c.attempts)
            ),
            format!("{} = null", quoted(lock_col)),
            format!("{} = null", quoted(locked_col)),
            format!("{} = now()", quoted(&c.updated_at)),
        ];
        let mut params: Vec<SqlParam> = vec![SqlParam::Text(Some(status.as_str().to_string()))];

        let add_set = |col: &str, p: SqlParam, sets: &mut Vec<String>, params: &mut Vec<SqlParam>| {
            params.push(p);
            sets.push(format!("{} = ${}", quoted(col), params.len()));
        };

        if let Some(col) = &c.http_status {
            add_set(col, SqlParam::Int(outcome.http_status), &mut sets, &mut params);
        }
        if let Some(col) = &c.response_summary {
            add_set(
                col,
                SqlParam::Text(outcome.response_summary.clone()),
                &mut sets,
                &mut params,
            );
        }
        if let Some(col) = &c.last_error {
            add_set(
                col,
                SqlParam::Text(if success { None } else { outcome.last_error.clone() }),
                &mut sets,
                &mut params,
            );
        }
        if let Some(col) = &c.next_retry_at {
            add_set(
                col,
                SqlParam::Timestamp(if success { None } else { outcome.next_retry_at }),
                &mut sets,
                &mut params,
            );
        }
        if let Some(col) = &c.processed_at {
            sets.push(format!(
                "{} = {}",
                quoted(col),
                if success { "now()" } else { "null" }
            ));
        }

        let mut wheres = Vec::new();
        let add_where = |expr: String, p: SqlParam, wheres: &mut Vec<String>, params: &mut Vec<SqlParam>| {
            params.push(p);
            wheres.push(format!("{expr} = ${}", params.len()));
        };
        add_where(
            format!("t.{}", quoted(lock_col)),
            SqlParam::Text(Some(lock_id.to_string())),
            &mut wheres,
            &mut params,
        );
        add_where(
            format!("t.{}", quoted(&c.source_id)),
            SqlParam::Int(Some(ev.source_id)),
            &mut wheres,
            &mut params,
        );
        add_where(
            format!("t.{}", quoted(&c.event_type)),
            SqlParam::Text(Some(ev.event_type.clone())),
            &mut wheres,
            &mut params,
        );
        add_where(
            format!("t.{}", quoted(&c.payload_version)),
            SqlParam::Text(Some(ev.payload_version.clone())),
            &mut wheres,
            &mut params,
        );
        add_where(
            format!("t.{}", quoted(&c.payload_hash)),
            SqlParam::Bytes(Some(ev.payload_hash.clone())),
            &mut wheres,
            &mut params,
        );
        if let (Some(col), Some(company_id)) = (&c.company_id, ev.company_id) {
            add_where(
                format!("t.{}", quoted(col)),
                SqlParam::Int(Some(company_id)),
                &mut wheres,
                &mut params,
            );
        }

        let sql = format!(
            "update {table} as t set {} where {}",
            sets.join(", "),
            wheres.join(" and "),
            table = self.qualified(),
        );

        let mut q = sqlx::query(&sql);
        for p in params {
            q = push_bind(q, p);
        }
        let done = q
            .execute(&self.pool)
            .await
            .context("settle (drivers) failed")?;
        Ok(done.rows_affected() > 0)
    }

    /// Mirror-row columns for the field-mapper `colunas.*` namespace.
    /// Requested names match tolerantly; absent columns come back as null.
    pub async fn fetch_mirror_columns(
        &self,
        ev: &ClaimedDriverEvent,
        requested: &[String],
    ) -> Result<serde_json::Map<String, Value>> {
        if requested.is_empty() {
            return Ok(serde_json::Map::new());
        }
        let c = &self.cols;

        let mut wheres = vec![
            format!("t.{} = $1", quoted(&c.source_id)),
            format!("t.{} = $2", quoted(&c.event_type)),
            format!("t.{} = $3", quoted(&c.payload_version)),
            format!("t.{} = $4", quoted(&c.payload_hash)),
        ];
        if let (Some(col), Some(_)) = (&c.company_id, ev.company_id) {
            wheres.push(format!("t.{} = $5", quoted(col)));
        }

        let sql = format!(
            "select to_jsonb(t) as data from {} as t where {} limit 1",
            self.qualified(),
            wheres.join(" and ")
        );

        let mut q = sqlx::query(&sql)
            .bind(ev.source_id)
            .bind(&ev.event_type)
            .bind(&ev.payload_version)
            .bind(&ev.payload_hash);
        if let (Some(_), Some(company_id)) = (&c.company_id, ev.company_id) {
            q = q.bind(company_id);
        }

        let row = q
            .fetch_optional(&self.pool)
            .await
            .context("fetch_mirror_columns (drivers) failed")?;

        let data: Value = match row {
            Some(row) => row.try_get("data")?,
            None => Value::Null,
        };
        Ok(project_columns(&data, requested))
    }
}

fn mirror_param(physical: &str, m: &DriverMirror) -> SqlParam {
    match fls_config::normalize_key(physical).as_str() {
        "cpf" => SqlParam::Text(m.cpf.clone()),
        "matricula" => SqlParam::Text(m.registration.clone()),
        "nome" => SqlParam::Text(m.name.clone()),
        "centrodecusto" => SqlParam::Text(m.cost_center.clone()),
        "tipodecolaborador" => SqlParam::SmallInt(m.employee_type),
        "situacao" => SqlParam::Int(m.situation),
        "nomedomotorista" => SqlParam::Text(m.name.clone()),
        "numerodocpf" => SqlParam::Text(m.cpf.clone()),
        "datadonascimento" => SqlParam::Date(m.birth_date),
        "sexo" => SqlParam::Text(m.gender.clone()),
        "estadoderesidencia" => SqlParam::Text(m.residence_state.clone()),
        "paisdocadastro" => SqlParam::Text(m.country.clone()),
        "naturalidade" => SqlParam::Int(m.birthplace),
        "pais" => SqlParam::Text(m.country.clone()),
        "orgaoexpedidordorg" => SqlParam::Text(m.rg_issuer.clone()),
        "datadeemissaodacnh" => SqlParam::Date(m.cnh_issue_date),
        "datadevencimentodacnh" => SqlParam::Date(m.cnh_expiry_date),
        "numerodorg" => SqlParam::Text(m.rg_number.clone()),
        "numerodacnh" => SqlParam::Text(m.cnh_number.clone()),
        "categoriadacnh" => SqlParam::Text(m.cnh_category.clone()),
        "numerodoregistrodacnh" => SqlParam::Date(m.cnh_first_license),
        "estadocivil" => SqlParam::Text(m.marital_status.clone()),
        "nomedamae" => SqlParam::Text(m.mother_name.clone()),
        "cidade" => SqlParam::Text(m.city.clone()),
        "logradouro" => SqlParam::Text(m.street.clone()),
        "bairro" => SqlParam::Text(m.district.clone()),
        "numerodaresidencia" => SqlParam::Text(m.house_number.clone()),
        "ddd" => SqlParam::Text(m.phone_area.clone()),
        "numerodetelefone" => SqlParam::Text(m.phone_number.clone()),
        _ => SqlParam::Text(None),
    }
}

/// Picks the requested columns out of a `to_jsonb(t)` row, matching names
/// through the normalized-key rules used everywhere else.
pub(crate) fn project_columns(
    data: &Value,
    requested: &[String],
) -> serde_json::Map<String, Value> {
    let mut out = serde_json::Map::new();
    let Value::Object(row) = data else {
        for name in requested {
            out.insert(name.clone(), Value::Null);
        }
        return out;
    };

    for name in requested {
        let wanted = fls_config::normalize_key(name);
        let found = row
            .iter()
            .find(|(k, _)| fls_config::normalize_key(k) == wanted)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null);
        out.insert(name.clone(), found);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn project_columns_matches_names_tolerantly() {
        let data = json!({"NumEmp": 4, "Cpf": "123", "PayloadJson": "{}"});
        let out = project_columns(&data, &["numemp".into(), "NumeroDoCPF".into()]);
        assert_eq!(out.get("numemp"), Some(&json!(4)));
        assert_eq!(out.get("NumeroDoCPF"), Some(&Value::Null));
    }

    #[test]
    fn project_columns_on_missing_row_yields_nulls() {
        let out = project_columns(&Value::Null, &["Cpf".into()]);
        assert_eq!(out.get("Cpf"), Some(&Value::Null));
    }
}
