//! Outbox store for leave events.
//!
//! Same contract as the driver store, keyed by the five-part leave natural
//! key (company, employee type, employee, leave date, situation). Owns the
//! leave hash-state and cursor tables; never touches the outbox table's
//! schema.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use fls_config::{quoted, safe_identifier};
use fls_schemas::{
    ClaimedLeaveEvent, EventStatus, EventType, LeaveCursor, LeaveKey, NewLeaveEvent, Settlement,
    PAYLOAD_VERSION, SOURCE_SYSTEM,
};

use crate::columns::TableColumns;
use crate::driver_outbox::{project_columns, LEASE_EXPIRED_ERROR};
use crate::params::{push_bind, SqlParam};

const HASH_CHUNK: usize = 300;

#[derive(Debug, Clone)]
struct LeaveColumns {
    company_id: String,
    employee_type: String,
    source_id: String,
    leave_date: String,
    situation: String,
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

    leave_time: Option<String>,
    end_date: Option<String>,
    end_time: Option<String>,
    description: Option<String>,
    situation_description: Option<String>,
    source_system: Option<String>,
    lock_id: Option<String>,
    locked_at: Option<String>,
    next_retry_at: Option<String>,
    last_error: Option<String>,
    http_status: Option<String>,
    response_summary: Option<String>,
    processed_at: Option<String>,
}

impl LeaveColumns {
    fn resolve(tc: &TableColumns) -> Result<Self> {
        let required = tc.require_all(&[
            "NumeroDaEmpresa",
            "TipoDeColaborador",
            "NumeroDeOrigemDoColaborador",
            "DataDoAfastamento",
            "Situacao",
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

        Ok(LeaveColumns {
            company_id: it.next().expect("required"),
            employee_type: it.next().expect("required"),
            source_id: it.next().expect("required"),
            leave_date: it.next().expect("required"),
            situation: it.next().expect("required"),
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

            leave_time: tc.get("HoraDoAfastamento"),
            end_date: tc.get("DataDoTermino"),
            end_time: tc.get("HoraDoTermino"),
            description: tc.get("Descricao"),
            situation_description: tc.get("DescricaoDaSituacao"),
            source_system: tc.get("OrigemSistema"),
            lock_id: tc.get("LockId"),
            locked_at: tc.get("LockEm"),
            next_retry_at: tc.get("ProximaTentativaEm"),
            last_error: tc.get("UltimoErro"),
            http_status: tc.get("HttpStatus"),
            response_summary: tc.get("RespostaResumo"),
            processed_at: tc.get("ProcessadoEm"),
        })
    }
}

pub struct LeaveOutbox {
    pool: PgPool,
    schema: String,
    table: String,
    cols: LeaveColumns,
}

impl LeaveOutbox {
    pub async fn connect(pool: PgPool, schema: &str, table: &str) -> Result<Self> {
        let schema = safe_identifier(schema, "Schema de destino")?;
        let table = safe_identifier(table, "Tabela de afastamentos")?;
        let tc = TableColumns::load(&pool, &schema, &table).await?;
        let cols = LeaveColumns::resolve(&tc)?;
        Ok(LeaveOutbox {
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
        let state = self.aux("AfastamentoSyncEstado");
        let cursor = self.aux("AfastamentoSyncCursor");

        sqlx::query(&format!(
            r#"
            create table if not exists {state} (
                "DatabaseOrigem" text not null,
                "NumeroDaEmpresa" integer not null,
                "TipoDeColaborador" smallint not null,
                "NumeroDeOrigemDoColaborador" integer not null,
                "DataDoAfastamento" date not null,
                "Situacao" integer not null,
                "HashPayload" bytea not null,
                "AtualizadoEm" timestamptz not null default now(),
                constraint "PK_AfastamentoSyncEstado" primary key (
                    "DatabaseOrigem",
                    "NumeroDaEmpresa",
                    "TipoDeColaborador",
                    "NumeroDeOrigemDoColaborador",
                    "DataDoAfastamento",
                    "Situacao"
                )
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .context("create AfastamentoSyncEstado failed")?;

        sqlx::query(&format!(
            r#"
            create table if not exists {cursor} (
                "DatabaseOrigem" text not null,
                "NumEmp" integer not null,
                "TipCol" smallint not null,
                "NumCad" integer not null,
                "DataFa" timestamp not null,
                "HoraFa" integer not null,
                "SeqReg" bigint not null,
                "AtualizadoEm" timestamptz not null default now(),
                constraint "PK_AfastamentoSyncCursor" primary key ("DatabaseOrigem")
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .context("create AfastamentoSyncCursor failed")?;

        Ok(())
    }

    pub async fn reset_sync_state(&self, source_db: &str) -> Result<()> {
        for table in ["AfastamentoSyncEstado", "AfastamentoSyncCursor"] {
            let aux = self.aux(table);
            sqlx::query(&format!(
                r#"delete from {aux} where "DatabaseOrigem" = $1"#
            ))
            .bind(source_db)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn load_cursor(&self, source_db: &str) -> Result<LeaveCursor> {
        let cursor = self.aux("AfastamentoSyncCursor");
        let row = sqlx::query(&format!(
            r#"
            select "NumEmp", "TipCol", "NumCad", "DataFa", "HoraFa", "SeqReg"
            from {cursor}
            where "DatabaseOrigem" = $1
            "#
        ))
        .bind(source_db)
        .fetch_optional(&self.pool)
        .await
        .context("load_cursor failed")?;

        match row {
            Some(row) => Ok(LeaveCursor {
                company_id: row.try_get("NumEmp")?,
                employee_type: row.try_get("TipCol")?,
                employee_id: row.try_get("NumCad")?,
                leave_date: row.try_get("DataFa")?,
                leave_time: row.try_get("HoraFa")?,
                seq: row.try_get("SeqReg")?,
            }),
            None => Ok(LeaveCursor::initial()),
        }
    }

    pub async fn save_cursor(&self, source_db: &str, cursor: &LeaveCursor) -> Result<()> {
        let aux = self.aux("AfastamentoSyncCursor");
        sqlx::query(&format!(
            r#"
            insert into {aux}
                ("DatabaseOrigem", "NumEmp", "TipCol", "NumCad", "DataFa", "HoraFa", "SeqReg")
            values ($1, $2, $3, $4, $5, $6, $7)
            on conflict ("DatabaseOrigem") do update
                set "NumEmp" = excluded."NumEmp",
                    "TipCol" = excluded."TipCol",
                    "NumCad" = excluded."NumCad",
                    "DataFa" = excluded."DataFa",
                    "HoraFa" = excluded."HoraFa",
                    "SeqReg" = excluded."SeqReg",
                    "AtualizadoEm" = now()
            "#
        ))
        .bind(source_db)
        .bind(cursor.company_id)
        .bind(cursor.employee_type)
        .bind(cursor.employee_id)
        .bind(cursor.leave_date)
        .bind(cursor.leave_time)
        .bind(cursor.seq)
        .execute(&self.pool)
        .await
        .context("save_cursor failed")?;
        Ok(())
    }

    /// Last-seen hashes for a set of leave keys. Five-part keys cannot go
    /// through an array bind, so the lookup is a chunked OR-list.
    pub async fn load_hashes(
        &self,
        source_db: &str,
        keys: &[LeaveKey],
    ) -> Result<HashMap<LeaveKey, Vec<u8>>> {
        let state = self.aux("AfastamentoSyncEstado");
        let mut unique: Vec<LeaveKey> = keys.to_vec();
        unique.sort_by_key(|k| (k.company_id, k.employee_type, k.employee_id, k.leave_date, k.situation));
        unique.dedup();

        let mut out = HashMap::new();
        for chunk in unique.chunks(HASH_CHUNK) {
            let mut conditions = Vec::with_capacity(chunk.len());
            let mut params: Vec<SqlParam> = vec![SqlParam::Text(Some(source_db.to_string()))];
            for key in chunk {
                let base = params.len();
                conditions.push(format!(
                    "(\"NumeroDaEmpresa\" = ${} and \"TipoDeColaborador\" = ${} \
                     and \"NumeroDeOrigemDoColaborador\" = ${} and \"DataDoAfastamento\" = ${} \
                     and \"Situacao\" = ${})",
                    base + 1,
                    base + 2,
                    base + 3,
                    base + 4,
                    base + 5
                ));
                params.push(SqlParam::Int(Some(key.company_id)));
                params.push(SqlParam::SmallInt(Some(key.employee_type)));
                params.push(SqlParam::Int(Some(key.employee_id)));
                params.push(SqlParam::Date(Some(key.leave_date)));
                params.push(SqlParam::Int(Some(key.situation)));
            }

            let sql = format!(
                r#"
                select "NumeroDaEmpresa", "TipoDeColaborador",
                       "NumeroDeOrigemDoColaborador", "DataDoAfastamento",
                       "Situacao", "HashPayload"
                from {state}
                where "DatabaseOrigem" = $1 and ({})
                "#,
                conditions.join(" or ")
            );

            let mut q = sqlx::query(&sql);
            for p in params {
                q = push_bind(q, p);
            }
            let rows = q.fetch_all(&self.pool).await.context("load_hashes failed")?;

            for row in rows {
                let key = LeaveKey {
                    company_id: row.try_get("NumeroDaEmpresa")?,
                    employee_type: row.try_get("TipoDeColaborador")?,
                    employee_id: row.try_get("NumeroDeOrigemDoColaborador")?,
                    leave_date: row.try_get("DataDoAfastamento")?,
                    situation: row.try_get("Situacao")?,
                };
                out.insert(key, row.try_get("HashPayload")?);
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Event insertion (sync side)
    // -----------------------------------------------------------------

    /// Guarded event insert + hash upsert in one transaction.
    pub async fn record_events(&self, source_db: &str, events: &[NewLeaveEvent]) -> Result<u64> {
        if events.is_empty() {
            return Ok(0);
        }

        let state = self.aux("AfastamentoSyncEstado");
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
                Err(e) => return Err(e).context("insert leave event failed"),
            }
        }

        for ev in events {
            sqlx::query(&format!(
                r#"
                insert into {state}
                    ("DatabaseOrigem", "NumeroDaEmpresa", "TipoDeColaborador",
                     "NumeroDeOrigemDoColaborador", "DataDoAfastamento", "Situacao",
                     "HashPayload")
                values ($1, $2, $3, $4, $5, $6, $7)
                on conflict ("DatabaseOrigem", "NumeroDaEmpresa", "TipoDeColaborador",
                             "NumeroDeOrigemDoColaborador", "DataDoAfastamento", "Situacao")
                do update set "HashPayload" = excluded."HashPayload",
                              "AtualizadoEm" = now()
                "#
            ))
            .bind(source_db)
            .bind(ev.key.company_id)
            .bind(ev.key.employee_type)
            .bind(ev.key.employee_id)
            .bind(ev.key.leave_date)
            .bind(ev.key.situation)
            .bind(&ev.payload_hash)
            .execute(&mut *tx)
            .await
            .context("upsert leave hash failed")?;
        }

        tx.commit().await.context("commit record_events")?;
        Ok(inserted)
    }

    fn insert_event_sql(&self, ev: &NewLeaveEvent) -> (String, Vec<SqlParam>) {
        let c = &self.cols;
        let mut columns: Vec<String> = Vec::new();
        let mut params: Vec<SqlParam> = Vec::new();

        let push = |col: &str, p: SqlParam, columns: &mut Vec<String>, params: &mut Vec<SqlParam>| {
            columns.push(quoted(col));
            params.push(p);
        };

        push(&c.company_id, SqlParam::Int(Some(ev.key.company_id)), &mut columns, &mut params);
        push(
            &c.employee_type,
            SqlParam::SmallInt(Some(ev.key.employee_type)),
            &mut columns,
            &mut params,
        );
        push(&c.source_id, SqlParam::Int(Some(ev.key.employee_id)), &mut columns, &mut params);
        push(&c.leave_date, SqlParam::Date(Some(ev.key.leave_date)), &mut columns, &mut params);
        push(&c.situation, SqlParam::Int(Some(ev.key.situation)), &mut columns, &mut params);
        push(
            &c.operation,
            SqlParam::Text(Some(ev.operation.as_str().to_string())),
            &mut columns,
            &mut params,
        );
        push(
            &c.event_type,
            SqlParam::Text(Some(EventType::LeaveUpsert.as_str().to_string())),
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

        if let Some(col) = &c.leave_time {
            push(col, SqlParam::Int(ev.leave_time), &mut columns, &mut params);
        }
        if let Some(col) = &c.end_date {
            push(col, SqlParam::Date(ev.end_date), &mut columns, &mut params);
        }
        if let Some(col) = &c.end_time {
            push(col, SqlParam::Int(ev.end_time), &mut columns, &mut params);
        }
        if let Some(col) = &c.description {
            push(
                col,
                SqlParam::Text(Some(ev.description.clone())),
                &mut columns,
                &mut params,
            );
        }
        if let Some(col) = &c.situation_description {
            push(
                col,
                SqlParam::Text(ev.situation_description.clone()),
                &mut columns,
                &mut params,
            );
        }
        if let Some(col) = &c.source_system {
            push(
                col,
                SqlParam::Text(Some(SOURCE_SYSTEM.to_string())),
                &mut columns,
                &mut params,
            );
        }

        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${i}")).collect();
        let table = self.qualified();

        let guard_cols = [
            &c.company_id,
            &c.employee_type,
            &c.source_id,
            &c.leave_date,
            &c.situation,
            &c.event_type,
            &c.payload_version,
            &c.payload_hash,
        ];
        let guard_params = vec![
            SqlParam::Int(Some(ev.key.company_id)),
            SqlParam::SmallInt(Some(ev.key.employee_type)),
            SqlParam::Int(Some(ev.key.employee_id)),
            SqlParam::Date(Some(ev.key.leave_date)),
            SqlParam::Int(Some(ev.key.situation)),
            SqlParam::Text(Some(EventType::LeaveUpsert.as_str().to_string())),
            SqlParam::Text(Some(PAYLOAD_VERSION.to_string())),
            SqlParam::Bytes(Some(ev.payload_hash.clone())),
        ];
        let mut guard: Vec<String> = guard_cols
            .iter()
            .enumerate()
            .map(|(i, col)| format!("t.{} = ${}", quoted(col), params.len() + i + 1))
            .collect();
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

    pub async fn claim_batch(
        &self,
        lock_id: &str,
        batch_size: i64,
        max_attempts: i32,
        lock_timeout_minutes: i64,
    ) -> Result<Vec<ClaimedLeaveEvent>> {
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
        for key_col in [
            &c.company_id,
            &c.employee_type,
            &c.source_id,
            &c.leave_date,
            &c.situation,
        ] {
            order.push(format!("t.{} asc", quoted(key_col)));
        }

        let sets = vec![
            format!("{} = '{}'", quoted(&c.status), EventStatus::Processing.as_str()),
            format!("{} = $4", quoted(lock_col)),
            format!("{} = now()", quoted(locked_col)),
            format!("{} = now()", quoted(&c.updated_at)),
        ];

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
                t.{company_id} as company_id,
                t.{employee_type} as employee_type,
                t.{source_id} as employee_id,
                t.{leave_date} as leave_date,
                t.{situation} as situation,
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
            company_id = quoted(&c.company_id),
            employee_type = quoted(&c.employee_type),
            source_id = quoted(&c.source_id),
            leave_date = quoted(&c.leave_date),
            situation = quoted(&c.situation),
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
            .context("claim_batch (leaves) failed")?;

        rows.iter()
            .map(|row| {
                Ok(ClaimedLeaveEvent {
                    key: LeaveKey {
                        company_id: row.try_get("company_id")?,
                        employee_type: row.try_get("employee_type")?,
                        employee_id: row.try_get("employee_id")?,
                        leave_date: row.try_get("leave_date")?,
                        situation: row.try_get("situation")?,
                    },
                    event_type: row.try_get("event_type")?,
                    payload_version: row.try_get("payload_version")?,
                    payload_hash: row.try_get("payload_hash")?,
                    payload_json: row.try_get("payload_json")?,
                    attempts: row.try_get("attempts")?,
                })
            })
            .collect()
    }

    pub async fn settle(
        &self,
        ev: &ClaimedLeaveEvent,
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
            format!("{col} = coalesce({col}, 0) + 1", col = quoted(&c.attempts)),
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
        let add_where = |expr: &str, p: SqlParam, wheres: &mut Vec<String>, params: &mut Vec<SqlParam>| {
            params.push(p);
            wheres.push(format!("t.{} = ${}", quoted(expr), params.len()));
        };
        add_where(lock_col, SqlParam::Text(Some(lock_id.to_string())), &mut wheres, &mut params);
        add_where(&c.company_id, SqlParam::Int(Some(ev.key.company_id)), &mut wheres, &mut params);
        add_where(
            &c.employee_type,
            SqlParam::SmallInt(Some(ev.key.employee_type)),
            &mut wheres,
            &mut params,
        );
        add_where(&c.source_id, SqlParam::Int(Some(ev.key.employee_id)), &mut wheres, &mut params);
        add_where(&c.leave_date, SqlParam::Date(Some(ev.key.leave_date)), &mut wheres, &mut params);
        add_where(&c.situation, SqlParam::Int(Some(ev.key.situation)), &mut wheres, &mut params);
        add_where(&c.event_type, SqlParam::Text(Some(ev.event_type.clone())), &mut wheres, &mut params);
        add_where(
            &c.payload_version,
            SqlParam::Text(Some(ev.payload_version.clone())),
            &mut wheres,
            &mut params,
        );
        add_where(
            &c.payload_hash,
            SqlParam::Bytes(Some(ev.payload_hash.clone())),
            &mut wheres,
            &mut params,
        );

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
            .context("settle (leaves) failed")?;
        Ok(done.rows_affected() > 0)
    }

    /// Mirror-row columns for the field-mapper `colunas.*` namespace.
    pub async fn fetch_mirror_columns(
        &self,
        ev: &ClaimedLeaveEvent,
        requested: &[String],
    ) -> Result<serde_json::Map<String, Value>> {
        if requested.is_empty() {
            return Ok(serde_json::Map::new());
        }
        let c = &self.cols;

        let sql = format!(
            "select to_jsonb(t) as data from {table} as t \
             where t.{company} = $1 and t.{etype} = $2 and t.{sid} = $3 \
               and t.{ldate} = $4 and t.{sit} = $5 \
               and t.{event_type} = $6 and t.{version} = $7 and t.{hash} = $8 \
             limit 1",
            table = self.qualified(),
            company = quoted(&c.company_id),
            etype = quoted(&c.employee_type),
            sid = quoted(&c.source_id),
            ldate = quoted(&c.leave_date),
            sit = quoted(&c.situation),
            event_type = quoted(&c.event_type),
            version = quoted(&c.payload_version),
            hash = quoted(&c.payload_hash),
        );

        let row = sqlx::query(&sql)
            .bind(ev.key.company_id)
            .bind(ev.key.employee_type)
            .bind(ev.key.employee_id)
            .bind(ev.key.leave_date)
            .bind(ev.key.situation)
            .bind(&ev.event_type)
            .bind(&ev.payload_version)
            .bind(&ev.payload_hash)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_mirror_columns (leaves) failed")?;

        let data: Value = match row {
            Some(row) => row.try_get("data")?,
            None => Value::Null,
        };
        Ok(project_columns(&data, requested))
    }
}
