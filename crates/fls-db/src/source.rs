//! Read-only access to the upstream HR schema.
//!
//! Driver data lives in the registration table `R034FUN` and its complement
//! `R034CPL`; leave spells live in `R038AFA`. Change detection pages over a
//! synthesized change timestamp (audit date + HHMM-encoded time column),
//! discovered per table from an ordered candidate list because older
//! installations lack the newer audit columns.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::{PgPool, Row};

use fls_config::{quoted, safe_identifier};
use fls_schemas::{DriverCheckpoint, DriverSourceRow, LeaveCursor, LeaveSourceRow};

/// Job-plan code that marks a registration row as a driver.
const DRIVER_JOB_CODE: i32 = 152292;

/// Situation code of terminated employees, excluded from driver reads.
const TERMINATED_SITUATION: i32 = 7;

/// Audit column candidates, most specific first. The paired time column is
/// an HHMM-encoded integer; `DatAdm` has no time component.
const AUDIT_COLUMN_CANDIDATES: &[(&str, Option<&str>)] = &[
    ("DatAlt", Some("HorAlt")),
    ("DatAtu", Some("HorAtu")),
    ("DatInc", Some("HorInc")),
    ("DatCad", Some("HorCad")),
    ("DatAdm", None),
];

/// Leave situation codes accepted by the pipeline (closed set agreed with
/// the target API).
const ALLOWED_LEAVE_SITUATIONS: &[i32] = &[
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 17, 18, 20, 22, 23, 24, 26, 27, 28, 29, 30,
    37, 77, 78, 209, 506, 507, 510, 511, 512,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTable {
    Primary,
    Complement,
}

impl SourceTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTable::Primary => "R034FUN",
            SourceTable::Complement => "R034CPL",
        }
    }
}

/// One (id, change timestamp) pair from a changed-rows page.
#[derive(Debug, Clone, Copy)]
pub struct ChangedId {
    pub id: i32,
    pub changed_at: NaiveDateTime,
}

// ---------------------------------------------------------------------------
// Driver reads
// ---------------------------------------------------------------------------

pub struct DriverSourceReader {
    pool: PgPool,
    schema: String,
    /// (date column, time column) per source table, resolved at construction.
    /// None for the complement means no audit column exists there and reads
    /// fall back to an id-ordered scan.
    primary_audit: (String, Option<String>),
    complement_audit: Option<(String, Option<String>)>,
}

impl DriverSourceReader {
    /// Resolves audit columns for both source tables up front. A primary
    /// table without any audit column is a fatal configuration problem; the
    /// complement degrades to the id-scan path.
    pub async fn connect(pool: PgPool, schema: &str) -> Result<Self> {
        let schema = safe_identifier(schema, "Schema de origem")?;

        let primary_audit = resolve_audit_columns(&pool, &schema, SourceTable::Primary.as_str())
            .await?
            .with_context(|| {
                format!(
                    "nenhuma coluna de auditoria encontrada em {schema:?}.{:?}",
                    SourceTable::Primary.as_str()
                )
            })?;
        let complement_audit =
            resolve_audit_columns(&pool, &schema, SourceTable::Complement.as_str()).await?;

        Ok(DriverSourceReader {
            pool,
            schema,
            primary_audit,
            complement_audit,
        })
    }

    /// Page of ids changed after the checkpoint, in (change, id) order.
    pub async fn list_changed_ids(
        &self,
        table: SourceTable,
        limit: i64,
        checkpoint: &DriverCheckpoint,
    ) -> Result<Vec<ChangedId>> {
        let audit = match table {
            SourceTable::Primary => &self.primary_audit,
            SourceTable::Complement => match &self.complement_audit {
                Some(a) => a,
                None => return self.scan_active_ids(limit, checkpoint.last_id).await,
            },
        };

        let expr = change_expr("t", &audit.0, audit.1.as_deref());
        let schema = quoted(&self.schema);
        let fun = format!("{schema}.{}", quoted(SourceTable::Primary.as_str()));

        let sql = match table {
            SourceTable::Primary => format!(
                r#"
                with base as (
                    select t."NumCad" as id, {expr} as change_dt
                    from {fun} as t
                    where t."SitAfa" <> {TERMINATED_SITUATION}
                      and t."TipCol" = 1
                      and t."CodCar" = {DRIVER_JOB_CODE}
                )
                select b.id, b.change_dt
                from base as b
                where b.change_dt is not null
                  and (b.change_dt > $1 or (b.change_dt = $1 and b.id > $2))
                order by b.change_dt asc, b.id asc
                limit $3
                "#
            ),
            SourceTable::Complement => {
                let cpl = format!("{schema}.{}", quoted(SourceTable::Complement.as_str()));
                format!(
                    r#"
                    with base as (
                        select t."NumCad" as id, max({expr}) as change_dt
                        from {cpl} as t
                        inner join {fun} as f on f."NumCad" = t."NumCad"
                        where f."SitAfa" <> {TERMINATED_SITUATION}
                          and f."TipCol" = 1
                          and f."CodCar" = {DRIVER_JOB_CODE}
                        group by t."NumCad"
                    )
                    select b.id, b.change_dt
                    from base as b
                    where b.change_dt is not null
                      and (b.change_dt > $1 or (b.change_dt = $1 and b.id > $2))
                    order by b.change_dt asc, b.id asc
                    limit $3
                    "#
                )
            }
        };

        let rows = sqlx::query(&sql)
            .bind(checkpoint.last_change)
            .bind(checkpoint.last_id)
            .bind(limit.max(1))
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("list_changed_ids({}) failed", table.as_str()))?;

        rows.iter()
            .map(|row| {
                Ok(ChangedId {
                    id: row.try_get("id")?,
                    changed_at: row.try_get("change_dt")?,
                })
            })
            .collect()
    }

    /// Fallback when the complement table has no audit column: id-ordered
    /// scan of active drivers, wrapping back to id 0 once exhausted so the
    /// whole population is revisited over time.
    async fn scan_active_ids(&self, limit: i64, last_id: i32) -> Result<Vec<ChangedId>> {
        let schema = quoted(&self.schema);
        let fun = format!("{schema}.{}", quoted(SourceTable::Primary.as_str()));
        let sql = format!(
            r#"
            select f."NumCad" as id, timestamp '1900-01-01 00:00:00' as change_dt
            from {fun} as f
            where f."SitAfa" <> {TERMINATED_SITUATION}
              and f."TipCol" = 1
              and f."CodCar" = {DRIVER_JOB_CODE}
              and f."NumCad" > $1
            order by f."NumCad" asc
            limit $2
            "#
        );

        let page = |after: i32| {
            let sql = sql.clone();
            let pool = self.pool.clone();
            async move {
                let rows = sqlx::query(&sql)
                    .bind(after)
                    .bind(limit.max(1))
                    .fetch_all(&pool)
                    .await
                    .context("scan_active_ids failed")?;
                rows.iter()
                    .map(|row| {
                        Ok(ChangedId {
                            id: row.try_get("id")?,
                            changed_at: row.try_get("change_dt")?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            }
        };

        let first = page(last_id.max(0)).await?;
        if !first.is_empty() || last_id <= 0 {
            return Ok(first);
        }
        page(0).await
    }

    /// Full driver rows for a set of ids: primary registration joined with
    /// the best-populated complement row and the address lookup tables.
    pub async fn fetch_driver_rows(&self, ids: &[i32]) -> Result<Vec<DriverSourceRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<i32> = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let schema = quoted(&self.schema);
        let fun = format!("{schema}.{}", quoted("R034FUN"));
        let cpl = format!("{schema}.{}", quoted("R034CPL"));
        let bai = format!("{schema}.{}", quoted("R074BAI"));
        let cid = format!("{schema}.{}", quoted("R074CID"));
        let pai = format!("{schema}.{}", quoted("R074PAI"));

        // Ranks complement rows of one driver by how many address/license
        // fields they actually carry; rank 1 wins.
        let score = r#"(case when g."CodBai" is not null then 1 else 0 end
                + case when g."CodCid" is not null then 1 else 0 end
                + case when g."CodPai" is not null then 1 else 0 end
                + case when g."EndRua" is not null then 1 else 0 end
                + case when g."EndNum" is not null then 1 else 0 end
                + case when g."DddTel" is not null then 1 else 0 end
                + case when g."NumTel" is not null then 1 else 0 end
                + case when g."NumCnh" is not null then 1 else 0 end
                + case when g."CatCnh" is not null then 1 else 0 end
                + case when g."DatCnh" is not null then 1 else 0 end
                + case when g."VenCnh" is not null then 1 else 0 end)"#;

        let sql = format!(
            r#"
            with fun as (
                select f.*
                from {fun} as f
                where f."SitAfa" <> {TERMINATED_SITUATION}
                  and f."TipCol" = 1
                  and f."CodCar" = {DRIVER_JOB_CODE}
                  and f."NumCad" = any($1)
            ),
            cpl as (
                select g.*,
                       row_number() over (
                           partition by g."NumCad"
                           order by {score} desc, g."NumCad"
                       ) as rn
                from {cpl} as g
            )
            select
                f."NumEmp" as company_id,
                f."TipCol" as employee_type,
                f."NumCad" as employee_id,
                f."NomFun" as name,
                f."NumCpf" as cpf,
                f."DatNas" as birth_date,
                f."TipSex" as gender_code,
                f."DatAdm" as admission_date,
                f."SitAfa" as situation,
                f."CodCcu" as cost_center,
                cid."NomCid" as city,
                g."CodEst" as state,
                pai."NomPai" as country,
                g."NumCid" as birthplace,
                g."EndRua" as street,
                bai."NomBai" as district,
                g."EndNum" as house_number,
                bai."CepBai" as postal_code,
                g."DocIdn" as rg_number,
                g."EmiCid" as rg_issuer,
                g."NumCnh" as cnh_number,
                g."CatCnh" as cnh_category,
                g."DatCnh" as cnh_issue_date,
                g."VenCnh" as cnh_expiry_date,
                g."PriCnh" as cnh_first_license,
                g."DddTel" as phone_area,
                g."NumTel" as phone_number,
                f."EstCiv" as marital_status,
                null::text as mother_name
            from fun as f
            left join cpl as g on g."NumCad" = f."NumCad" and g.rn = 1
            left join lateral (
                select b."NomBai", b."CepBai"
                from {bai} as b
                where b."CodBai" = g."CodBai"
                order by b."NomBai"
                limit 1
            ) as bai on true
            left join lateral (
                select c."NomCid"
                from {cid} as c
                where c."CodCid" = g."CodCid"
                order by c."NomCid"
                limit 1
            ) as cid on true
            left join lateral (
                select p."NomPai"
                from {pai} as p
                where p."CodPai" = g."CodPai"
                order by p."NomPai"
                limit 1
            ) as pai on true
            order by f."NumCad" asc
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .context("fetch_driver_rows failed")?;

        rows.iter()
            .map(|row| {
                Ok(DriverSourceRow {
                    company_id: row.try_get("company_id")?,
                    employee_type: row.try_get("employee_type")?,
                    employee_id: row.try_get("employee_id")?,
                    name: row.try_get("name")?,
                    cpf: row.try_get("cpf")?,
                    birth_date: row.try_get("birth_date")?,
                    gender_code: row.try_get("gender_code")?,
                    admission_date: row.try_get("admission_date")?,
                    situation: row.try_get("situation")?,
                    cost_center: row.try_get("cost_center")?,
                    city: row.try_get("city")?,
                    state: row.try_get("state")?,
                    country: row.try_get("country")?,
                    birthplace: row.try_get("birthplace")?,
                    street: row.try_get("street")?,
                    district: row.try_get("district")?,
                    house_number: row.try_get("house_number")?,
                    postal_code: row.try_get("postal_code")?,
                    rg_number: row.try_get("rg_number")?,
                    rg_issuer: row.try_get("rg_issuer")?,
                    cnh_number: row.try_get("cnh_number")?,
                    cnh_category: row.try_get("cnh_category")?,
                    cnh_issue_date: row.try_get("cnh_issue_date")?,
                    cnh_expiry_date: row.try_get("cnh_expiry_date")?,
                    cnh_first_license: row.try_get("cnh_first_license")?,
                    phone_area: row.try_get("phone_area")?,
                    phone_number: row.try_get("phone_number")?,
                    marital_status: row.try_get("marital_status")?,
                    mother_name: row.try_get("mother_name")?,
                })
            })
            .collect()
    }
}

/// Synthesized change timestamp: audit date plus the HHMM-encoded time
/// column when one exists.
fn change_expr(alias: &str, date_col: &str, time_col: Option<&str>) -> String {
    let date = format!("{alias}.{}", quoted(date_col));
    match time_col {
        None => format!("({date})::timestamp"),
        Some(tc) => {
            let time = format!("{alias}.{}", quoted(tc));
            format!(
                "case when {time} is null then ({date})::timestamp \
                 else ({date})::timestamp + make_interval(mins => (({time})::int / 100) * 60 + ({time})::int % 100) end"
            )
        }
    }
}

async fn resolve_audit_columns(
    pool: &PgPool,
    schema: &str,
    table: &str,
) -> Result<Option<(String, Option<String>)>> {
    let rows = sqlx::query(
        r#"
        select c.column_name
        from information_schema.columns as c
        where c.table_schema = $1
          and c.table_name = $2
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .context("audit column discovery failed")?;

    if rows.is_empty() {
        bail!("tabela de origem nao encontrada: {schema:?}.{table:?}");
    }

    let mut lookup = std::collections::HashMap::new();
    for row in &rows {
        let name: String = row.try_get("column_name")?;
        lookup.insert(name.to_lowercase(), name);
    }

    for (date_cand, time_cand) in AUDIT_COLUMN_CANDIDATES {
        let Some(date_col) = lookup.get(&date_cand.to_lowercase()) else {
            continue;
        };
        let time_col = time_cand.and_then(|tc| lookup.get(&tc.to_lowercase())).cloned();
        return Ok(Some((date_col.clone(), time_col)));
    }

    Ok(None)
}

// ---------------------------------------------------------------------------
// Leave reads
// ---------------------------------------------------------------------------

pub struct LeaveSourceReader {
    pool: PgPool,
    schema: String,
}

impl LeaveSourceReader {
    pub fn new(pool: PgPool, schema: &str) -> Result<Self> {
        Ok(LeaveSourceReader {
            pool,
            schema: safe_identifier(schema, "Schema de origem")?,
        })
    }

    /// Leave rows strictly after the cursor, in cursor order. The date floor
    /// uses the leave date when the audit date carries the pre-1901
    /// sentinel common in this HR product.
    pub async fn fetch_rows_by_cursor(
        &self,
        limit: i64,
        cursor: &LeaveCursor,
        start_date: NaiveDate,
    ) -> Result<Vec<LeaveSourceRow>> {
        let schema = quoted(&self.schema);
        let afa = format!("{schema}.{}", quoted("R038AFA"));
        let fun = format!("{schema}.{}", quoted("R034FUN"));
        let sit = format!("{schema}.{}", quoted("R010SIT"));

        let situations = ALLOWED_LEAVE_SITUATIONS
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            r#"
            select
                a."NumEmp" as company_id,
                a."TipCol" as employee_type,
                a."NumCad" as employee_id,
                f."NumCpf" as cpf,
                s."DesSit" as situation_description,
                a."DatAfa" as leave_date,
                a."HorAfa" as leave_time,
                a."DatTer" as end_date,
                a."HorTer" as end_time,
                a."SitAfa" as situation,
                a."EncAfa" as termination,
                a."ObsAfa" as notes,
                a."SeqReg" as seq
            from {afa} as a
            inner join {fun} as f
                on f."NumEmp" = a."NumEmp"
               and f."TipCol" = a."TipCol"
               and f."NumCad" = a."NumCad"
            left join {sit} as s
                on s."CodSit" = a."SitAfa"
            where (case
                      when a."DatAlt" is null or a."DatAlt" < date '1901-01-01'
                          then a."DatAfa"
                      else a."DatAlt"
                   end)::date >= $1
              and a."SitAfa" in ({situations})
              and (
                   a."NumEmp" > $2
                or (a."NumEmp" = $2 and a."TipCol" > $3)
                or (a."NumEmp" = $2 and a."TipCol" = $3 and a."NumCad" > $4)
                or (a."NumEmp" = $2 and a."TipCol" = $3 and a."NumCad" = $4
                    and a."DatAfa" > $5)
                or (a."NumEmp" = $2 and a."TipCol" = $3 and a."NumCad" = $4
                    and a."DatAfa" = $5 and coalesce(a."HorAfa", 0) > $6)
                or (a."NumEmp" = $2 and a."TipCol" = $3 and a."NumCad" = $4
                    and a."DatAfa" = $5 and coalesce(a."HorAfa", 0) = $6
                    and coalesce(a."SeqReg", 0) > $7)
              )
            order by a."NumEmp" asc, a."TipCol" asc, a."NumCad" asc,
                     a."DatAfa" asc, coalesce(a."HorAfa", 0) asc,
                     coalesce(a."SeqReg", 0) asc
            limit $8
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(start_date)
            .bind(cursor.company_id)
            .bind(cursor.employee_type)
            .bind(cursor.employee_id)
            .bind(cursor.leave_date)
            .bind(cursor.leave_time)
            .bind(cursor.seq)
            .bind(limit.max(1))
            .fetch_all(&self.pool)
            .await
            .context("fetch_rows_by_cursor failed")?;

        rows.iter()
            .map(|row| {
                Ok(LeaveSourceRow {
                    company_id: row.try_get("company_id")?,
                    employee_type: row.try_get("employee_type")?,
                    employee_id: row.try_get("employee_id")?,
                    cpf: row.try_get("cpf")?,
                    situation_description: row.try_get("situation_description")?,
                    leave_date: row.try_get("leave_date")?,
                    leave_time: row.try_get("leave_time")?,
                    end_date: row.try_get("end_date")?,
                    end_time: row.try_get("end_time")?,
                    situation: row.try_get("situation")?,
                    termination: row.try_get("termination")?,
                    notes: row.try_get("notes")?,
                    seq: row.try_get("seq")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_expr_combines_date_and_hhmm_time() {
        let e = change_expr("t", "DatAlt", Some("HorAlt"));
        assert!(e.contains(r#"t."DatAlt""#));
        assert!(e.contains("/ 100) * 60"));
        assert!(e.contains("% 100"));

        let plain = change_expr("t", "DatAdm", None);
        assert_eq!(plain, r#"(t."DatAdm")::timestamp"#);
    }

    #[test]
    fn leave_situation_whitelist_is_the_agreed_closed_set() {
        assert_eq!(ALLOWED_LEAVE_SITUATIONS.len(), 35);
        assert!(ALLOWED_LEAVE_SITUATIONS.contains(&3));
        assert!(ALLOWED_LEAVE_SITUATIONS.contains(&512));
        assert!(!ALLOWED_LEAVE_SITUATIONS.contains(&16));
    }
}
