//! Reflective column discovery against `information_schema.columns`.
//!
//! Destination outbox tables differ across installations: the required core
//! is fixed, everything else (mirror fields, retry bookkeeping) may or may
//! not exist. Engines resolve a typed column map once at construction and
//! fail fast when a required column is missing.

use std::collections::HashMap;

use anyhow::{bail, Result};
use sqlx::{PgPool, Row};

use fls_config::{is_safe_identifier, normalize_key};

/// Physical column names of one table, keyed by normalized logical name
/// (lowercase alphanumerics), so lookups tolerate case and underscore
/// differences between installations.
#[derive(Debug, Clone)]
pub struct TableColumns {
    schema: String,
    table: String,
    map: HashMap<String, String>,
}

impl TableColumns {
    /// Loads the column set of `schema.table`. Fails when the table does not
    /// exist. Physical names that would not survive identifier validation
    /// are skipped; they can never be referenced safely.
    pub async fn load(pool: &PgPool, schema: &str, table: &str) -> Result<Self> {
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
        .await?;

        let mut map = HashMap::new();
        for row in rows {
            let name: String = row.try_get("column_name")?;
            if is_safe_identifier(&name) {
                map.insert(normalize_key(&name), name);
            }
        }

        if map.is_empty() {
            bail!("tabela nao encontrada: {schema:?}.{table:?}");
        }

        Ok(TableColumns {
            schema: schema.to_string(),
            table: table.to_string(),
            map,
        })
    }

    pub fn get(&self, logical: &str) -> Option<String> {
        self.map.get(&normalize_key(logical)).cloned()
    }

    pub fn require(&self, logical: &str) -> Result<String> {
        match self.get(logical) {
            Some(name) => Ok(name),
            None => bail!(
                "coluna obrigatoria nao encontrada em {:?}.{:?}: {logical}",
                self.schema,
                self.table
            ),
        }
    }

    /// All required columns at once, reported together.
    pub fn require_all(&self, logical_names: &[&str]) -> Result<Vec<String>> {
        let missing: Vec<&str> = logical_names
            .iter()
            .copied()
            .filter(|n| self.get(n).is_none())
            .collect();
        if !missing.is_empty() {
            bail!(
                "colunas obrigatorias nao encontradas em {:?}.{:?}: {}",
                self.schema,
                self.table,
                missing.join(", ")
            );
        }
        Ok(logical_names
            .iter()
            .map(|n| self.get(n).expect("checked above"))
            .collect())
    }
}
