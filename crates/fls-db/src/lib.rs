//! Database layer: read-only access to the upstream HR schema and full
//! ownership of the outbox state tables on the destination database.
//!
//! Everything here is raw SQL over sqlx/Postgres. Identifiers interpolated
//! into statements are validated (and, for destination tables, resolved
//! reflectively against `information_schema`) before use; values are always
//! bound parameters.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod columns;
pub mod driver_outbox;
pub mod leave_outbox;
mod params;
pub mod source;

pub use columns::TableColumns;
pub use driver_outbox::DriverOutbox;
pub use leave_outbox::LeaveOutbox;
pub use source::{DriverSourceReader, LeaveSourceReader, SourceTable};

/// Connection URL override used only by the test suites.
pub const ENV_TEST_DB_URL: &str = "FLS_DATABASE_URL";

pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connectivity probe used by the CLI.
pub async fn status(pool: &PgPool) -> Result<bool> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    Ok(one == 1)
}

/// Detect a Postgres unique-constraint violation (SQLSTATE 23505). Outbox
/// inserts racing a concurrent sync worker swallow these.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
