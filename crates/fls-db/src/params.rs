//! Dynamic parameter binding for statements whose column lists are only
//! known after reflective resolution. Values stay bound parameters; the
//! enum just erases the Rust type so heterogeneous lists can be built.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

#[derive(Debug, Clone)]
pub enum SqlParam {
    SmallInt(Option<i16>),
    Int(Option<i32>),
    BigInt(Option<i64>),
    Text(Option<String>),
    Bytes(Option<Vec<u8>>),
    Date(Option<NaiveDate>),
    Timestamp(Option<DateTime<Utc>>),
}

pub fn push_bind<'q>(
    q: Query<'q, Postgres, PgArguments>,
    p: SqlParam,
) -> Query<'q, Postgres, PgArguments> {
    match p {
        SqlParam::SmallInt(v) => q.bind(v),
        SqlParam::Int(v) => q.bind(v),
        SqlParam::BigInt(v) => q.bind(v),
        SqlParam::Text(v) => q.bind(v),
        SqlParam::Bytes(v) => q.bind(v),
        SqlParam::Date(v) => q.bind(v),
        SqlParam::Timestamp(v) => q.bind(v),
    }
}
