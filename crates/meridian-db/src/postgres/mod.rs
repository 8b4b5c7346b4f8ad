//! PostgreSQL backend.
//!
//! All functions use sqlx non-macro queries. Conditional transitions are
//! single `UPDATE … WHERE <expected> RETURNING *` statements, and first-write
//! races are settled by unique constraints with `ON CONFLICT DO NOTHING`.

mod bridges;
mod key_audit;
mod peers;
mod receipts;
mod signing_keys;

use std::str::FromStr;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::store::StoreError;

/// Implements every store trait against one connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Health check: verify the database is reachable.
pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

/// Decode a TEXT column into one of the model enums.
pub(crate) fn text_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_owned(),
        source: Box::new(e),
    })
}

/// Turn a unique-constraint violation into `Conflict`, pass everything else through.
pub(crate) fn conflict_or(err: sqlx::Error, what: &'static str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(what),
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => StoreError::NotFound(what),
        _ => StoreError::Database(err),
    }
}
