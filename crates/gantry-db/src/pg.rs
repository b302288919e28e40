//! PostgreSQL backend.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres};

use crate::{Database, DbError, DbResult, Transaction};

/// A [`Database`] backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(&self) -> DbResult<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

/// An open PostgreSQL transaction. Rolled back on drop unless committed.
pub struct PgTransaction {
    pub(crate) tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Decode a text column into a domain enum.
pub(crate) fn decode<T>(column: &str, raw: &str) -> DbResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse()
        .map_err(|e| DbError::Corrupt(format!("{}: {}", column, e)))
}

/// Map a unique-constraint violation to [`DbError::Duplicate`].
pub(crate) fn unique_violation(err: sqlx::Error, what: impl Into<String>) -> DbError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Duplicate(what.into()),
        _ => DbError::Database(err),
    }
}
