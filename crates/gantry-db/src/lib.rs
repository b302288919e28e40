//! Database layer for Gantry.
//!
//! Every scheduler operation runs inside one [`Transaction`] obtained from a
//! [`Database`]. The PostgreSQL backend maps a transaction onto a real database
//! transaction; the in-memory backend serialises transactions and applies their
//! writes on commit.

pub mod error;
pub mod memory;
pub mod pg;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::MemoryDatabase;
pub use pg::PgDatabase;
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
