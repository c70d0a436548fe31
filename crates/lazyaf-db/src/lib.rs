//! Database layer for the LazyAF execution core.
//!
//! The primary database is the source of truth: runner registrations, step
//! assignments, and workspace locks all live here so a backend restart is
//! safe. Stores hold a pool clone and expose guarded-transition methods;
//! row locks are only held for the duration of one transaction.

pub mod error;
pub mod store;

pub use error::{DbError, DbResult};
pub use store::*;

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
