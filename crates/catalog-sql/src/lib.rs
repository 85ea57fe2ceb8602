//! Every SQL statement of the service lives in this crate, exposed as typed
//! async functions over a `sqlx` SQLite pool. Higher layers never write SQL:
//! they get/put records, dequeue by status, and serialize every state-machine
//! write through the compare-and-set helpers in [`datasets`].

pub mod datasets;
pub mod sessions;
pub mod users;

use std::str::FromStr;

const SCHEMA: &str = include_str!("schema.sql");

/// Open (creating if necessary) the catalog database and apply its schema.
pub async fn open(url: &str) -> sqlx::Result<sqlx::SqlitePool> {
    let options = sqlx::sqlite::SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    install_schema(&pool).await?;
    Ok(pool)
}

pub async fn install_schema(pool: &sqlx::SqlitePool) -> sqlx::Result<()> {
    use sqlx::Executor;
    pool.execute(SCHEMA).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> sqlx::SqlitePool {
    // A single shared in-memory connection: separate connections would each
    // see their own empty database.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    install_schema(&pool).await.unwrap();
    pool
}
