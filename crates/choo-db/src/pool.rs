use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::DbConfig;

/// Create a connection pool with sensible defaults.
///
/// The database file (and its parent directory) is created if it does not
/// already exist; `foreign_keys` is turned on explicitly since SQLite
/// defaults it off per-connection.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    if let Some(path) = config.file_path() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create journal directory {}", parent.display())
            })?;
        }
    }

    let connect_options: SqliteConnectOptions = config
        .database_url
        .parse()
        .with_context(|| format!("invalid database URL {}", config.database_url))?;
    let connect_options = connect_options
        .create_if_missing(true)
        .foreign_keys(true)
        .pragma("journal_mode", "WAL");

    // In-memory databases are connection-scoped: each new pooled connection
    // would otherwise see its own empty database, so cap the pool at one
    // connection when there is no backing file.
    let max_connections = if config.file_path().is_some() { 5 } else { 1 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(connect_options)
        .await
        .with_context(|| {
            format!("failed to open journal database at {}", config.database_url)
        })?;
    Ok(pool)
}

/// Run all pending migrations from the given directory against the pool.
///
/// Uses a runtime `Migrator` so the migrations directory can be resolved at
/// process startup rather than baked in at compile time.
pub async fn run_migrations(pool: &SqlitePool, migrations_dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| {
            format!(
                "failed to load migrations from {}",
                migrations_dir.display()
            )
        })?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied successfully");
    Ok(())
}

/// Ensure the journal database file exists, creating it (and running
/// migrations) if necessary.
///
/// Unlike a server-backed database, SQLite has no separate "maintenance"
/// connection: opening the pool with `create_if_missing` is sufficient to
/// bring the file into existence.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let pool = create_pool(config).await?;
    run_migrations(&pool, default_migrations_path()).await?;
    pool.close().await;
    Ok(())
}

/// Return the row count for every user-defined table in the database.
///
/// Useful for the `choo init` success message.
pub async fn table_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    let mut counts = Vec::with_capacity(tables.len());
    for (table_name,) in &tables {
        // Table names come from sqlite_master so they are safe identifiers.
        let query = format!("SELECT COUNT(*) FROM {table_name}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table_name}"))?;
        counts.push((table_name.clone(), count.0));
    }
    Ok(counts)
}

/// Return the default path to the migrations directory shipped with
/// `choo-db`.
///
/// At runtime this resolves relative to the `choo-db` crate's source tree
/// via the `CARGO_MANIFEST_DIR` compile-time env. For installed binaries
/// (where the source tree is absent) the migrations are embedded at compile
/// time by the caller instead.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_pool_creates_missing_file_and_parent_dir() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("journal.db");
        let config = DbConfig::new(format!("sqlite:{}", db_path.display()));

        let pool = create_pool(&config).await.expect("create_pool failed");
        run_migrations(&pool, default_migrations_path())
            .await
            .expect("migrations failed");

        assert!(db_path.exists());
        pool.close().await;
    }

    #[tokio::test]
    async fn table_counts_reports_empty_tables_after_migration() {
        let config = DbConfig::new("sqlite::memory:");
        let pool = create_pool(&config).await.unwrap();
        run_migrations(&pool, default_migrations_path())
            .await
            .unwrap();

        let counts = table_counts(&pool).await.unwrap();
        let names: Vec<&str> = counts.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"runs"));
        assert!(names.contains(&"units"));
        assert!(names.contains(&"events"));
        assert!(counts.iter().all(|(_, count)| *count == 0));

        pool.close().await;
    }
}
