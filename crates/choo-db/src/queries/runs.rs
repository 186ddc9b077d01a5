//! Database query functions for the `runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use ulid::Ulid;

use crate::models::{Run, RunStatus};

/// Insert a new run row in status `pending`.
///
/// Fails if a `(feature_branch, repo_path)` pair already has an active run,
/// per the unique constraint on the table -- the caller should check
/// [`active_run_for_branch`] first to produce a clean error rather than
/// surfacing the raw constraint violation.
#[allow(clippy::too_many_arguments)]
pub async fn insert_run(
    pool: &SqlitePool,
    feature_branch: &str,
    repo_path: &str,
    target_branch: &str,
    tasks_dir: &str,
    parallelism: i64,
    daemon_version: &str,
    config_json: Option<&str>,
) -> Result<Run> {
    let id = Ulid::new().to_string();
    sqlx::query(
        "INSERT INTO runs (id, feature_branch, repo_path, target_branch, tasks_dir, \
                            parallelism, status, daemon_version, config_json) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(feature_branch)
    .bind(repo_path)
    .bind(target_branch)
    .bind(tasks_dir)
    .bind(parallelism)
    .bind(RunStatus::Pending)
    .bind(daemon_version)
    .bind(config_json)
    .execute(pool)
    .await
    .context("failed to insert run")?;

    get_run(pool, &id)
        .await?
        .context("inserted run not found immediately after insert")
}

/// Fetch a run by id.
pub async fn get_run(pool: &SqlitePool, id: &str) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;
    Ok(run)
}

/// Find the active (non-terminal) run, if any, for a `(feature_branch, repo_path)` pair.
pub async fn active_run_for_branch(
    pool: &SqlitePool,
    feature_branch: &str,
    repo_path: &str,
) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs \
         WHERE feature_branch = ? AND repo_path = ? \
           AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(feature_branch)
    .bind(repo_path)
    .fetch_optional(pool)
    .await
    .context("failed to look up active run")?;
    Ok(run)
}

/// List runs, optionally filtered by status, newest first.
pub async fn list_runs(pool: &SqlitePool, status_filter: Option<RunStatus>) -> Result<Vec<Run>> {
    let runs = match status_filter {
        Some(status) => {
            sqlx::query_as::<_, Run>(
                "SELECT * FROM runs WHERE status = ? ORDER BY started_at DESC, id DESC",
            )
            .bind(status)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Run>("SELECT * FROM runs ORDER BY started_at DESC, id DESC")
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list runs")?;
    Ok(runs)
}

/// Mark a run `running` and record its start time.
pub async fn mark_run_started(pool: &SqlitePool, id: &str, started_at: DateTime<Utc>) -> Result<()> {
    let result = sqlx::query("UPDATE runs SET status = ?, started_at = ? WHERE id = ?")
        .bind(RunStatus::Running)
        .bind(started_at)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark run started")?;
    if result.rows_affected() == 0 {
        anyhow::bail!("run {id} not found");
    }
    Ok(())
}

/// Mark a run complete or failed, recording the completion time and optional error.
pub async fn finish_run(
    pool: &SqlitePool,
    id: &str,
    status: RunStatus,
    completed_at: DateTime<Utc>,
    error: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE runs SET status = ?, completed_at = ?, error = ? WHERE id = ?",
    )
    .bind(status)
    .bind(completed_at)
    .bind(error)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finish run")?;
    if result.rows_affected() == 0 {
        anyhow::bail!("run {id} not found");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::pool::{create_pool, default_migrations_path, run_migrations};

    async fn memory_pool() -> SqlitePool {
        let config = DbConfig::new("sqlite::memory:");
        let pool = create_pool(&config).await.unwrap();
        run_migrations(&pool, default_migrations_path()).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn insert_and_fetch_run() {
        let pool = memory_pool().await;
        let run = insert_run(&pool, "choo/feature-x", "/repo", "main", "tasks", 4, "0.1.0", None)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        let fetched = get_run(&pool, &run.id).await.unwrap().unwrap();
        assert_eq!(fetched.feature_branch, "choo/feature-x");
    }

    #[tokio::test]
    async fn duplicate_active_run_violates_unique_constraint() {
        let pool = memory_pool().await;
        insert_run(&pool, "choo/feature-x", "/repo", "main", "tasks", 4, "0.1.0", None)
            .await
            .unwrap();

        let second = insert_run(&pool, "choo/feature-x", "/repo", "main", "tasks", 4, "0.1.0", None).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn active_run_lookup_excludes_terminal_runs() {
        let pool = memory_pool().await;
        let run = insert_run(&pool, "choo/feature-x", "/repo", "main", "tasks", 4, "0.1.0", None)
            .await
            .unwrap();

        assert!(active_run_for_branch(&pool, "choo/feature-x", "/repo")
            .await
            .unwrap()
            .is_some());

        finish_run(&pool, &run.id, RunStatus::Completed, Utc::now(), None)
            .await
            .unwrap();

        assert!(active_run_for_branch(&pool, "choo/feature-x", "/repo")
            .await
            .unwrap()
            .is_none());
    }
}
