//! Database query functions for the `units` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use ulid::Ulid;

use crate::models::{UnitRow, UnitStatus};

/// Insert a new unit row in status `pending`.
pub async fn insert_unit(pool: &SqlitePool, run_id: &str, unit_id: &str) -> Result<UnitRow> {
    let id = Ulid::new().to_string();
    sqlx::query(
        "INSERT INTO units (id, run_id, unit_id, status) VALUES (?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(run_id)
    .bind(unit_id)
    .bind(UnitStatus::Pending)
    .execute(pool)
    .await
    .context("failed to insert unit")?;

    get_unit(pool, run_id, unit_id)
        .await?
        .context("inserted unit not found immediately after insert")
}

/// Fetch a unit by its `(run_id, unit_id)` pair.
pub async fn get_unit(pool: &SqlitePool, run_id: &str, unit_id: &str) -> Result<Option<UnitRow>> {
    let row = sqlx::query_as::<_, UnitRow>(
        "SELECT * FROM units WHERE run_id = ? AND unit_id = ?",
    )
    .bind(run_id)
    .bind(unit_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch unit")?;
    Ok(row)
}

/// List every unit belonging to a run, in insertion order (discovery order).
pub async fn list_units_for_run(pool: &SqlitePool, run_id: &str) -> Result<Vec<UnitRow>> {
    let rows = sqlx::query_as::<_, UnitRow>(
        "SELECT * FROM units WHERE run_id = ? ORDER BY rowid ASC",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to list units for run")?;
    Ok(rows)
}

/// Atomically transition a unit from one status to another.
///
/// Uses optimistic locking: the `WHERE` clause includes `status = from`, so
/// the row updates only if the current status still matches. Returns the
/// number of rows affected (0 means the precondition did not hold).
pub async fn transition_unit_status(
    pool: &SqlitePool,
    run_id: &str,
    unit_id: &str,
    from: UnitStatus,
    to: UnitStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE units \
         SET status = ?, \
             started_at = COALESCE(?, started_at), \
             completed_at = COALESCE(?, completed_at) \
         WHERE run_id = ? AND unit_id = ? AND status = ?",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(run_id)
    .bind(unit_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition unit status")?;
    Ok(result.rows_affected())
}

/// Mark a unit `blocked`, recording the originating failed unit id that
/// triggered the block, per the scheduler's failure cascade.
pub async fn block_unit(
    pool: &SqlitePool,
    run_id: &str,
    unit_id: &str,
    blocked_by: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE units SET status = ?, blocked_by = ? WHERE run_id = ? AND unit_id = ?",
    )
    .bind(UnitStatus::Blocked)
    .bind(blocked_by)
    .bind(run_id)
    .bind(unit_id)
    .execute(pool)
    .await
    .context("failed to block unit")?;
    Ok(result.rows_affected())
}

/// Record the unit's error message and transition it to `failed`.
pub async fn fail_unit(
    pool: &SqlitePool,
    run_id: &str,
    unit_id: &str,
    error: &str,
    completed_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE units SET status = ?, error = ?, completed_at = ? \
         WHERE run_id = ? AND unit_id = ?",
    )
    .bind(UnitStatus::Failed)
    .bind(error)
    .bind(completed_at)
    .bind(run_id)
    .bind(unit_id)
    .execute(pool)
    .await
    .context("failed to fail unit")?;
    Ok(result.rows_affected())
}

/// Record the branch and worktree path assigned to a unit at dispatch time.
pub async fn assign_unit_workspace(
    pool: &SqlitePool,
    run_id: &str,
    unit_id: &str,
    branch: &str,
    worktree_path: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE units SET branch = ?, worktree_path = ? WHERE run_id = ? AND unit_id = ?",
    )
    .bind(branch)
    .bind(worktree_path)
    .bind(run_id)
    .bind(unit_id)
    .execute(pool)
    .await
    .context("failed to assign unit workspace")?;
    Ok(result.rows_affected())
}

/// Count units by status for a run -- drives `active_count`, `is_complete`,
/// and `has_failures` on the scheduler's read views.
#[derive(Debug, Clone, Default)]
pub struct UnitProgress {
    pub pending: i64,
    pub ready: i64,
    pub in_progress: i64,
    pub pr_open: i64,
    pub in_review: i64,
    pub merging: i64,
    pub complete: i64,
    pub failed: i64,
    pub blocked: i64,
    pub total: i64,
}

impl UnitProgress {
    pub fn active_count(&self) -> i64 {
        self.in_progress + self.pr_open + self.in_review + self.merging
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.complete + self.failed + self.blocked == self.total
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.blocked > 0
    }
}

pub async fn get_unit_progress(pool: &SqlitePool, run_id: &str) -> Result<UnitProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) as cnt FROM units WHERE run_id = ? GROUP BY status",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to get unit progress")?;

    let mut progress = UnitProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "ready" => progress.ready = *count,
            "in_progress" => progress.in_progress = *count,
            "pr_open" => progress.pr_open = *count,
            "in_review" => progress.in_review = *count,
            "merging" => progress.merging = *count,
            "complete" => progress.complete = *count,
            "failed" => progress.failed = *count,
            "blocked" => progress.blocked = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::pool::{create_pool, default_migrations_path, run_migrations};
    use crate::queries::runs::insert_run;

    async fn memory_pool_with_run() -> (SqlitePool, String) {
        let config = DbConfig::new("sqlite::memory:");
        let pool = create_pool(&config).await.unwrap();
        run_migrations(&pool, default_migrations_path()).await.unwrap();
        let run = insert_run(&pool, "choo/x", "/repo", "main", "tasks", 4, "0.1.0", None)
            .await
            .unwrap();
        (pool, run.id)
    }

    #[tokio::test]
    async fn insert_and_fetch_unit() {
        let (pool, run_id) = memory_pool_with_run().await;
        let unit = insert_unit(&pool, &run_id, "a").await.unwrap();
        assert_eq!(unit.status, UnitStatus::Pending);
        assert!(get_unit(&pool, &run_id, "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn optimistic_transition_fails_on_stale_from() {
        let (pool, run_id) = memory_pool_with_run().await;
        insert_unit(&pool, &run_id, "a").await.unwrap();

        let affected = transition_unit_status(
            &pool,
            &run_id,
            "a",
            UnitStatus::Ready,
            UnitStatus::InProgress,
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(affected, 0, "unit is still pending, not ready");

        let affected = transition_unit_status(
            &pool,
            &run_id,
            "a",
            UnitStatus::Pending,
            UnitStatus::Ready,
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(affected, 1);
    }

    #[tokio::test]
    async fn block_records_blocked_by() {
        let (pool, run_id) = memory_pool_with_run().await;
        insert_unit(&pool, &run_id, "a").await.unwrap();
        insert_unit(&pool, &run_id, "b").await.unwrap();

        block_unit(&pool, &run_id, "b", "a").await.unwrap();
        let b = get_unit(&pool, &run_id, "b").await.unwrap().unwrap();
        assert_eq!(b.status, UnitStatus::Blocked);
        assert_eq!(b.blocked_by.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn unit_progress_counts_by_status() {
        let (pool, run_id) = memory_pool_with_run().await;
        insert_unit(&pool, &run_id, "a").await.unwrap();
        insert_unit(&pool, &run_id, "b").await.unwrap();
        transition_unit_status(
            &pool,
            &run_id,
            "a",
            UnitStatus::Pending,
            UnitStatus::Ready,
            None,
            None,
        )
        .await
        .unwrap();

        let progress = get_unit_progress(&pool, &run_id).await.unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.pending, 1);
        assert_eq!(progress.ready, 1);
        assert!(!progress.is_complete());
        assert!(!progress.has_failures());
    }
}
