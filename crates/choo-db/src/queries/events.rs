//! Database query functions for the `events` table.
//!
//! `sequence` is monotonic per run, not a global id -- assignment happens
//! inside a transaction so concurrent writers for the same run never race
//! on the next sequence number.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{Event, EventType, TokenUsage};

/// Append an event to the journal, assigning the next sequence number for
/// its run. Safe under concurrent writers: the `MAX(sequence)+1` lookup and
/// insert happen inside the same transaction.
pub async fn append_event(
    pool: &SqlitePool,
    run_id: &str,
    event_type: EventType,
    unit_id: Option<&str>,
    payload_json: Option<&str>,
) -> Result<Event> {
    let mut tx = pool.begin().await.context("failed to start transaction")?;

    let next_sequence: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM events WHERE run_id = ?",
    )
    .bind(run_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to compute next sequence")?;

    let created_at = Utc::now();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO events (run_id, sequence, event_type, unit_id, payload_json, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         RETURNING id",
    )
    .bind(run_id)
    .bind(next_sequence)
    .bind(event_type.to_string())
    .bind(unit_id)
    .bind(payload_json)
    .bind(created_at)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert event")?;

    tx.commit().await.context("failed to commit event insert")?;

    Ok(Event {
        id,
        run_id: run_id.to_string(),
        sequence: next_sequence,
        event_type: event_type.to_string(),
        unit_id: unit_id.map(str::to_string),
        payload_json: payload_json.map(str::to_string),
        created_at,
    })
}

/// Append an event carrying a caller-supplied original timestamp, used by
/// the container bridge to preserve the in-container wall-clock time
/// rather than stamping re-emission time.
pub async fn append_event_with_timestamp(
    pool: &SqlitePool,
    run_id: &str,
    event_type: EventType,
    unit_id: Option<&str>,
    payload_json: Option<&str>,
    created_at: chrono::DateTime<Utc>,
) -> Result<Event> {
    let mut tx = pool.begin().await.context("failed to start transaction")?;

    let next_sequence: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM events WHERE run_id = ?",
    )
    .bind(run_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to compute next sequence")?;

    let id: i64 = sqlx::query_scalar(
        "INSERT INTO events (run_id, sequence, event_type, unit_id, payload_json, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         RETURNING id",
    )
    .bind(run_id)
    .bind(next_sequence)
    .bind(event_type.to_string())
    .bind(unit_id)
    .bind(payload_json)
    .bind(created_at)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert event")?;

    tx.commit().await.context("failed to commit event insert")?;

    Ok(Event {
        id,
        run_id: run_id.to_string(),
        sequence: next_sequence,
        event_type: event_type.to_string(),
        unit_id: unit_id.map(str::to_string),
        payload_json: payload_json.map(str::to_string),
        created_at,
    })
}

/// Append an event whose sequence number was already assigned by the
/// caller's own counter (the daemon's per-job `EventBus`), so a live
/// subscriber's view and the journal's persisted view share one sequence
/// space instead of racing two independent counters. Fails on conflict with
/// the `(run_id, sequence)` unique constraint rather than silently
/// reassigning, since a collision means the caller's counter and the
/// journal have already diverged.
pub async fn append_event_with_sequence(
    pool: &SqlitePool,
    run_id: &str,
    sequence: i64,
    event_type: EventType,
    unit_id: Option<&str>,
    payload_json: Option<&str>,
    created_at: chrono::DateTime<Utc>,
) -> Result<Event> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO events (run_id, sequence, event_type, unit_id, payload_json, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         RETURNING id",
    )
    .bind(run_id)
    .bind(sequence)
    .bind(event_type.to_string())
    .bind(unit_id)
    .bind(payload_json)
    .bind(created_at)
    .fetch_one(pool)
    .await
    .context("failed to insert event with caller-assigned sequence")?;

    Ok(Event {
        id,
        run_id: run_id.to_string(),
        sequence,
        event_type: event_type.to_string(),
        unit_id: unit_id.map(str::to_string),
        payload_json: payload_json.map(str::to_string),
        created_at,
    })
}

/// List events for a run with `sequence >= from_sequence`, ascending -- the
/// query behind `WatchJob`'s reconnect/resume semantics.
pub async fn list_events_from(
    pool: &SqlitePool,
    run_id: &str,
    from_sequence: i64,
) -> Result<Vec<Event>> {
    let events = sqlx::query_as::<_, Event>(
        "SELECT * FROM events WHERE run_id = ? AND sequence >= ? ORDER BY sequence ASC",
    )
    .bind(run_id)
    .bind(from_sequence)
    .fetch_all(pool)
    .await
    .context("failed to list events")?;
    Ok(events)
}

/// The highest sequence number persisted for a run, or 0 if none.
pub async fn latest_sequence(pool: &SqlitePool, run_id: &str) -> Result<i64> {
    let seq: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE run_id = ?",
    )
    .bind(run_id)
    .fetch_one(pool)
    .await
    .context("failed to fetch latest sequence")?;
    Ok(seq)
}

/// Pull a `{"usage": {"input_tokens": N, "output_tokens": N}}` shape out of
/// a `task.provider.invoke` payload's `line` field, if the provider emitted
/// one. Most lines are plain text and yield `None`.
fn extract_usage(payload_json: &str) -> Option<TokenUsage> {
    let payload: serde_json::Value = serde_json::from_str(payload_json).ok()?;
    let line = payload.get("line")?.as_str()?;
    let parsed: serde_json::Value = serde_json::from_str(line).ok()?;
    let usage = parsed.get("usage")?;
    Some(TokenUsage {
        input_tokens: usage.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        output_tokens: usage.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
    })
}

/// Sum token usage across every `task.provider.invoke` event for a run,
/// optionally narrowed to one unit. Riding on already-persisted event
/// payloads rather than a dedicated table or query.
pub async fn token_usage(
    pool: &SqlitePool,
    run_id: &str,
    unit_id: Option<&str>,
) -> Result<TokenUsage> {
    let rows: Vec<(Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT unit_id, payload_json FROM events WHERE run_id = ? AND event_type = ?",
    )
    .bind(run_id)
    .bind(EventType::TaskProviderInvoke.to_string())
    .fetch_all(pool)
    .await
    .context("failed to fetch provider-invoke events")?;

    let mut total = TokenUsage::default();
    for (row_unit, payload) in rows {
        if let Some(want) = unit_id {
            if row_unit.as_deref() != Some(want) {
                continue;
            }
        }
        if let Some(payload) = payload {
            if let Some(usage) = extract_usage(&payload) {
                total.add(usage);
            }
        }
    }
    Ok(total)
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
    async fn sequence_numbers_are_monotonic_per_run() {
        let (pool, run_id) = memory_pool_with_run().await;
        let e1 = append_event(&pool, &run_id, EventType::OrchStarted, None, None)
            .await
            .unwrap();
        let e2 = append_event(&pool, &run_id, EventType::UnitStarted, Some("a"), None)
            .await
            .unwrap();
        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 2);
    }

    #[tokio::test]
    async fn sequence_numbers_are_independent_per_run() {
        let (pool, run_a) = memory_pool_with_run().await;
        let run_b = insert_run(&pool, "choo/y", "/repo", "main", "tasks", 4, "0.1.0", None)
            .await
            .unwrap()
            .id;

        append_event(&pool, &run_a, EventType::OrchStarted, None, None)
            .await
            .unwrap();
        let first_b = append_event(&pool, &run_b, EventType::OrchStarted, None, None)
            .await
            .unwrap();
        assert_eq!(first_b.sequence, 1);
    }

    #[tokio::test]
    async fn list_events_from_resumes_at_sequence() {
        let (pool, run_id) = memory_pool_with_run().await;
        for _ in 0..3 {
            append_event(&pool, &run_id, EventType::TaskStarted, Some("a"), None)
                .await
                .unwrap();
        }
        let resumed = list_events_from(&pool, &run_id, 2).await.unwrap();
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[0].sequence, 2);
    }

    #[tokio::test]
    async fn append_event_with_sequence_uses_the_caller_assigned_number() {
        let (pool, run_id) = memory_pool_with_run().await;
        let event = append_event_with_sequence(
            &pool,
            &run_id,
            7,
            EventType::OrchStarted,
            None,
            None,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(event.sequence, 7);
    }

    #[tokio::test]
    async fn append_event_with_sequence_rejects_a_duplicate_sequence() {
        let (pool, run_id) = memory_pool_with_run().await;
        append_event_with_sequence(&pool, &run_id, 1, EventType::OrchStarted, None, None, Utc::now())
            .await
            .unwrap();
        let collision =
            append_event_with_sequence(&pool, &run_id, 1, EventType::UnitStarted, None, None, Utc::now())
                .await;
        assert!(collision.is_err());
    }

    #[tokio::test]
    async fn events_cascade_delete_with_run() {
        let (pool, run_id) = memory_pool_with_run().await;
        append_event(&pool, &run_id, EventType::OrchStarted, None, None)
            .await
            .unwrap();
        sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(&run_id)
            .execute(&pool)
            .await
            .unwrap();
        let remaining = list_events_from(&pool, &run_id, 0).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn token_usage_sums_usage_objects_embedded_in_provider_lines() {
        let (pool, run_id) = memory_pool_with_run().await;
        let line = serde_json::json!({"usage": {"input_tokens": 100, "output_tokens": 40}}).to_string();
        let payload = serde_json::json!({"stream": "stdout", "line": line}).to_string();
        append_event(&pool, &run_id, EventType::TaskProviderInvoke, Some("a"), Some(&payload))
            .await
            .unwrap();
        let plain_payload = serde_json::json!({"stream": "stdout", "line": "not json"}).to_string();
        append_event(&pool, &run_id, EventType::TaskProviderInvoke, Some("a"), Some(&plain_payload))
            .await
            .unwrap();

        let usage = token_usage(&pool, &run_id, None).await.unwrap();
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 40);
    }

    #[tokio::test]
    async fn token_usage_can_be_narrowed_to_one_unit() {
        let (pool, run_id) = memory_pool_with_run().await;
        let line_a = serde_json::json!({"usage": {"input_tokens": 10, "output_tokens": 5}}).to_string();
        let payload_a = serde_json::json!({"stream": "stdout", "line": line_a}).to_string();
        append_event(&pool, &run_id, EventType::TaskProviderInvoke, Some("a"), Some(&payload_a))
            .await
            .unwrap();
        let line_b = serde_json::json!({"usage": {"input_tokens": 999, "output_tokens": 999}}).to_string();
        let payload_b = serde_json::json!({"stream": "stdout", "line": line_b}).to_string();
        append_event(&pool, &run_id, EventType::TaskProviderInvoke, Some("b"), Some(&payload_b))
            .await
            .unwrap();

        let usage = token_usage(&pool, &run_id, Some("a")).await.unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
    }
}
