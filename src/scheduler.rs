//! Durable, idempotent task scheduler (record level).
//!
//! This is persistence only: deterministic task identity, idempotent
//! insert, and pending-queue ordering by `next_run_at`. Executing tasks
//! (status transitions `pending → running → …`) belongs to an external
//! executor.
//!
//! Task identity is UUIDv5 under the fixed namespace
//! `6ba7b810-9dad-11d1-80b4-00c04fd430c8`:
//! - dry-run: the name is `sha256(canonical(normalized_task))`, so two
//!   identical plans always preview the same id;
//! - commit: the name is the caller's `idempotency_key`, so resubmission
//!   is a no-op that replays the stored record byte for byte.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::canon::{canonical_json, hash_value};
use crate::errors::{tool_err, ErrorCode};
use crate::models::EPOCH_ISO;

/// Fixed UUIDv5 namespace (the RFC 4122 DNS namespace).
pub const TASK_NAMESPACE: Uuid = Uuid::NAMESPACE_DNS;

/// Timestamp format used for `next_run_at` and persisted times.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Scheduling request, already shape-validated by the tool layer.
#[derive(Debug, Clone)]
pub struct ScheduleRequest<'a> {
    pub title: &'a str,
    pub action: &'a str,
    pub payload: &'a Value,
    pub run_at: Option<&'a str>,
    pub interval_seconds: Option<i64>,
    pub reference_time: Option<&'a str>,
    pub idempotency_key: Option<&'a str>,
    pub commit: bool,
}

/// Outcome of a scheduling call.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleOutcome {
    pub task_id: String,
    /// `"planned"` (dry-run), `"scheduled"`, or `"idempotent_hit"`.
    pub status: String,
    pub next_run_at: String,
    /// The normalized task record, stored (commit) or previewed (dry-run).
    pub task: Value,
}

/// A pending-queue row.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRow {
    pub task_id: String,
    pub title: String,
    pub action: String,
    pub status: String,
    pub next_run_at: String,
}

/// Resolve the effective `next_run_at`.
///
/// An explicit `run_at` wins. Otherwise `interval_seconds` requires a
/// `reference_time` to stay deterministic (`ERR_DETERMINISM`); with
/// neither the schedule is invalid.
pub fn resolve_next_run_at(
    run_at: Option<&str>,
    interval_seconds: Option<i64>,
    reference_time: Option<&str>,
) -> Result<String> {
    if let Some(run_at) = run_at {
        let parsed = parse_ts(run_at)?;
        return Ok(parsed.format(TS_FORMAT).to_string());
    }

    if let Some(interval) = interval_seconds {
        if interval <= 0 {
            return Err(tool_err(
                ErrorCode::InvalidSchedule,
                format!("interval_seconds must be positive, got {}", interval),
            ));
        }
        let reference = reference_time.ok_or_else(|| {
            tool_err(
                ErrorCode::Determinism,
                "interval schedules require an explicit reference_time",
            )
        })?;
        let parsed = parse_ts(reference)?;
        let next = parsed + Duration::seconds(interval);
        return Ok(next.format(TS_FORMAT).to_string());
    }

    Err(tool_err(
        ErrorCode::InvalidSchedule,
        "schedule requires run_at or interval_seconds",
    ))
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            tool_err(
                ErrorCode::InvalidSchedule,
                format!("invalid timestamp '{}': {}", value, e),
            )
        })
}

/// Normalized task record: trimmed title, lowercased action, resolved
/// schedule. This is the exact shape hashed for dry-run identity and
/// stored on commit.
pub fn normalize_task(title: &str, action: &str, payload: &Value, next_run_at: &str) -> Value {
    json!({
        "title": title.trim(),
        "action": action.trim().to_lowercase(),
        "payload": payload,
        "schedule": { "next_run_at": next_run_at },
    })
}

/// UUIDv5 task id for dry-run mode.
pub fn dry_run_task_id(normalized: &Value) -> Uuid {
    let seed = hash_value(normalized);
    Uuid::new_v5(&TASK_NAMESPACE, seed.as_bytes())
}

/// UUIDv5 task id for commit mode.
pub fn commit_task_id(idempotency_key: &str) -> Uuid {
    Uuid::new_v5(&TASK_NAMESPACE, idempotency_key.as_bytes())
}

/// Plan or persist a task.
pub async fn schedule_task(
    conn: &mut SqliteConnection,
    req: &ScheduleRequest<'_>,
) -> Result<ScheduleOutcome> {
    let next_run_at = resolve_next_run_at(req.run_at, req.interval_seconds, req.reference_time)?;
    let normalized = normalize_task(req.title, req.action, req.payload, &next_run_at);

    if !req.commit {
        return Ok(ScheduleOutcome {
            task_id: dry_run_task_id(&normalized).to_string(),
            status: "planned".to_string(),
            next_run_at,
            task: normalized,
        });
    }

    let key = req.idempotency_key.ok_or_else(|| {
        tool_err(
            ErrorCode::IdempotencyRequired,
            "commit mode requires an idempotency_key",
        )
    })?;
    let task_id = commit_task_id(key).to_string();

    let existing = sqlx::query("SELECT payload_json, next_run_at FROM tasks WHERE task_id = ?")
        .bind(&task_id)
        .fetch_optional(&mut *conn)
        .await?;

    if let Some(row) = existing {
        let payload_json: String = row.get("payload_json");
        let stored: Value = serde_json::from_str(&payload_json).map_err(|e| {
            tool_err(
                ErrorCode::DataCorruption,
                format!("task {} has malformed stored payload: {}", task_id, e),
            )
        })?;
        return Ok(ScheduleOutcome {
            task_id,
            status: "idempotent_hit".to_string(),
            next_run_at: row.get("next_run_at"),
            task: stored,
        });
    }

    let title = req.title.trim();
    let action = req.action.trim().to_lowercase();
    sqlx::query(
        r#"
        INSERT INTO tasks (task_id, title, action, payload_json, status, next_run_at, idempotency_key, created_at)
        VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)
        "#,
    )
    .bind(&task_id)
    .bind(title)
    .bind(&action)
    .bind(canonical_json(&normalized))
    .bind(&next_run_at)
    .bind(key)
    .bind(EPOCH_ISO)
    .execute(&mut *conn)
    .await?;

    Ok(ScheduleOutcome {
        task_id,
        status: "scheduled".to_string(),
        next_run_at,
        task: normalized,
    })
}

/// Pending queue, ordered by `next_run_at` then task id.
pub async fn pending_tasks(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<TaskRow>> {
    let rows = sqlx::query(
        r#"
        SELECT task_id, title, action, status, next_run_at
        FROM tasks
        WHERE status = 'pending'
        ORDER BY next_run_at ASC, task_id ASC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .iter()
        .map(|r| TaskRow {
            task_id: r.get("task_id"),
            title: r.get("title"),
            action: r.get("action"),
            status: r.get("status"),
            next_run_at: r.get("next_run_at"),
        })
        .collect())
}

/// Record an execution attempt against a task. The run id is random; run
/// records are logs, not identities.
pub async fn record_task_run(
    conn: &mut SqliteConnection,
    task_id: &str,
    status: &str,
    result: Option<&Value>,
) -> Result<String> {
    let run_id = Uuid::new_v4().to_string();
    let result_hash = result.map(hash_value);
    let now = Utc::now().format(TS_FORMAT).to_string();

    sqlx::query(
        r#"
        INSERT INTO task_runs (run_id, task_id, status, result_hash, started_at, finished_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&run_id)
    .bind(task_id)
    .bind(status)
    .bind(result_hash)
    .bind(&now)
    .bind(if status == "started" { None } else { Some(now.clone()) })
    .execute(&mut *conn)
    .await?;

    Ok(run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{classify, ErrorCode};

    #[test]
    fn test_namespace_is_the_fixed_uuid() {
        assert_eq!(
            TASK_NAMESPACE.to_string(),
            "6ba7b810-9dad-11d1-80b4-00c04fd430c8"
        );
    }

    #[test]
    fn test_run_at_wins_over_interval() {
        let next = resolve_next_run_at(
            Some("2024-03-01T12:00:00Z"),
            Some(3600),
            Some("2024-03-01T00:00:00Z"),
        )
        .unwrap();
        assert_eq!(next, "2024-03-01T12:00:00.000Z");
    }

    #[test]
    fn test_interval_adds_to_reference_time() {
        let next =
            resolve_next_run_at(None, Some(90), Some("2024-03-01T00:00:00Z")).unwrap();
        assert_eq!(next, "2024-03-01T00:01:30.000Z");
    }

    #[test]
    fn test_interval_without_reference_is_nondeterministic() {
        let err = resolve_next_run_at(None, Some(60), None).unwrap_err();
        assert_eq!(classify(&err).0, ErrorCode::Determinism);
    }

    #[test]
    fn test_no_schedule_is_invalid() {
        let err = resolve_next_run_at(None, None, None).unwrap_err();
        assert_eq!(classify(&err).0, ErrorCode::InvalidSchedule);

        let err = resolve_next_run_at(None, Some(0), Some("2024-03-01T00:00:00Z")).unwrap_err();
        assert_eq!(classify(&err).0, ErrorCode::InvalidSchedule);

        let err = resolve_next_run_at(Some("not a time"), None, None).unwrap_err();
        assert_eq!(classify(&err).0, ErrorCode::InvalidSchedule);
    }

    #[test]
    fn test_normalization_trims_and_lowercases() {
        let normalized = normalize_task(
            "  Weekly report  ",
            "  Send-Email  ",
            &json!({"to": "ops"}),
            "2024-03-01T00:00:00.000Z",
        );
        assert_eq!(normalized["title"], "Weekly report");
        assert_eq!(normalized["action"], "send-email");
        assert_eq!(normalized["schedule"]["next_run_at"], "2024-03-01T00:00:00.000Z");
    }

    #[test]
    fn test_commit_task_id_is_uuidv5_of_key() {
        let id = commit_task_id("my-key");
        assert_eq!(id, Uuid::new_v5(&TASK_NAMESPACE, b"my-key"));
        // Stable across calls.
        assert_eq!(id, commit_task_id("my-key"));
        assert_ne!(id, commit_task_id("other-key"));
    }

    #[test]
    fn test_dry_run_id_tracks_normalized_content() {
        let a = normalize_task("T", "act", &json!({"x": 1}), "2024-01-01T00:00:00.000Z");
        let b = normalize_task(" T ", "ACT", &json!({"x": 1}), "2024-01-01T00:00:00.000Z");
        assert_eq!(dry_run_task_id(&a), dry_run_task_id(&b));

        let c = normalize_task("T", "act", &json!({"x": 2}), "2024-01-01T00:00:00.000Z");
        assert_ne!(dry_run_task_id(&a), dry_run_task_id(&c));
    }
}
