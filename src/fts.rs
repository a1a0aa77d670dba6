//! History-correct per-tree FTS builder, maintenance gate, and validator.
//!
//! The per-tree index is a pair of tables: `fts_chunks` holds the
//! materialized chunk text for a frozen tree, `fts_chunks_fts` is the
//! FTS5 inverted index mirroring it (external content). Outside a rebuild
//! both are read-only, enforced by SQL triggers guarded on the
//! `fts_maintenance` singleton:
//!
//! ```text
//!            UPDATE enabled=1                UPDATE enabled=0
//!  ┌────────┐ ───────────────▶ ┌──────────┐ ───────────────▶ ┌────────┐
//!  │ closed │                  │   open   │                  │ closed │
//!  └────────┘                  └──────────┘                  └────────┘
//!   INSERT/DELETE abort         mirror triggers copy          read-only
//!   UPDATE always aborts        fts_chunks → fts_chunks_fts
//! ```
//!
//! The gate transitions only via a transactional UPDATE of the singleton;
//! [`build_fts_tree`] opens it, runs the rebuild body, and closes it on
//! every exit path. `fts_chunks_fts` is a virtual table and cannot carry
//! triggers itself; it is written exclusively by the mirror triggers,
//! which can only fire once an insert has passed the gate.
//!
//! Rowids are deterministic: the low 63 bits of
//! `sha256("{tree_hash}:{chunk_id}:{attempt}")`, bumping `attempt` on
//! collision so identical trees always rebuild to identical rowids.

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use sha2::Digest;
use sqlx::{Row, SqliteConnection, SqlitePool};
use unicode_normalization::UnicodeNormalization;

use crate::canon::{canonical_json, hash_value, sha256_hex};
use crate::dag;
use crate::errors::{tool_err, ErrorCode};
use crate::models::{ARTIFACT_KIND_FTS, EPOCH_ISO, REF_HEAD, REF_MAIN};

/// Gate and mirror triggers, in creation order. Single source of truth:
/// migrations execute these, [`validate_fts`] attests them.
pub(crate) const GATE_TRIGGERS: [(&str, &str); 7] = [
    (
        "fts_chunks_gate_insert",
        r#"
        CREATE TRIGGER IF NOT EXISTS fts_chunks_gate_insert
        BEFORE INSERT ON fts_chunks
        WHEN COALESCE((SELECT enabled FROM fts_maintenance WHERE id = 1), 0) = 0
        BEGIN
            SELECT RAISE(ABORT, 'fts_chunks is frozen: maintenance gate is closed');
        END
        "#,
    ),
    (
        "fts_chunks_gate_delete",
        r#"
        CREATE TRIGGER IF NOT EXISTS fts_chunks_gate_delete
        BEFORE DELETE ON fts_chunks
        WHEN COALESCE((SELECT enabled FROM fts_maintenance WHERE id = 1), 0) = 0
        BEGIN
            SELECT RAISE(ABORT, 'fts_chunks is frozen: maintenance gate is closed');
        END
        "#,
    ),
    (
        "fts_chunks_no_update",
        r#"
        CREATE TRIGGER IF NOT EXISTS fts_chunks_no_update
        BEFORE UPDATE ON fts_chunks
        BEGIN
            SELECT RAISE(ABORT, 'fts_chunks rows are immutable');
        END
        "#,
    ),
    (
        "fts_chunks_mirror_insert",
        r#"
        CREATE TRIGGER IF NOT EXISTS fts_chunks_mirror_insert
        AFTER INSERT ON fts_chunks
        BEGIN
            INSERT INTO fts_chunks_fts(rowid, text) VALUES (new.id, new.text);
        END
        "#,
    ),
    (
        "fts_chunks_mirror_delete",
        r#"
        CREATE TRIGGER IF NOT EXISTS fts_chunks_mirror_delete
        AFTER DELETE ON fts_chunks
        BEGIN
            INSERT INTO fts_chunks_fts(fts_chunks_fts, rowid, text)
            VALUES ('delete', old.id, old.text);
        END
        "#,
    ),
    (
        "fts_maintenance_gate_insert",
        r#"
        CREATE TRIGGER IF NOT EXISTS fts_maintenance_gate_insert
        BEFORE INSERT ON fts_maintenance
        WHEN EXISTS (SELECT 1 FROM fts_maintenance)
        BEGIN
            SELECT RAISE(ABORT, 'fts_maintenance is a singleton');
        END
        "#,
    ),
    (
        "fts_maintenance_gate_delete",
        r#"
        CREATE TRIGGER IF NOT EXISTS fts_maintenance_gate_delete
        BEFORE DELETE ON fts_maintenance
        BEGIN
            SELECT RAISE(ABORT, 'fts_maintenance rows cannot be deleted');
        END
        "#,
    ),
];

/// Logical predicate each trigger must retain, matched against
/// schema-normalized SQL in [`validate_fts`].
const TRIGGER_PREDICATES: [(&str, &str); 7] = [
    (
        "fts_chunks_gate_insert",
        "when coalesce((select enabled from fts_maintenance where id = 1), 0) = 0",
    ),
    (
        "fts_chunks_gate_delete",
        "when coalesce((select enabled from fts_maintenance where id = 1), 0) = 0",
    ),
    ("fts_chunks_no_update", "before update on fts_chunks"),
    (
        "fts_chunks_mirror_insert",
        "insert into fts_chunks_fts(rowid, text) values (new.id, new.text)",
    ),
    (
        "fts_chunks_mirror_delete",
        "values ('delete', old.id, old.text)",
    ),
    (
        "fts_maintenance_gate_insert",
        "when exists (select 1 from fts_maintenance)",
    ),
    ("fts_maintenance_gate_delete", "before delete on fts_maintenance"),
];

/// Report returned by [`build_fts_tree`].
#[derive(Debug, Clone, Serialize)]
pub struct FtsBuildReport {
    /// `"built"` or `"skipped"` (idempotent re-run).
    pub status: String,
    pub artifact_id: String,
    pub payload_hash: String,
    pub tree_hash: String,
    pub commit_hash: String,
    pub chunk_count: i64,
}

/// One named check inside a validation report.
#[derive(Debug, Clone, Serialize)]
pub struct FtsCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

/// Report returned by [`validate_fts`].
#[derive(Debug, Clone, Serialize)]
pub struct FtsValidateReport {
    pub ok: bool,
    pub tree_hash: String,
    /// SHA-256 over the sorted `(schema item, sha256(sql))` tuples of
    /// everything that touches the FTS tables.
    pub bundle_hash: String,
    pub checks: Vec<FtsCheck>,
}

/// Open the maintenance gate. Fails with `ERR_GATE_MISSING` when the
/// singleton row is absent.
pub async fn open_gate(conn: &mut SqliteConnection) -> Result<()> {
    set_gate(conn, 1).await
}

/// Close the maintenance gate.
pub async fn close_gate(conn: &mut SqliteConnection) -> Result<()> {
    set_gate(conn, 0).await
}

async fn set_gate(conn: &mut SqliteConnection, enabled: i64) -> Result<()> {
    let result = sqlx::query("UPDATE fts_maintenance SET enabled = ? WHERE id = 1")
        .bind(enabled)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(tool_err(
            ErrorCode::GateMissing,
            "fts_maintenance singleton row is missing",
        ));
    }
    Ok(())
}

/// Deterministic 63-bit rowid for a `(tree, chunk)` pair at a given
/// collision-resolution attempt.
pub fn derive_rowid(tree_hash: &str, chunk_id: &str, attempt: u32) -> i64 {
    let digest = sha2::Sha256::digest(format!("{}:{}:{}", tree_hash, chunk_id, attempt).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) & 0x7fff_ffff_ffff_ffff) as i64
}

/// Hash of the sorted `[{chunk_id, content_hash}]` payload listing.
pub fn payload_hash_of(pairs: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = pairs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let listing: Vec<serde_json::Value> = sorted
        .iter()
        .map(|(chunk_id, content_hash)| json!({ "chunk_id": chunk_id, "content_hash": content_hash }))
        .collect();
    hash_value(&json!(listing))
}

async fn tree_payload_pairs(
    conn: &mut SqliteConnection,
    table: &str,
    tree_hash: &str,
) -> Result<Vec<(String, String)>> {
    // `table` is one of two fixed identifiers, never user input.
    let sql = format!(
        "SELECT chunk_id, content_hash FROM {} WHERE tree_hash = ? ORDER BY chunk_id ASC",
        table
    );
    let rows = sqlx::query(&sql).bind(tree_hash).fetch_all(&mut *conn).await?;
    Ok(rows
        .iter()
        .map(|r| (r.get("chunk_id"), r.get("content_hash")))
        .collect())
}

/// Build (or verify) the per-tree FTS artifact for `reference`.
///
/// The whole operation runs in one transaction: resolution, idempotency
/// and preflight checks, gate open, rebuild, completeness checks, artifact
/// registration, gate close. On any failure the gate close is attempted
/// and the primary error surfaces; the transaction rollback discards any
/// partial rebuild.
pub async fn build_fts_tree(
    pool: &SqlitePool,
    reference: &str,
    force_rebuild: bool,
) -> Result<FtsBuildReport> {
    let mut tx = pool.begin().await?;

    let (commit_hash, tree_hash) = dag::resolve_ref_to_tree(&mut tx, reference).await?;

    let frozen_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tree_chunks WHERE tree_hash = ?")
        .bind(&tree_hash)
        .fetch_one(&mut *tx)
        .await?;
    if frozen_count == 0 {
        return Err(tool_err(
            ErrorCode::NotFrozen,
            format!("tree {} has no frozen tree_chunks rows", tree_hash),
        ));
    }

    // Idempotency: an existing artifact must still describe the stored
    // fts_chunks rows exactly.
    let existing = sqlx::query(
        "SELECT artifact_id, payload_hash FROM index_artifacts WHERE tree_hash = ? AND kind = ?",
    )
    .bind(&tree_hash)
    .bind(ARTIFACT_KIND_FTS)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(row) = existing {
        let artifact_id: String = row.get("artifact_id");
        let stored_payload: String = row.get("payload_hash");
        let current = tree_payload_pairs(&mut tx, "fts_chunks", &tree_hash).await?;
        let current_hash = payload_hash_of(&current);
        if current_hash == stored_payload {
            return Ok(FtsBuildReport {
                status: "skipped".to_string(),
                artifact_id,
                payload_hash: stored_payload,
                tree_hash,
                commit_hash,
                chunk_count: current.len() as i64,
            });
        }
        return Err(tool_err(
            ErrorCode::ArtifactDrift,
            format!(
                "fts artifact for tree {} no longer matches its indexed rows (stored {}, recomputed {})",
                tree_hash, stored_payload, current_hash
            ),
        ));
    }

    // Preflight: leftover rows without an artifact are suspect.
    let leftover: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fts_chunks WHERE tree_hash = ?")
        .bind(&tree_hash)
        .fetch_one(&mut *tx)
        .await?;
    if leftover > 0 && !force_rebuild {
        return Err(tool_err(
            ErrorCode::DirtyState,
            format!(
                "tree {} has {} fts_chunks rows but no registered artifact; pass force_rebuild to reset",
                tree_hash, leftover
            ),
        ));
    }

    open_gate(&mut tx).await?;

    let body = rebuild_tree_index(&mut tx, &tree_hash, force_rebuild).await;

    match body {
        Ok((payload_hash, chunk_count)) => {
            let manifest = json!({
                "kind": ARTIFACT_KIND_FTS,
                "tokenizer": "unicode61",
                "tree_hash": tree_hash,
                "payload_hash": payload_hash,
                "chunk_count": chunk_count,
                "rowid_strategy": "sha256-low63",
                "fts_sync": "external-content-triggers",
            });
            let artifact_id = hash_value(&json!({ "manifest": manifest, "payload_hash": payload_hash }));

            upsert_artifact(
                &mut tx,
                &artifact_id,
                &tree_hash,
                ARTIFACT_KIND_FTS,
                None,
                &payload_hash,
                &canonical_json(&manifest),
                chunk_count,
            )
            .await?;
            upsert_artifact_refs(&mut tx, reference, &commit_hash, ARTIFACT_KIND_FTS, &artifact_id)
                .await?;

            if let Err(e) = close_gate(&mut tx).await {
                tracing::warn!("failed to close fts maintenance gate after build: {}", e);
            }
            tx.commit().await?;

            Ok(FtsBuildReport {
                status: "built".to_string(),
                artifact_id,
                payload_hash,
                tree_hash,
                commit_hash,
                chunk_count,
            })
        }
        Err(e) => {
            // Attempt to close, then surface the primary error; the
            // rollback below discards partial rows either way.
            let _ = close_gate(&mut tx).await;
            let _ = tx.rollback().await;
            // Untyped failures inside the rebuild body are build failures.
            if e.downcast_ref::<crate::errors::ToolError>().is_none() {
                return Err(tool_err(
                    ErrorCode::BuildFailed,
                    format!("fts rebuild failed: {}", e),
                ));
            }
            Err(e)
        }
    }
}

/// Gate-open rebuild body: reconstruct every chunk from blobs, verify its
/// hash, insert it under a deterministic rowid, and prove completeness.
async fn rebuild_tree_index(
    conn: &mut SqliteConnection,
    tree_hash: &str,
    force_rebuild: bool,
) -> Result<(String, i64)> {
    if force_rebuild {
        sqlx::query("DELETE FROM fts_chunks WHERE tree_hash = ?")
            .bind(tree_hash)
            .execute(&mut *conn)
            .await?;
    }

    let rows = sqlx::query(
        r#"
        SELECT tc.chunk_id, tc.span_start, tc.span_end, tc.content_hash, b.data
        FROM tree_chunks tc
        JOIN tree_docs td ON td.tree_hash = tc.tree_hash AND td.doc_id = tc.doc_id
        JOIN blobs b ON b.content_hash = td.content_hash
        WHERE tc.tree_hash = ?
        ORDER BY tc.chunk_id ASC
        "#,
    )
    .bind(tree_hash)
    .fetch_all(&mut *conn)
    .await?;

    for row in &rows {
        let chunk_id: String = row.get("chunk_id");
        let span_start: i64 = row.get("span_start");
        let span_end: i64 = row.get("span_end");
        let expected_hash: String = row.get("content_hash");
        let data: Vec<u8> = row.get("data");

        let doc_text = String::from_utf8(data).map_err(|_| {
            tool_err(
                ErrorCode::DataCorruption,
                format!("document blob behind chunk {} is not valid UTF-8", chunk_id),
            )
        })?;
        let normalized: String = doc_text.nfkc().collect();
        let chunk_text = normalized
            .get(span_start as usize..span_end as usize)
            .ok_or_else(|| {
                tool_err(
                    ErrorCode::DataCorruption,
                    format!(
                        "chunk {} span [{}, {}) does not address its normalized document",
                        chunk_id, span_start, span_end
                    ),
                )
            })?;

        if sha256_hex(chunk_text.as_bytes()) != expected_hash {
            return Err(tool_err(
                ErrorCode::DataCorruption,
                format!("chunk {} reconstruction does not match its content hash", chunk_id),
            ));
        }

        insert_fts_chunk(&mut *conn, tree_hash, &chunk_id, &expected_hash, chunk_text).await?;
    }

    // Bidirectional completeness between the frozen tree and the index.
    let missing: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM tree_chunks tc
        LEFT JOIN fts_chunks f ON f.tree_hash = tc.tree_hash AND f.chunk_id = tc.chunk_id
        WHERE tc.tree_hash = ? AND f.chunk_id IS NULL
        "#,
    )
    .bind(tree_hash)
    .fetch_one(&mut *conn)
    .await?;
    if missing > 0 {
        return Err(tool_err(
            ErrorCode::FtsIncomplete,
            format!("{} tree chunks are missing from fts_chunks", missing),
        ));
    }

    let extra: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM fts_chunks f
        LEFT JOIN tree_chunks tc ON tc.tree_hash = f.tree_hash AND tc.chunk_id = f.chunk_id
        WHERE f.tree_hash = ? AND tc.chunk_id IS NULL
        "#,
    )
    .bind(tree_hash)
    .fetch_one(&mut *conn)
    .await?;
    if extra > 0 {
        return Err(tool_err(
            ErrorCode::FtsExtraRows,
            format!("{} fts_chunks rows have no matching tree chunk", extra),
        ));
    }

    let pairs = tree_payload_pairs(&mut *conn, "fts_chunks", tree_hash).await?;
    Ok((payload_hash_of(&pairs), pairs.len() as i64))
}

/// Insert one chunk under a deterministic rowid, bumping the attempt
/// counter (at most 10 times) on collision with a different pair.
async fn insert_fts_chunk(
    conn: &mut SqliteConnection,
    tree_hash: &str,
    chunk_id: &str,
    content_hash: &str,
    text: &str,
) -> Result<()> {
    let already = sqlx::query("SELECT content_hash FROM fts_chunks WHERE tree_hash = ? AND chunk_id = ?")
        .bind(tree_hash)
        .bind(chunk_id)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(row) = already {
        let stored: String = row.get("content_hash");
        if stored == content_hash {
            return Ok(());
        }
        return Err(tool_err(
            ErrorCode::DataCorruption,
            format!("fts_chunks already holds chunk {} with a different content hash", chunk_id),
        ));
    }

    for attempt in 0..10u32 {
        let rowid = derive_rowid(tree_hash, chunk_id, attempt);
        let occupant = sqlx::query("SELECT tree_hash, chunk_id FROM fts_chunks WHERE id = ?")
            .bind(rowid)
            .fetch_optional(&mut *conn)
            .await?;

        match occupant {
            None => {
                sqlx::query(
                    "INSERT INTO fts_chunks (id, tree_hash, chunk_id, content_hash, text) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(rowid)
                .bind(tree_hash)
                .bind(chunk_id)
                .bind(content_hash)
                .bind(text)
                .execute(&mut *conn)
                .await?;
                return Ok(());
            }
            Some(row) => {
                let t: String = row.get("tree_hash");
                let c: String = row.get("chunk_id");
                if t == tree_hash && c == chunk_id {
                    return Ok(());
                }
                // Different pair owns this rowid; bump the attempt.
            }
        }
    }

    Err(tool_err(
        ErrorCode::RowidCollision,
        format!("no free rowid for chunk {} after 10 attempts", chunk_id),
    ))
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn upsert_artifact(
    conn: &mut SqliteConnection,
    artifact_id: &str,
    tree_hash: &str,
    kind: &str,
    model_id: Option<&str>,
    payload_hash: &str,
    manifest_json: &str,
    chunk_count: i64,
) -> Result<()> {
    // OR REPLACE covers both the primary key and the (tree, kind, model)
    // scope index; dependent artifact_refs cascade and are re-upserted by
    // the caller.
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO index_artifacts
            (artifact_id, tree_hash, kind, model_id, payload_hash, manifest_json, chunk_count, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(artifact_id)
    .bind(tree_hash)
    .bind(kind)
    .bind(model_id)
    .bind(payload_hash)
    .bind(manifest_json)
    .bind(chunk_count)
    .bind(EPOCH_ISO)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Anchor an artifact to its commit, and to the ref itself when the build
/// was addressed through `HEAD` or `main`.
pub(crate) async fn upsert_artifact_refs(
    conn: &mut SqliteConnection,
    reference: &str,
    commit_hash: &str,
    kind: &str,
    artifact_id: &str,
) -> Result<()> {
    upsert_artifact_ref(&mut *conn, "commit", commit_hash, kind, artifact_id).await?;
    if reference == REF_HEAD || reference == REF_MAIN {
        upsert_artifact_ref(&mut *conn, "ref", reference, kind, artifact_id).await?;
    }
    Ok(())
}

async fn upsert_artifact_ref(
    conn: &mut SqliteConnection,
    ref_type: &str,
    ref_name: &str,
    kind: &str,
    artifact_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO artifact_refs (ref_type, ref_name, kind, artifact_id)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(ref_type, ref_name, kind) DO UPDATE SET artifact_id = excluded.artifact_id
        "#,
    )
    .bind(ref_type)
    .bind(ref_name)
    .bind(kind)
    .bind(artifact_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Collapse SQL to a comparable form: lowercase, single spaces.
pub fn normalize_sql(sql: &str) -> String {
    sql.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Attest the gate machinery and the index for `reference`'s tree.
///
/// Produces a report rather than an error for failed attestations; only
/// resolution and I/O problems raise.
pub async fn validate_fts(pool: &SqlitePool, reference: &str, deep: bool) -> Result<FtsValidateReport> {
    let mut conn = pool.acquire().await?;
    let (_, tree_hash) = dag::resolve_ref_to_tree(&mut conn, reference).await?;

    let mut checks: Vec<FtsCheck> = Vec::new();

    // Gate closed, singleton intact.
    let gate_rows = sqlx::query("SELECT id, enabled FROM fts_maintenance")
        .fetch_all(&mut *conn)
        .await?;
    let singleton_ok = gate_rows.len() == 1 && gate_rows[0].get::<i64, _>("id") == 1;
    checks.push(FtsCheck {
        name: "gate_singleton".to_string(),
        ok: singleton_ok,
        detail: format!("{} fts_maintenance rows", gate_rows.len()),
    });
    let closed = gate_rows
        .first()
        .map(|r| r.get::<i64, _>("enabled") == 0)
        .unwrap_or(false);
    checks.push(FtsCheck {
        name: "gate_closed".to_string(),
        ok: closed,
        detail: if closed { "enabled = 0".to_string() } else { "gate is open or missing".to_string() },
    });

    // Trigger attestation by schema-normalized SQL.
    let trigger_rows = sqlx::query("SELECT name, sql FROM sqlite_master WHERE type = 'trigger' AND sql IS NOT NULL")
        .fetch_all(&mut *conn)
        .await?;
    let mut present: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    for row in &trigger_rows {
        present.insert(row.get("name"), normalize_sql(&row.get::<String, _>("sql")));
    }

    for (name, predicate) in TRIGGER_PREDICATES {
        let ok = present
            .get(name)
            .map(|sql| sql.contains(predicate))
            .unwrap_or(false);
        checks.push(FtsCheck {
            name: format!("trigger:{}", name),
            ok,
            detail: if ok {
                "predicate intact".to_string()
            } else {
                "missing or altered".to_string()
            },
        });
    }

    let expected_names: std::collections::HashSet<&str> =
        TRIGGER_PREDICATES.iter().map(|(n, _)| *n).collect();
    let unexpected: Vec<String> = present
        .iter()
        .filter(|(name, sql)| {
            !expected_names.contains(name.as_str())
                && (sql.contains("fts_chunks") || sql.contains("fts_maintenance"))
        })
        .map(|(name, _)| name.clone())
        .collect();
    checks.push(FtsCheck {
        name: "no_unexpected_triggers".to_string(),
        ok: unexpected.is_empty(),
        detail: if unexpected.is_empty() {
            "none".to_string()
        } else {
            unexpected.join(", ")
        },
    });

    // Count parity for the target tree.
    let tree_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tree_chunks WHERE tree_hash = ?")
        .bind(&tree_hash)
        .fetch_one(&mut *conn)
        .await?;
    let fts_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fts_chunks WHERE tree_hash = ?")
        .bind(&tree_hash)
        .fetch_one(&mut *conn)
        .await?;
    checks.push(FtsCheck {
        name: "count_parity".to_string(),
        ok: tree_count == fts_count,
        detail: format!("tree_chunks = {}, fts_chunks = {}", tree_count, fts_count),
    });

    // Canary: a term from a stored chunk must retrieve it.
    let canary = sqlx::query(
        "SELECT id, chunk_id, text FROM fts_chunks WHERE tree_hash = ? ORDER BY chunk_id ASC LIMIT 1",
    )
    .bind(&tree_hash)
    .fetch_optional(&mut *conn)
    .await?;
    match canary {
        Some(row) => {
            let rowid: i64 = row.get("id");
            let text: String = row.get("text");
            match canary_term(&text) {
                Some(term) => {
                    let hits: i64 = sqlx::query_scalar(
                        "SELECT COUNT(*) FROM fts_chunks_fts WHERE fts_chunks_fts MATCH ? AND rowid = ?",
                    )
                    .bind(format!("\"{}\"", term))
                    .bind(rowid)
                    .fetch_one(&mut *conn)
                    .await?;
                    checks.push(FtsCheck {
                        name: "canary_term".to_string(),
                        ok: hits > 0,
                        detail: format!("term '{}' → {} hit(s)", term, hits),
                    });
                }
                None => checks.push(FtsCheck {
                    name: "canary_term".to_string(),
                    ok: true,
                    detail: "no indexable term in first chunk".to_string(),
                }),
            }
        }
        None => checks.push(FtsCheck {
            name: "canary_term".to_string(),
            ok: tree_count == 0,
            detail: "no indexed chunks for tree".to_string(),
        }),
    }

    // Deep audit: FTS5's own index-vs-content verification catches ghost
    // and missing rowid pairs.
    if deep {
        let integrity =
            sqlx::query("INSERT INTO fts_chunks_fts(fts_chunks_fts) VALUES ('integrity-check')")
                .execute(&mut *conn)
                .await;
        checks.push(FtsCheck {
            name: "deep_rowid_audit".to_string(),
            ok: integrity.is_ok(),
            detail: match integrity {
                Ok(_) => "index matches content".to_string(),
                Err(e) => format!("integrity-check failed: {}", e),
            },
        });
    }

    // Stable bundle hash over everything that defines the FTS machinery.
    let schema_rows = sqlx::query("SELECT name, sql FROM sqlite_master WHERE sql IS NOT NULL")
        .fetch_all(&mut *conn)
        .await?;
    let mut bundle: Vec<(String, String)> = schema_rows
        .iter()
        .filter_map(|row| {
            let name: String = row.get("name");
            let sql: String = row.get("sql");
            let normalized = normalize_sql(&sql);
            if normalized.contains("fts_chunks") || normalized.contains("fts_maintenance") {
                Some((name, sha256_hex(normalized.as_bytes())))
            } else {
                None
            }
        })
        .collect();
    bundle.sort();
    let bundle_listing: Vec<serde_json::Value> = bundle
        .iter()
        .map(|(name, sql_hash)| json!({ "name": name, "sql_hash": sql_hash }))
        .collect();
    let bundle_hash = hash_value(&json!(bundle_listing));

    let ok = checks.iter().all(|c| c.ok);
    Ok(FtsValidateReport {
        ok,
        tree_hash,
        bundle_hash,
        checks,
    })
}

/// First token of at least three alphanumeric characters, lowercased.
fn canary_term(text: &str) -> Option<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .find(|t| t.chars().count() >= 3)
        .map(|t| t.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_rowid_deterministic_and_positive() {
        let a = derive_rowid("t1", "c1", 0);
        let b = derive_rowid("t1", "c1", 0);
        assert_eq!(a, b);
        assert!(a >= 0);
        assert_ne!(a, derive_rowid("t1", "c1", 1));
        assert_ne!(a, derive_rowid("t1", "c2", 0));
    }

    #[test]
    fn test_payload_hash_sorted_by_chunk_id() {
        let forward = vec![
            ("a".to_string(), "h1".to_string()),
            ("b".to_string(), "h2".to_string()),
        ];
        let backward = vec![
            ("b".to_string(), "h2".to_string()),
            ("a".to_string(), "h1".to_string()),
        ];
        assert_eq!(payload_hash_of(&forward), payload_hash_of(&backward));
        let changed = vec![
            ("a".to_string(), "h1x".to_string()),
            ("b".to_string(), "h2".to_string()),
        ];
        assert_ne!(payload_hash_of(&forward), payload_hash_of(&changed));
    }

    #[test]
    fn test_normalize_sql_collapses_shape() {
        let a = "CREATE TRIGGER  x\n  BEFORE INSERT ON t\nBEGIN SELECT 1; END";
        let b = "create trigger x before insert on t begin select 1; end";
        assert_eq!(normalize_sql(a), normalize_sql(b));
    }

    #[test]
    fn test_trigger_predicates_match_their_ddl() {
        // The attestation fragments must actually appear in the DDL we ship.
        for ((name, ddl), (pname, predicate)) in GATE_TRIGGERS.iter().zip(TRIGGER_PREDICATES.iter()) {
            assert_eq!(name, pname);
            assert!(
                normalize_sql(ddl).contains(predicate),
                "predicate for {} not found in its DDL",
                name
            );
        }
    }

    #[test]
    fn test_canary_term() {
        assert_eq!(canary_term("the quick fox"), Some("the".to_string()));
        assert_eq!(canary_term("a b canary"), Some("canary".to_string()));
        assert_eq!(canary_term("a b"), None);
    }
}
