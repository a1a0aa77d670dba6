//! Content-addressed version DAG: blobs, trees, commits, refs.
//!
//! A tree is the canonical snapshot of the working `documents ⋈ chunks`
//! join, identified by the SHA-256 of its sorted entry list. A commit
//! binds a tree to an ordered parent list; its identity covers *only*
//! `{parents, tree_hash}`, so the same tree committed on the same parents
//! always reproduces the same hash — message and timestamp are recorded
//! but excluded. Refs are the only mutable pointers.
//!
//! All writes into the DAG tables are `INSERT OR IGNORE`: identity
//! collisions are proof of content equivalence, never conflicts.
//!
//! Checkout ([`materialize_tree`]) is the inverse of
//! [`create_tree_from_current_state`]: it rewrites the working tables from
//! a frozen tree, slicing chunk text back out of the stored document blobs
//! and rebuilding the working FTS index deterministically.

use anyhow::Result;
use serde_json::json;
use sqlx::{Row, SqliteConnection};

use crate::canon::{canonical_json, hash_value, sha256_hex};
use crate::errors::{tool_err, ErrorCode};
use crate::models::{DiffResult, MaterializeSummary, TreeEntry, TreeState, EPOCH_ISO};

/// Hash the working `documents ⋈ chunks` join into a tree shape without
/// persisting anything.
///
/// Rows are ordered `(doc_id ASC, chunk_id ASC)`; missing spans default to
/// `0` and the byte length of the chunk text.
pub async fn create_tree_from_current_state(conn: &mut SqliteConnection) -> Result<TreeState> {
    let rows = sqlx::query(
        r#"
        SELECT d.doc_id, d.content_hash AS doc_content_hash, d.title,
               c.chunk_id, c.content_hash AS chunk_content_hash,
               c.span_start, c.span_end, c.text
        FROM documents d
        JOIN chunks c ON c.doc_id = d.doc_id
        ORDER BY d.doc_id ASC, c.chunk_id ASC
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let entries: Vec<TreeEntry> = rows
        .iter()
        .map(|row| {
            let text: String = row.get("text");
            let span_start: Option<i64> = row.get("span_start");
            let span_end: Option<i64> = row.get("span_end");
            TreeEntry {
                doc_id: row.get("doc_id"),
                doc_content_hash: row.get("doc_content_hash"),
                title: row.get("title"),
                chunk_id: row.get("chunk_id"),
                chunk_content_hash: row.get("chunk_content_hash"),
                span_start: span_start.unwrap_or(0),
                span_end: span_end.unwrap_or(text.len() as i64),
            }
        })
        .collect();

    let entries_json = canonical_json(&serde_json::to_value(&entries)?);
    let tree_hash = sha256_hex(entries_json.as_bytes());

    Ok(TreeState {
        tree_hash,
        entries_json,
        row_count: entries.len() as i64,
    })
}

/// Idempotent insert of a tree row.
pub async fn save_tree(
    conn: &mut SqliteConnection,
    tree_hash: &str,
    entries_json: &str,
) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO trees (tree_hash, entries_json) VALUES (?, ?)")
        .bind(tree_hash)
        .bind(entries_json)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Freeze the working tables under `tree_hash`: write document bytes into
/// `blobs` and bind them via `tree_docs`/`tree_chunks`. Write-once.
pub async fn freeze_tree(conn: &mut SqliteConnection, tree_hash: &str) -> Result<()> {
    let docs = sqlx::query("SELECT doc_id, title, content_hash, body FROM documents ORDER BY doc_id ASC")
        .fetch_all(&mut *conn)
        .await?;

    for row in &docs {
        let body: String = row.get("body");
        let content_hash: String = row.get("content_hash");
        sqlx::query("INSERT OR IGNORE INTO blobs (content_hash, data) VALUES (?, ?)")
            .bind(&content_hash)
            .bind(body.as_bytes())
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            "INSERT OR IGNORE INTO tree_docs (tree_hash, doc_id, content_hash, title) VALUES (?, ?, ?, ?)",
        )
        .bind(tree_hash)
        .bind(row.get::<String, _>("doc_id"))
        .bind(&content_hash)
        .bind(row.get::<Option<String>, _>("title"))
        .execute(&mut *conn)
        .await?;
    }

    let chunks = sqlx::query(
        "SELECT chunk_id, doc_id, span_start, span_end, text, content_hash, chunker_id FROM chunks ORDER BY chunk_id ASC",
    )
    .fetch_all(&mut *conn)
    .await?;

    for row in &chunks {
        let text: String = row.get("text");
        let span_start: Option<i64> = row.get("span_start");
        let span_end: Option<i64> = row.get("span_end");
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO tree_chunks
                (tree_hash, chunk_id, doc_id, span_start, span_end, content_hash, chunker_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tree_hash)
        .bind(row.get::<String, _>("chunk_id"))
        .bind(row.get::<String, _>("doc_id"))
        .bind(span_start.unwrap_or(0))
        .bind(span_end.unwrap_or(text.len() as i64))
        .bind(row.get::<String, _>("content_hash"))
        .bind(row.get::<String, _>("chunker_id"))
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Commit identity: SHA-256 of canonical `{parents, tree_hash}`.
pub fn commit_identity(tree_hash: &str, parents: &[String]) -> String {
    hash_value(&json!({ "tree_hash": tree_hash, "parents": parents }))
}

/// Create a commit for `tree_hash` with an ordered parent list.
///
/// `created_at` is pinned to the epoch so replaying identical inserts into
/// a fresh database reproduces the commit byte for byte. Returns the
/// commit hash whether or not the row already existed.
pub async fn create_commit(
    conn: &mut SqliteConnection,
    tree_hash: &str,
    parents: &[String],
    message: &str,
) -> Result<String> {
    let commit_hash = commit_identity(tree_hash, parents);
    let parents_json = canonical_json(&json!(parents));

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO commits (commit_hash, tree_hash, parents_json, message, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&commit_hash)
    .bind(tree_hash)
    .bind(&parents_json)
    .bind(message)
    .bind(EPOCH_ISO)
    .execute(&mut *conn)
    .await?;

    Ok(commit_hash)
}

/// Point `ref_name` at `commit_hash`, creating or moving it.
pub async fn update_ref(
    conn: &mut SqliteConnection,
    ref_name: &str,
    commit_hash: &str,
) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM commits WHERE commit_hash = ?")
        .bind(commit_hash)
        .fetch_one(&mut *conn)
        .await?;
    if !exists {
        return Err(tool_err(
            ErrorCode::CommitNotFound,
            format!("cannot update ref '{}': unknown commit {}", ref_name, commit_hash),
        ));
    }

    sqlx::query(
        r#"
        INSERT INTO refs (ref_name, commit_hash) VALUES (?, ?)
        ON CONFLICT(ref_name) DO UPDATE SET commit_hash = excluded.commit_hash
        "#,
    )
    .bind(ref_name)
    .bind(commit_hash)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// True when `s` has the shape of a full lowercase SHA-256 hex digest.
pub fn is_full_hash(s: &str) -> bool {
    s.len() == 64
        && s.chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Resolve a ref name or full hash to a commit hash. Returns `None` for
/// anything that is neither a known ref nor hash-shaped.
pub async fn resolve_target(conn: &mut SqliteConnection, target: &str) -> Result<Option<String>> {
    let by_ref: Option<String> = sqlx::query_scalar("SELECT commit_hash FROM refs WHERE ref_name = ?")
        .bind(target)
        .fetch_optional(&mut *conn)
        .await?;

    if by_ref.is_some() {
        return Ok(by_ref);
    }
    if is_full_hash(target) {
        return Ok(Some(target.to_string()));
    }
    Ok(None)
}

/// Resolve `reference` all the way to `(commit_hash, tree_hash)`, raising
/// the precise taxonomy code for each missing link. A named ref whose
/// commit row has vanished is a mismatch, not a missing commit.
pub async fn resolve_ref_to_tree(
    conn: &mut SqliteConnection,
    reference: &str,
) -> Result<(String, String)> {
    let via_ref: Option<String> =
        sqlx::query_scalar("SELECT commit_hash FROM refs WHERE ref_name = ?")
            .bind(reference)
            .fetch_optional(&mut *conn)
            .await?;

    let commit_hash = match via_ref.clone() {
        Some(commit) => commit,
        None => resolve_target(&mut *conn, reference).await?.ok_or_else(|| {
            tool_err(
                ErrorCode::RefNotFound,
                format!("unknown ref or commit: {}", reference),
            )
        })?,
    };

    let tree_hash: Option<String> =
        sqlx::query_scalar("SELECT tree_hash FROM commits WHERE commit_hash = ?")
            .bind(&commit_hash)
            .fetch_optional(&mut *conn)
            .await?;

    let tree_hash = tree_hash.ok_or_else(|| {
        if via_ref.is_some() {
            tool_err(
                ErrorCode::RefMismatch,
                format!("ref {} points at unknown commit {}", reference, commit_hash),
            )
        } else {
            tool_err(
                ErrorCode::CommitNotFound,
                format!("commit not found: {}", commit_hash),
            )
        }
    })?;

    if tree_hash.is_empty() {
        return Err(tool_err(
            ErrorCode::TreeHashMissing,
            format!("commit {} has no tree hash", commit_hash),
        ));
    }

    let tree_exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM trees WHERE tree_hash = ?")
        .bind(&tree_hash)
        .fetch_one(&mut *conn)
        .await?;
    if !tree_exists {
        return Err(tool_err(
            ErrorCode::TreeNotFound,
            format!("tree not found: {}", tree_hash),
        ));
    }

    Ok((commit_hash, tree_hash))
}

/// Load and parse a tree's entry list.
pub async fn get_tree_entries(
    conn: &mut SqliteConnection,
    tree_hash: &str,
) -> Result<Vec<TreeEntry>> {
    let entries_json: Option<String> =
        sqlx::query_scalar("SELECT entries_json FROM trees WHERE tree_hash = ?")
            .bind(tree_hash)
            .fetch_optional(&mut *conn)
            .await?;

    let entries_json = entries_json.ok_or_else(|| {
        tool_err(
            ErrorCode::TreeNotFound,
            format!("tree not found: {}", tree_hash),
        )
    })?;

    if entries_json.trim().is_empty() {
        return Err(tool_err(
            ErrorCode::TreePayloadMissing,
            format!("tree {} has an empty entries payload", tree_hash),
        ));
    }

    serde_json::from_str::<Vec<TreeEntry>>(&entries_json).map_err(|e| {
        tool_err(
            ErrorCode::DataCorruption,
            format!("tree {} entries are not valid JSON: {}", tree_hash, e),
        )
    })
}

/// Checkout: rewrite the working tables from a frozen tree.
///
/// 1. Load and validate entries.
/// 2. Validate every referenced blob exists.
/// 3. Clear working tables in FK order.
/// 4. Reinsert documents (`updated_at = 0`) and chunks whose text is
///    sliced from the document blob at `[span_start, span_end)`.
/// 5. Rebuild the working `chunks_fts` deterministically (chunk_id order).
pub async fn materialize_tree(
    conn: &mut SqliteConnection,
    tree_hash: &str,
) -> Result<MaterializeSummary> {
    let entries = get_tree_entries(&mut *conn, tree_hash).await?;

    let doc_rows = sqlx::query(
        r#"
        SELECT td.doc_id, td.title, td.content_hash, b.data
        FROM tree_docs td
        LEFT JOIN blobs b ON b.content_hash = td.content_hash
        WHERE td.tree_hash = ?
        ORDER BY td.doc_id ASC
        "#,
    )
    .bind(tree_hash)
    .fetch_all(&mut *conn)
    .await?;

    let mut bodies: std::collections::HashMap<String, (String, String, Option<String>)> =
        std::collections::HashMap::new();
    for row in &doc_rows {
        let doc_id: String = row.get("doc_id");
        let content_hash: String = row.get("content_hash");
        let data: Option<Vec<u8>> = row.get("data");
        let data = data.ok_or_else(|| {
            tool_err(
                ErrorCode::BlobMissing,
                format!("blob {} for document {} is missing", content_hash, doc_id),
            )
        })?;
        let body = String::from_utf8(data).map_err(|_| {
            tool_err(
                ErrorCode::DataCorruption,
                format!("blob {} is not valid UTF-8", content_hash),
            )
        })?;
        bodies.insert(doc_id, (body, content_hash, row.get("title")));
    }

    for entry in &entries {
        if !bodies.contains_key(&entry.doc_id) {
            return Err(tool_err(
                ErrorCode::TreeDocsMissing,
                format!("tree {} has no tree_docs row for {}", tree_hash, entry.doc_id),
            ));
        }
    }

    let chunk_rows = sqlx::query(
        r#"
        SELECT chunk_id, doc_id, span_start, span_end, content_hash, chunker_id
        FROM tree_chunks
        WHERE tree_hash = ?
        ORDER BY chunk_id ASC
        "#,
    )
    .bind(tree_hash)
    .fetch_all(&mut *conn)
    .await?;

    if chunk_rows.is_empty() && !entries.is_empty() {
        return Err(tool_err(
            ErrorCode::TreeChunksMissing,
            format!("tree {} has no tree_chunks rows", tree_hash),
        ));
    }

    // FK order: chunks first, then documents; the working FTS mirrors chunks.
    sqlx::query("DELETE FROM chunks").execute(&mut *conn).await?;
    sqlx::query("DELETE FROM documents").execute(&mut *conn).await?;
    sqlx::query("DELETE FROM chunks_fts").execute(&mut *conn).await?;

    let mut doc_ids: Vec<&String> = bodies.keys().collect();
    doc_ids.sort();
    for doc_id in &doc_ids {
        let (body, content_hash, title) = &bodies[doc_id.as_str()];
        sqlx::query(
            "INSERT INTO documents (doc_id, title, content_hash, body, updated_at) VALUES (?, ?, ?, ?, 0)",
        )
        .bind(doc_id.as_str())
        .bind(title)
        .bind(content_hash)
        .bind(body)
        .execute(&mut *conn)
        .await?;
    }

    let mut chunk_count = 0i64;
    for row in &chunk_rows {
        let chunk_id: String = row.get("chunk_id");
        let doc_id: String = row.get("doc_id");
        let span_start: i64 = row.get("span_start");
        let span_end: i64 = row.get("span_end");
        let content_hash: String = row.get("content_hash");

        let (body, _, _) = bodies.get(&doc_id).ok_or_else(|| {
            tool_err(
                ErrorCode::TreeDocsMissing,
                format!("tree {} chunk {} references unknown document {}", tree_hash, chunk_id, doc_id),
            )
        })?;

        let text = body
            .get(span_start as usize..span_end as usize)
            .ok_or_else(|| {
                tool_err(
                    ErrorCode::DataCorruption,
                    format!(
                        "chunk {} span [{}, {}) does not address document {}",
                        chunk_id, span_start, span_end, doc_id
                    ),
                )
            })?;

        if sha256_hex(text.as_bytes()) != content_hash {
            return Err(tool_err(
                ErrorCode::DataCorruption,
                format!("chunk {} text does not match its content hash", chunk_id),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO chunks (chunk_id, doc_id, span_start, span_end, text, content_hash, chunker_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk_id)
        .bind(&doc_id)
        .bind(span_start)
        .bind(span_end)
        .bind(text)
        .bind(&content_hash)
        .bind(row.get::<String, _>("chunker_id"))
        .execute(&mut *conn)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, doc_id, text) VALUES (?, ?, ?)")
            .bind(&chunk_id)
            .bind(&doc_id)
            .bind(text)
            .execute(&mut *conn)
            .await?;

        chunk_count += 1;
    }

    Ok(MaterializeSummary {
        tree_hash: tree_hash.to_string(),
        documents: doc_ids.len() as i64,
        chunks: chunk_count,
    })
}

/// Document-level diff over two entry lists.
pub fn diff_entries(from: &[TreeEntry], to: &[TreeEntry]) -> DiffResult {
    use std::collections::BTreeMap;

    let doc_hashes = |entries: &[TreeEntry]| -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|e| (e.doc_id.clone(), e.doc_content_hash.clone()))
            .collect()
    };

    let from_docs = doc_hashes(from);
    let to_docs = doc_hashes(to);

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut changed = Vec::new();

    for (doc_id, hash) in &to_docs {
        match from_docs.get(doc_id) {
            None => added.push(doc_id.clone()),
            Some(old) if old != hash => changed.push(doc_id.clone()),
            Some(_) => {}
        }
    }
    for doc_id in from_docs.keys() {
        if !to_docs.contains_key(doc_id) {
            removed.push(doc_id.clone());
        }
    }

    DiffResult {
        added,
        removed,
        changed,
    }
}

/// Diff two stored trees by hash.
pub async fn diff_trees(
    conn: &mut SqliteConnection,
    from_tree: &str,
    to_tree: &str,
) -> Result<DiffResult> {
    let from = get_tree_entries(&mut *conn, from_tree).await?;
    let to = get_tree_entries(&mut *conn, to_tree).await?;
    Ok(diff_entries(&from, &to))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(doc_id: &str, doc_hash: &str, chunk_id: &str) -> TreeEntry {
        TreeEntry {
            doc_id: doc_id.to_string(),
            doc_content_hash: doc_hash.to_string(),
            title: None,
            chunk_id: chunk_id.to_string(),
            chunk_content_hash: format!("{}-chunk", doc_hash),
            span_start: 0,
            span_end: 1,
        }
    }

    #[test]
    fn test_commit_identity_ignores_message() {
        let parents = vec!["a".repeat(64)];
        let h1 = commit_identity("t1", &parents);
        let h2 = commit_identity("t1", &parents);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_commit_identity_depends_on_parent_order() {
        let p1 = vec!["a".repeat(64), "b".repeat(64)];
        let p2 = vec!["b".repeat(64), "a".repeat(64)];
        assert_ne!(commit_identity("t1", &p1), commit_identity("t1", &p2));
    }

    #[test]
    fn test_is_full_hash() {
        assert!(is_full_hash(&"0f".repeat(32)));
        assert!(!is_full_hash("HEAD"));
        assert!(!is_full_hash(&"0F".repeat(32)));
        assert!(!is_full_hash(&"0f".repeat(31)));
    }

    #[test]
    fn test_diff_added_removed_changed() {
        let from = vec![entry("A", "h1", "A:0-1"), entry("B", "h2", "B:0-1")];
        let to = vec![
            entry("A", "h1", "A:0-1"),
            entry("B", "h2x", "B:0-1"),
            entry("C", "h3", "C:0-1"),
        ];
        let diff = diff_entries(&from, &to);
        assert_eq!(diff.added, vec!["C"]);
        assert!(diff.removed.is_empty());
        assert_eq!(diff.changed, vec!["B"]);

        let back = diff_entries(&to, &from);
        assert_eq!(back.removed, vec!["C"]);
        assert_eq!(back.changed, vec!["B"]);
        assert!(back.added.is_empty());
    }

    #[test]
    fn test_diff_is_doc_level_not_chunk_level() {
        // Same doc hash but different chunking must not report a change.
        let from = vec![entry("A", "h1", "A:0-1")];
        let to = vec![entry("A", "h1", "A:0-2")];
        let diff = diff_entries(&from, &to);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert!(diff.changed.is_empty());
    }
}
