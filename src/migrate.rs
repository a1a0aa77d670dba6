//! Database schema migrations.
//!
//! Creates all required tables, indexes, virtual tables, and triggers, and
//! ensures idempotent execution. Designed to be run via `idx init`.
//!
//! # Schema
//!
//! ```text
//! working state              version DAG                 derived artifacts
//! ┌──────────────┐     ┌──────────────┐           ┌─────────────────┐
//! │  documents   │     │    blobs     │◀──┐       │ index_artifacts │
//! │  chunks      │     │    trees     │   │       │ artifact_refs   │
//! │  chunks_fts  │     │  tree_docs   │───┘       │ chunk_embeddings│
//! └──────────────┘     │  tree_chunks │           ├─────────────────┤
//!                      │   commits    │           │ fts_chunks      │
//! ┌──────────────┐     │    refs      │           │ fts_chunks_fts  │
//! │ tasks        │     └──────────────┘           │ fts_maintenance │
//! │ task_runs    │                                └─────────────────┘
//! │ audit_log    │
//! └──────────────┘
//! ```
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `documents` / `chunks` | Mutable working tree, rewritten on checkout |
//! | `chunks_fts` | FTS5 index over working chunk text (BM25) |
//! | `blobs` | Content-addressed document bytes, write-once |
//! | `trees` / `tree_docs` / `tree_chunks` | Immutable snapshots |
//! | `commits` / `refs` | Version DAG and mutable pointers |
//! | `fts_chunks` / `fts_chunks_fts` | Per-tree history-correct FTS |
//! | `fts_maintenance` | Singleton maintenance gate for the above |
//! | `index_artifacts` / `artifact_refs` | Derived-artifact registry |
//! | `chunk_embeddings` | Per-(tree, chunk, model) float32 vectors |
//! | `tasks` / `task_runs` | Durable scheduler records |
//! | `audit_log` | Last-written envelope per request id |
//!
//! # Idempotency
//!
//! All statements use `IF NOT EXISTS` or check `sqlite_master` first.
//! Running `idx init` multiple times is safe. The `fts_maintenance`
//! singleton is seeded closed (`enabled = 0`) exactly once; its gate
//! triggers reject any later insert or delete.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::fts;

/// Run all database migrations.
///
/// # Errors
///
/// Returns an error if any DDL statement fails. Statements run in
/// dependency order, so a partial failure leaves a prefix of the schema
/// in place; re-running completes it.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Working tables
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            doc_id TEXT PRIMARY KEY,
            title TEXT,
            content_hash TEXT NOT NULL,
            body TEXT NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            span_start INTEGER,
            span_end INTEGER,
            text TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            chunker_id TEXT NOT NULL DEFAULT 'paragraph-v1',
            FOREIGN KEY (doc_id) REFERENCES documents(doc_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Working FTS5 index (not idempotent natively, check first)
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                doc_id UNINDEXED,
                text,
                tokenize='unicode61'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Content-addressed DAG
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blobs (
            content_hash TEXT PRIMARY KEY,
            data BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trees (
            tree_hash TEXT PRIMARY KEY,
            entries_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tree_docs (
            tree_hash TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            title TEXT,
            PRIMARY KEY (tree_hash, doc_id),
            FOREIGN KEY (tree_hash) REFERENCES trees(tree_hash),
            FOREIGN KEY (content_hash) REFERENCES blobs(content_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tree_chunks (
            tree_hash TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            span_start INTEGER NOT NULL,
            span_end INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            chunker_id TEXT NOT NULL,
            PRIMARY KEY (tree_hash, chunk_id),
            FOREIGN KEY (tree_hash) REFERENCES trees(tree_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS commits (
            commit_hash TEXT PRIMARY KEY,
            tree_hash TEXT NOT NULL,
            parents_json TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            FOREIGN KEY (tree_hash) REFERENCES trees(tree_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS refs (
            ref_name TEXT PRIMARY KEY,
            commit_hash TEXT NOT NULL,
            FOREIGN KEY (commit_hash) REFERENCES commits(commit_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // History-correct FTS: content table, inverted-index mirror, gate
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fts_chunks (
            id INTEGER PRIMARY KEY,
            tree_hash TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            text TEXT NOT NULL,
            UNIQUE (tree_hash, chunk_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    let tree_fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='fts_chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !tree_fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE fts_chunks_fts USING fts5(
                text,
                content='fts_chunks',
                content_rowid='id',
                tokenize='unicode61'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fts_maintenance (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            enabled INTEGER NOT NULL DEFAULT 0 CHECK (enabled IN (0, 1))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Gate + mirror triggers (single source of truth in the fts module)
    for (_, ddl) in fts::GATE_TRIGGERS {
        sqlx::query(ddl).execute(pool).await?;
    }

    // Seed the singleton closed, exactly once. The gate trigger rejects
    // inserts while a row exists, so check before inserting.
    let gate_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fts_maintenance")
        .fetch_one(pool)
        .await?;
    if gate_rows == 0 {
        sqlx::query("INSERT INTO fts_maintenance (id, enabled) VALUES (1, 0)")
            .execute(pool)
            .await?;
    }

    // Derived-artifact registry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_artifacts (
            artifact_id TEXT PRIMARY KEY,
            tree_hash TEXT NOT NULL,
            kind TEXT NOT NULL,
            model_id TEXT,
            payload_hash TEXT NOT NULL,
            manifest_json TEXT NOT NULL,
            chunk_count INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_index_artifacts_scope
        ON index_artifacts (tree_hash, kind, COALESCE(model_id, ''))
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifact_refs (
            ref_type TEXT NOT NULL CHECK (ref_type IN ('ref', 'commit', 'tree')),
            ref_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            artifact_id TEXT NOT NULL,
            PRIMARY KEY (ref_type, ref_name, kind),
            FOREIGN KEY (artifact_id) REFERENCES index_artifacts(artifact_id) ON DELETE CASCADE,
            CHECK (
                (ref_type = 'ref' AND ref_name IN ('HEAD', 'main'))
                OR (ref_type != 'ref' AND length(ref_name) = 64)
            )
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_embeddings (
            tree_hash TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            model_id TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            content_hash TEXT NOT NULL,
            PRIMARY KEY (tree_hash, chunk_id, model_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Scheduler + audit
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            action TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'running', 'completed', 'canceled', 'failed')),
            next_run_at TEXT NOT NULL,
            idempotency_key TEXT UNIQUE,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_runs (
            run_id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('started', 'succeeded', 'failed')),
            result_hash TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            FOREIGN KEY (task_id) REFERENCES tasks(task_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            request_id TEXT PRIMARY KEY,
            tool_name TEXT NOT NULL,
            inputs_hash TEXT NOT NULL,
            outputs_hash TEXT NOT NULL,
            envelope_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for common query patterns
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_doc_id ON chunks(doc_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tree_chunks_doc ON tree_chunks(tree_hash, doc_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fts_chunks_tree ON fts_chunks(tree_hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_next_run_at ON tasks(next_run_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_artifact_refs_artifact ON artifact_refs(artifact_id)")
        .execute(pool)
        .await?;

    Ok(())
}
