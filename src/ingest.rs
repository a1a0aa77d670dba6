//! Working-tree ingestion.
//!
//! Chunking strategy is an input to commits, not part of the version DAG;
//! this module provides the minimal path that populates the working
//! tables: NFKC-normalize the text, upsert the document, replace its
//! chunks with span-exact paragraph chunks, and mirror them into the
//! working FTS index.
//!
//! Normalizing at ingest time keeps the chunk-span invariant and the
//! per-tree FTS reconstruction (`NFKC(blob)[span_start..span_end]`)
//! pointing at the same bytes: NFKC is idempotent, so re-normalizing an
//! already-normalized blob is the identity.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqliteConnection;
use unicode_normalization::UnicodeNormalization;

use crate::canon::sha256_hex;
use crate::chunk::chunk_document;
use crate::models::Chunk;

/// Report returned by [`ingest_document`].
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub content_hash: String,
    pub chunk_count: i64,
    pub replaced: bool,
}

/// Upsert one document into the working tree and rechunk it.
pub async fn ingest_document(
    conn: &mut SqliteConnection,
    doc_id: &str,
    title: Option<&str>,
    text: &str,
    max_chunk_bytes: usize,
) -> Result<IngestReport> {
    let normalized: String = text.nfkc().collect();
    let content_hash = sha256_hex(normalized.as_bytes());

    let replaced: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE doc_id = ?")
        .bind(doc_id)
        .fetch_one(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO documents (doc_id, title, content_hash, body, updated_at)
        VALUES (?, ?, ?, ?, 0)
        ON CONFLICT(doc_id) DO UPDATE SET
            title = excluded.title,
            content_hash = excluded.content_hash,
            body = excluded.body,
            updated_at = 0
        "#,
    )
    .bind(doc_id)
    .bind(title)
    .bind(&content_hash)
    .bind(&normalized)
    .execute(&mut *conn)
    .await?;

    let chunks = chunk_document(doc_id, &normalized, max_chunk_bytes);
    replace_working_chunks(&mut *conn, doc_id, &chunks).await?;

    Ok(IngestReport {
        doc_id: doc_id.to_string(),
        content_hash,
        chunk_count: chunks.len() as i64,
        replaced,
    })
}

/// Remove a working document, its chunks, and their FTS rows.
///
/// Returns `false` when the document was not present.
pub async fn drop_document(conn: &mut SqliteConnection, doc_id: &str) -> Result<bool> {
    sqlx::query("DELETE FROM chunks_fts WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM documents WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Atomically replace a document's chunks and their FTS entries.
async fn replace_working_chunks(
    conn: &mut SqliteConnection,
    doc_id: &str,
    chunks: &[Chunk],
) -> Result<()> {
    sqlx::query("DELETE FROM chunks_fts WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut *conn)
        .await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (chunk_id, doc_id, span_start, span_end, text, content_hash, chunker_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(&chunk.doc_id)
        .bind(chunk.span_start)
        .bind(chunk.span_end)
        .bind(&chunk.text)
        .bind(&chunk.content_hash)
        .bind(crate::chunk::CHUNKER_ID)
        .execute(&mut *conn)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, doc_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.chunk_id)
            .bind(&chunk.doc_id)
            .bind(&chunk.text)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}
