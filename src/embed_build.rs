//! Embedding artifact builder.
//!
//! Walks a committed tree's chunks in `chunk_id` order, embeds them in
//! batches through a registered provider, and stores the vectors as
//! per-(tree, chunk, model) little-endian f32 blobs. A registered
//! `chunk_embeddings` artifact records provider, dims, and chunk count.
//!
//! Precondition: the working tree must hash-equal the target tree. Chunk
//! text is read from the working `chunks` table, so this is what
//! guarantees the text being embedded is exactly the frozen tree's text.

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use sqlx::{Row, SqlitePool};

use crate::canon::{canonical_json, hash_value, sha256_hex};
use crate::dag;
use crate::embedding::{vec_to_blob, ProviderRegistry};
use crate::errors::{tool_err, ErrorCode};
use crate::fts::{payload_hash_of, upsert_artifact, upsert_artifact_refs};
use crate::models::ARTIFACT_KIND_EMBEDDINGS;

/// Default and maximum provider batch sizes.
pub const DEFAULT_BATCH_SIZE: usize = 128;
pub const MAX_BATCH_SIZE: usize = 2048;

/// Report returned by [`build_embeddings`].
#[derive(Debug, Clone, Serialize)]
pub struct EmbedBuildReport {
    pub status: String,
    pub artifact_id: String,
    pub tree_hash: String,
    pub commit_hash: String,
    pub provider_id: String,
    pub model_id: String,
    pub dims: usize,
    pub chunk_count: i64,
}

/// Build the embeddings artifact for `reference`'s tree.
pub async fn build_embeddings(
    pool: &SqlitePool,
    registry: &ProviderRegistry,
    reference: &str,
    provider_id: Option<&str>,
    batch_size: Option<usize>,
    dimensions: Option<usize>,
) -> Result<EmbedBuildReport> {
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

    // The builder reads text from the working tables; they must be exactly
    // the target tree.
    let working = dag::create_tree_from_current_state(&mut tx).await?;
    if working.tree_hash != tree_hash {
        return Err(tool_err(
            ErrorCode::WorkingTreeDirty,
            format!(
                "working tree {} does not match target tree {}; checkout the target first",
                working.tree_hash, tree_hash
            ),
        ));
    }

    let provider_id = provider_id.unwrap_or_else(|| registry.default_provider_id());
    let provider = registry.get(provider_id).ok_or_else(|| {
        tool_err(
            ErrorCode::ToolFailure,
            format!("unknown embedding provider: {}", provider_id),
        )
    })?;
    let model_id = provider.model_id().to_string();

    let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE).clamp(1, MAX_BATCH_SIZE);

    let rows = sqlx::query(
        r#"
        SELECT tc.chunk_id, c.text
        FROM tree_chunks tc
        JOIN chunks c ON c.chunk_id = tc.chunk_id
        WHERE tc.tree_hash = ?
        ORDER BY tc.chunk_id ASC
        "#,
    )
    .bind(&tree_hash)
    .fetch_all(&mut *tx)
    .await?;

    let chunks: Vec<(String, String)> = rows
        .iter()
        .map(|r| (r.get("chunk_id"), r.get("text")))
        .collect();

    let mut artifact_dims: Option<usize> = None;
    let mut payload_pairs: Vec<(String, String)> = Vec::with_capacity(chunks.len());

    for batch in chunks.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
        let result = provider
            .embed(&texts, dimensions)
            .await
            .map_err(|e| tool_err(ErrorCode::ToolFailure, format!("embedding provider failed: {}", e)))?;

        if result.vectors.len() != texts.len() {
            return Err(tool_err(
                ErrorCode::ToolFailure,
                format!(
                    "provider returned {} vectors for {} inputs",
                    result.vectors.len(),
                    texts.len()
                ),
            ));
        }
        if result.dims == 0 {
            return Err(tool_err(ErrorCode::EmbeddingDims, "provider returned zero dims"));
        }
        match artifact_dims {
            None => artifact_dims = Some(result.dims),
            Some(d) if d != result.dims => {
                return Err(tool_err(
                    ErrorCode::EmbeddingDims,
                    format!("provider switched dims mid-artifact: {} then {}", d, result.dims),
                ));
            }
            Some(_) => {}
        }

        for ((chunk_id, _), vector) in batch.iter().zip(result.vectors.iter()) {
            if vector.len() != result.dims {
                return Err(tool_err(
                    ErrorCode::EmbeddingDims,
                    format!(
                        "vector for chunk {} has {} dims, batch reported {}",
                        chunk_id,
                        vector.len(),
                        result.dims
                    ),
                ));
            }

            let blob = vec_to_blob(vector);
            let content_hash = sha256_hex(&blob);
            sqlx::query(
                r#"
                INSERT INTO chunk_embeddings (tree_hash, chunk_id, model_id, dims, vector, content_hash)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(tree_hash, chunk_id, model_id) DO UPDATE SET
                    dims = excluded.dims,
                    vector = excluded.vector,
                    content_hash = excluded.content_hash
                "#,
            )
            .bind(&tree_hash)
            .bind(chunk_id)
            .bind(&model_id)
            .bind(result.dims as i64)
            .bind(&blob)
            .bind(&content_hash)
            .execute(&mut *tx)
            .await?;

            payload_pairs.push((chunk_id.clone(), content_hash));
        }
    }

    let dims = artifact_dims.unwrap_or(dimensions.unwrap_or(provider.dims()));
    let chunk_count = payload_pairs.len() as i64;
    let payload_hash = payload_hash_of(&payload_pairs);
    let tree_entries_hash = sha256_hex(working.entries_json.as_bytes());

    let manifest = json!({
        "kind": ARTIFACT_KIND_EMBEDDINGS,
        "provider_id": provider_id,
        "model_id": model_id,
        "dims": dims,
        "chunk_count": chunk_count,
        "tree_hash": tree_hash,
        "tree_entries_hash": tree_entries_hash,
    });
    let manifest_hash = hash_value(&manifest);
    let artifact_id = hash_value(&json!({
        "kind": ARTIFACT_KIND_EMBEDDINGS,
        "tree_hash": tree_hash,
        "provider_id": provider_id,
        "dims": dims,
        "manifest_hash": manifest_hash,
    }));

    upsert_artifact(
        &mut tx,
        &artifact_id,
        &tree_hash,
        ARTIFACT_KIND_EMBEDDINGS,
        Some(&model_id),
        &payload_hash,
        &canonical_json(&manifest),
        chunk_count,
    )
    .await?;
    upsert_artifact_refs(&mut tx, reference, &commit_hash, ARTIFACT_KIND_EMBEDDINGS, &artifact_id)
        .await?;

    tx.commit().await?;

    Ok(EmbedBuildReport {
        status: "built".to_string(),
        artifact_id,
        tree_hash,
        commit_hash,
        provider_id: provider_id.to_string(),
        model_id,
        dims,
        chunk_count,
    })
}
