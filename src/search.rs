//! Retrieval: working-tree BM25 and committed-tree hybrid search.
//!
//! # Hybrid scoring algorithm
//!
//! 1. Fetch `bm25_k` keyword candidates from the working FTS index.
//! 2. Linear-scan the committed tree's stored vectors, cosine against the
//!    query embedding, keep the top `vector_k`.
//! 3. Union by chunk id; min-max normalize each signal *separately* over
//!    the candidates present (a missing signal contributes 0).
//! 4. Merge: `score = α × bm25 + (1 − α) × cosine`.
//! 5. Sort by score (desc), chunk id (asc); truncate to `k`.
//!
//! Ordering is fully deterministic: every tie breaks on `chunk_id`.
//!
//! The hybrid path reads chunk text from the working `chunks` table, which
//! is only exact when the working tree equals the target tree — the same
//! precondition [`crate::embed_build::build_embeddings`] enforces when the
//! vectors are produced.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::dag;
use crate::embedding::{blob_to_vec, cosine_similarity, ProviderRegistry};
use crate::errors::{tool_err, ErrorCode, Warning, WarningCode};
use crate::models::{ARTIFACT_KIND_EMBEDDINGS, REF_HEAD};

/// Result cap shared by both retrieval paths.
pub const MAX_K: i64 = 25;
/// Candidate caps for the hybrid path.
pub const MAX_BM25_K: i64 = 200;
pub const MAX_VECTOR_K: i64 = 500;

/// One retrieved chunk with provenance fields.
#[derive(Debug, Clone, Serialize)]
pub struct RetrieveHit {
    pub chunk_id: String,
    pub doc_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Negated BM25 rank; higher is better.
    pub score: f64,
    pub text: String,
}

/// Working-tree retrieval outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RetrieveOutcome {
    /// The tree hash the results were actually served from.
    pub index_version: String,
    pub hits: Vec<RetrieveHit>,
    #[serde(skip)]
    pub warnings: Vec<Warning>,
}

/// Rank working chunks by BM25, tiebreak by chunk id.
///
/// Emits warnings instead of failing when the index has no commits yet,
/// when the working tree has drifted from `HEAD`, or when the caller asked
/// for a version other than the effective one.
pub async fn retrieve(
    pool: &SqlitePool,
    query: &str,
    k: Option<i64>,
    requested_version: Option<&str>,
) -> Result<RetrieveOutcome> {
    let k = k.unwrap_or(10).clamp(1, MAX_K);
    let mut conn = pool.acquire().await?;
    let mut warnings = Vec::new();

    let working = dag::create_tree_from_current_state(&mut conn).await?;

    let head_commit = dag::resolve_target(&mut conn, REF_HEAD).await?;
    match head_commit {
        None => warnings.push(Warning::new(
            WarningCode::NoCommits,
            "no commits yet; serving the working tree",
        )),
        Some(commit_hash) => {
            let head_tree: Option<String> =
                sqlx::query_scalar("SELECT tree_hash FROM commits WHERE commit_hash = ?")
                    .bind(&commit_hash)
                    .fetch_optional(&mut *conn)
                    .await?;
            if head_tree.as_deref() != Some(working.tree_hash.as_str()) {
                warnings.push(Warning::new(
                    WarningCode::WorkingTreeDirty,
                    format!(
                        "working tree {} differs from HEAD tree {}",
                        working.tree_hash,
                        head_tree.as_deref().unwrap_or("(none)")
                    ),
                ));
            }
        }
    }

    if let Some(requested) = requested_version {
        if requested != working.tree_hash {
            warnings.push(Warning::new(
                WarningCode::VersionMismatch,
                format!(
                    "requested index version {} but effective version is {}",
                    requested, working.tree_hash
                ),
            ));
        }
    }

    let hits = if query.trim().is_empty() {
        Vec::new()
    } else {
        let rows = sqlx::query(
            r#"
            SELECT f.chunk_id, f.doc_id, f.text, d.title, bm25(chunks_fts) AS rank
            FROM chunks_fts f
            LEFT JOIN documents d ON d.doc_id = f.doc_id
            WHERE chunks_fts MATCH ?
            ORDER BY bm25(chunks_fts) ASC, f.chunk_id ASC
            LIMIT ?
            "#,
        )
        .bind(query)
        .bind(k)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                RetrieveHit {
                    chunk_id: row.get("chunk_id"),
                    doc_id: row.get("doc_id"),
                    title: row.get("title"),
                    score: -rank,
                    text: row.get("text"),
                }
            })
            .collect()
    };

    Ok(RetrieveOutcome {
        index_version: working.tree_hash,
        hits,
        warnings,
    })
}

/// Inputs for [`retrieve_with_embeddings`].
#[derive(Debug, Clone)]
pub struct HybridParams<'a> {
    pub query: &'a str,
    pub k: Option<i64>,
    pub reference: &'a str,
    pub provider_id: Option<&'a str>,
    pub dimensions: Option<usize>,
    pub bm25_k: Option<i64>,
    pub vector_k: Option<i64>,
    pub alpha: f64,
}

/// One hybrid hit with its per-signal normalized scores.
#[derive(Debug, Clone, Serialize)]
pub struct HybridHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub score: f64,
    pub bm25_score: f64,
    pub cosine_score: f64,
    pub text: String,
}

/// Hybrid retrieval outcome with artifact provenance.
#[derive(Debug, Clone, Serialize)]
pub struct HybridOutcome {
    pub tree_hash: String,
    pub commit_hash: String,
    pub artifact_id: String,
    pub model_id: String,
    pub alpha: f64,
    pub hits: Vec<HybridHit>,
}

/// BM25 ∪ cosine retrieval over a committed tree.
pub async fn retrieve_with_embeddings(
    pool: &SqlitePool,
    registry: &ProviderRegistry,
    params: &HybridParams<'_>,
) -> Result<HybridOutcome> {
    if !(0.0..=1.0).contains(&params.alpha) {
        return Err(tool_err(
            ErrorCode::ToolFailure,
            format!("alpha must be within [0, 1], got {}", params.alpha),
        ));
    }
    let k = params.k.unwrap_or(10).clamp(1, MAX_K);
    let bm25_k = params.bm25_k.unwrap_or(MAX_BM25_K).clamp(1, MAX_BM25_K);
    let vector_k = params.vector_k.unwrap_or(MAX_VECTOR_K).clamp(1, MAX_VECTOR_K);

    let mut conn = pool.acquire().await?;
    let (commit_hash, tree_hash) = dag::resolve_ref_to_tree(&mut conn, params.reference).await?;

    let artifact_id: Option<String> = sqlx::query_scalar(
        "SELECT artifact_id FROM index_artifacts WHERE tree_hash = ? AND kind = ? ORDER BY artifact_id LIMIT 1",
    )
    .bind(&tree_hash)
    .bind(ARTIFACT_KIND_EMBEDDINGS)
    .fetch_optional(&mut *conn)
    .await?;
    let artifact_id = artifact_id.ok_or_else(|| {
        tool_err(
            ErrorCode::EmbeddingsNotFound,
            format!("no embeddings artifact registered for tree {}", tree_hash),
        )
    })?;

    let provider_id = params
        .provider_id
        .unwrap_or_else(|| registry.default_provider_id());
    let provider = registry.get(provider_id).ok_or_else(|| {
        tool_err(
            ErrorCode::ToolFailure,
            format!("unknown embedding provider: {}", provider_id),
        )
    })?;
    let model_id = provider.model_id().to_string();

    let query_batch = provider
        .embed(&[params.query.to_string()], params.dimensions)
        .await
        .map_err(|e| tool_err(ErrorCode::ToolFailure, format!("query embedding failed: {}", e)))?;
    let query_vec = query_batch
        .vectors
        .first()
        .cloned()
        .ok_or_else(|| tool_err(ErrorCode::ToolFailure, "empty query embedding response"))?;

    // BM25 candidates from the working index.
    let mut bm25_candidates: Vec<Candidate> = Vec::new();
    if !params.query.trim().is_empty() {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, doc_id, text, bm25(chunks_fts) AS rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY bm25(chunks_fts) ASC, chunk_id ASC
            LIMIT ?
            "#,
        )
        .bind(params.query)
        .bind(bm25_k)
        .fetch_all(&mut *conn)
        .await?;
        bm25_candidates = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                Candidate {
                    chunk_id: row.get("chunk_id"),
                    doc_id: row.get("doc_id"),
                    raw_score: -rank,
                    text: row.get("text"),
                }
            })
            .collect();
    }

    // Vector candidates: deterministic linear scan of the stored vectors.
    let rows = sqlx::query(
        r#"
        SELECT ce.chunk_id, ce.dims, ce.vector, c.doc_id, c.text
        FROM chunk_embeddings ce
        LEFT JOIN chunks c ON c.chunk_id = ce.chunk_id
        WHERE ce.tree_hash = ? AND ce.model_id = ?
        ORDER BY ce.chunk_id ASC
        "#,
    )
    .bind(&tree_hash)
    .bind(&model_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut vector_candidates: Vec<Candidate> = Vec::new();
    for row in &rows {
        let dims: i64 = row.get("dims");
        if dims as usize != query_vec.len() {
            continue;
        }
        let blob: Vec<u8> = row.get("vector");
        let vec = blob_to_vec(&blob);
        let similarity = cosine_similarity(&query_vec, &vec) as f64;
        vector_candidates.push(Candidate {
            chunk_id: row.get("chunk_id"),
            doc_id: row.get::<Option<String>, _>("doc_id").unwrap_or_default(),
            raw_score: similarity,
            text: row.get::<Option<String>, _>("text").unwrap_or_default(),
        });
    }
    vector_candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    vector_candidates.truncate(vector_k as usize);

    let ranked = hybrid_rank(&bm25_candidates, &vector_candidates, params.alpha, k as usize);

    // Prefer BM25 candidate metadata (working text), fall back to the
    // vector side for chunks only the scan surfaced.
    let mut by_id: HashMap<&str, &Candidate> = HashMap::new();
    for c in vector_candidates.iter().chain(bm25_candidates.iter()) {
        by_id.insert(c.chunk_id.as_str(), c);
    }

    let hits = ranked
        .into_iter()
        .map(|r| {
            let meta = by_id.get(r.chunk_id.as_str());
            HybridHit {
                doc_id: meta.map(|c| c.doc_id.clone()).unwrap_or_default(),
                text: meta.map(|c| c.text.clone()).unwrap_or_default(),
                chunk_id: r.chunk_id,
                score: r.score,
                bm25_score: r.bm25_norm,
                cosine_score: r.cosine_norm,
            }
        })
        .collect();

    Ok(HybridOutcome {
        tree_hash,
        commit_hash,
        artifact_id,
        model_id,
        alpha: params.alpha,
        hits,
    })
}

/// A scored candidate from either signal.
#[derive(Debug, Clone)]
struct Candidate {
    chunk_id: String,
    doc_id: String,
    raw_score: f64,
    text: String,
}

#[derive(Debug, Clone, PartialEq)]
struct RankedChunk {
    chunk_id: String,
    score: f64,
    bm25_norm: f64,
    cosine_norm: f64,
}

/// Min-max normalize raw scores to `[0, 1]`; all-equal sets collapse to 1.
fn normalize_scores(candidates: &[Candidate]) -> HashMap<String, f64> {
    if candidates.is_empty() {
        return HashMap::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c.chunk_id.clone(), norm)
        })
        .collect()
}

/// Union, per-set normalization, weighted merge, deterministic order.
fn hybrid_rank(
    bm25: &[Candidate],
    cosine: &[Candidate],
    alpha: f64,
    k: usize,
) -> Vec<RankedChunk> {
    let bm25_norm = normalize_scores(bm25);
    let cosine_norm = normalize_scores(cosine);

    let mut union: Vec<&str> = bm25
        .iter()
        .chain(cosine.iter())
        .map(|c| c.chunk_id.as_str())
        .collect();
    union.sort();
    union.dedup();

    let mut ranked: Vec<RankedChunk> = union
        .into_iter()
        .map(|chunk_id| {
            let b = bm25_norm.get(chunk_id).copied().unwrap_or(0.0);
            let c = cosine_norm.get(chunk_id).copied().unwrap_or(0.0);
            RankedChunk {
                chunk_id: chunk_id.to_string(),
                score: alpha * b + (1.0 - alpha) * c,
                bm25_norm: b,
                cosine_norm: c,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    ranked.truncate(k);
    ranked
}
