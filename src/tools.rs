//! Tool contracts: validated inputs, one transaction per call, enveloped
//! results.
//!
//! [`run_tool`] is the single entry both frontends (CLI and HTTP server)
//! route through. Each handler validates its input record, opens one
//! store transaction, performs its DAG/FTS/artifact work, and returns a
//! [`ToolOutcome`]; failures carry taxonomy codes and become `errors[]`
//! entries in the envelope rather than crossing the boundary as
//! exceptions. The audit append happens after the envelope is built and
//! never affects the reply.
//!
//! | Tool | Purpose |
//! |------|---------|
//! | `ingest_document` / `drop_document` | Working-tree mutation |
//! | `commit_index` | Freeze the working tree into a commit |
//! | `checkout_index` | Materialize a committed tree |
//! | `diff_index` | Document-level diff between two targets |
//! | `update_ref` | Move a named ref |
//! | `retrieve` | Working-tree BM25 retrieval |
//! | `retrieve_with_embeddings` | Committed-tree hybrid retrieval |
//! | `build_fts_tree` / `validate_fts` | Per-tree FTS artifact lifecycle |
//! | `build_embeddings` | Embedding artifact build |
//! | `gc_artifacts` | Reachability-based artifact pruning |
//! | `schedule_task` / `list_tasks` | Durable scheduler records |

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::dag;
use crate::embed_build;
use crate::embedding::ProviderRegistry;
use crate::envelope::{append_audit, build_envelope, Envelope, ToolOutcome};
use crate::errors::{tool_err, ErrorCode};
use crate::fts;
use crate::gc;
use crate::ingest;
use crate::models::{REF_HEAD, REF_MAIN};
use crate::scheduler;
use crate::search;

/// Shared process-wide services handed to every tool call.
#[derive(Clone)]
pub struct ToolContext {
    pub pool: SqlitePool,
    pub registry: Arc<ProviderRegistry>,
    pub config: Arc<Config>,
}

/// Run a named tool against a raw JSON input and produce its envelope.
pub async fn run_tool(ctx: &ToolContext, tool_name: &str, input: Value) -> Envelope {
    let request_id = input
        .get("request_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let outcome = dispatch(ctx, tool_name, &input).await;
    let envelope = build_envelope(tool_name, request_id, &input, outcome);
    append_audit(&ctx.pool, &envelope).await;
    envelope
}

/// All tool names, for discovery surfaces.
pub const TOOL_NAMES: [&str; 14] = [
    "ingest_document",
    "drop_document",
    "commit_index",
    "checkout_index",
    "diff_index",
    "update_ref",
    "retrieve",
    "retrieve_with_embeddings",
    "build_fts_tree",
    "validate_fts",
    "build_embeddings",
    "gc_artifacts",
    "schedule_task",
    "list_tasks",
];

async fn dispatch(ctx: &ToolContext, tool_name: &str, input: &Value) -> Result<ToolOutcome> {
    match tool_name {
        "ingest_document" => ingest_document_tool(ctx, input).await,
        "drop_document" => drop_document_tool(ctx, input).await,
        "commit_index" => commit_index_tool(ctx, input).await,
        "checkout_index" => checkout_index_tool(ctx, input).await,
        "diff_index" => diff_index_tool(ctx, input).await,
        "update_ref" => update_ref_tool(ctx, input).await,
        "retrieve" => retrieve_tool(ctx, input).await,
        "retrieve_with_embeddings" => retrieve_with_embeddings_tool(ctx, input).await,
        "build_fts_tree" => build_fts_tree_tool(ctx, input).await,
        "validate_fts" => validate_fts_tool(ctx, input).await,
        "build_embeddings" => build_embeddings_tool(ctx, input).await,
        "gc_artifacts" => gc_artifacts_tool(ctx, input).await,
        "schedule_task" => schedule_task_tool(ctx, input).await,
        "list_tasks" => list_tasks_tool(ctx, input).await,
        other => Err(tool_err(
            ErrorCode::ToolFailure,
            format!("unknown tool: {}", other),
        )),
    }
}

fn parse_input<T: for<'de> Deserialize<'de>>(input: &Value) -> Result<T> {
    serde_json::from_value(input.clone())
        .map_err(|e| tool_err(ErrorCode::ToolFailure, format!("invalid input: {}", e)))
}

// ============ ingest_document / drop_document ============

#[derive(Deserialize)]
struct IngestInput {
    doc_id: String,
    #[serde(default)]
    title: Option<String>,
    text: String,
}

async fn ingest_document_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: IngestInput = parse_input(input)?;
    if req.doc_id.trim().is_empty() {
        return Err(tool_err(ErrorCode::ToolFailure, "doc_id must not be empty"));
    }

    let mut tx = ctx.pool.begin().await?;
    let report = ingest::ingest_document(
        &mut tx,
        &req.doc_id,
        req.title.as_deref(),
        &req.text,
        ctx.config.chunking.max_chunk_bytes,
    )
    .await?;
    tx.commit().await?;

    Ok(ToolOutcome {
        provenance: vec![json!({ "doc_id": report.doc_id, "content_hash": report.content_hash })],
        result: serde_json::to_value(report)?,
        warnings: Vec::new(),
    })
}

#[derive(Deserialize)]
struct DropInput {
    doc_id: String,
}

async fn drop_document_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: DropInput = parse_input(input)?;

    let mut tx = ctx.pool.begin().await?;
    let dropped = ingest::drop_document(&mut tx, &req.doc_id).await?;
    tx.commit().await?;

    Ok(ToolOutcome {
        result: json!({ "doc_id": req.doc_id, "dropped": dropped }),
        ..Default::default()
    })
}

// ============ commit_index ============

#[derive(Deserialize)]
struct CommitInput {
    #[serde(default)]
    message: Option<String>,
}

async fn commit_index_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: CommitInput = parse_input(input)?;
    let message = req.message.unwrap_or_default();

    let mut tx = ctx.pool.begin().await?;

    let tree = dag::create_tree_from_current_state(&mut tx).await?;
    dag::save_tree(&mut tx, &tree.tree_hash, &tree.entries_json).await?;
    dag::freeze_tree(&mut tx, &tree.tree_hash).await?;

    let parents: Vec<String> = match dag::resolve_target(&mut tx, REF_HEAD).await? {
        Some(head) => vec![head],
        None => Vec::new(),
    };
    let commit_hash = dag::create_commit(&mut tx, &tree.tree_hash, &parents, &message).await?;

    // Single-branch model: a commit advances both HEAD and main.
    dag::update_ref(&mut tx, REF_HEAD, &commit_hash).await?;
    dag::update_ref(&mut tx, REF_MAIN, &commit_hash).await?;

    tx.commit().await?;

    Ok(ToolOutcome {
        provenance: vec![json!({ "commit_hash": commit_hash, "tree_hash": tree.tree_hash })],
        result: json!({
            "commit_hash": commit_hash,
            "tree_hash": tree.tree_hash,
            "row_count": tree.row_count,
            "parents": parents,
        }),
        warnings: Vec::new(),
    })
}

// ============ checkout_index ============

#[derive(Deserialize)]
struct CheckoutInput {
    target: String,
}

async fn checkout_index_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: CheckoutInput = parse_input(input)?;

    let mut tx = ctx.pool.begin().await?;
    let (commit_hash, tree_hash) = dag::resolve_ref_to_tree(&mut tx, &req.target).await?;
    let summary = dag::materialize_tree(&mut tx, &tree_hash).await?;
    dag::update_ref(&mut tx, REF_HEAD, &commit_hash).await?;
    tx.commit().await?;

    Ok(ToolOutcome {
        provenance: vec![json!({ "commit_hash": commit_hash, "tree_hash": tree_hash })],
        result: json!({
            "commit_hash": commit_hash,
            "tree_hash": summary.tree_hash,
            "documents": summary.documents,
            "chunks": summary.chunks,
        }),
        warnings: Vec::new(),
    })
}

// ============ diff_index ============

#[derive(Deserialize)]
struct DiffInput {
    from: String,
    to: String,
}

async fn diff_index_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: DiffInput = parse_input(input)?;

    let mut conn = ctx.pool.acquire().await?;
    let (from_commit, from_tree) = dag::resolve_ref_to_tree(&mut conn, &req.from).await?;
    let (to_commit, to_tree) = dag::resolve_ref_to_tree(&mut conn, &req.to).await?;
    let diff = dag::diff_trees(&mut conn, &from_tree, &to_tree).await?;

    Ok(ToolOutcome {
        provenance: vec![
            json!({ "commit_hash": from_commit, "tree_hash": from_tree, "role": "from" }),
            json!({ "commit_hash": to_commit, "tree_hash": to_tree, "role": "to" }),
        ],
        result: serde_json::to_value(diff)?,
        warnings: Vec::new(),
    })
}

// ============ update_ref ============

#[derive(Deserialize)]
struct UpdateRefInput {
    ref_name: String,
    target: String,
}

async fn update_ref_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: UpdateRefInput = parse_input(input)?;
    if req.ref_name.trim().is_empty() {
        return Err(tool_err(ErrorCode::ToolFailure, "ref_name must not be empty"));
    }

    let mut tx = ctx.pool.begin().await?;
    let commit_hash = dag::resolve_target(&mut tx, &req.target).await?.ok_or_else(|| {
        tool_err(
            ErrorCode::RefNotFound,
            format!("unknown ref or commit: {}", req.target),
        )
    })?;
    dag::update_ref(&mut tx, &req.ref_name, &commit_hash).await?;
    tx.commit().await?;

    Ok(ToolOutcome {
        result: json!({ "ref_name": req.ref_name, "commit_hash": commit_hash }),
        ..Default::default()
    })
}

// ============ retrieve ============

#[derive(Deserialize)]
struct RetrieveInput {
    query: String,
    #[serde(default)]
    k: Option<i64>,
    #[serde(default)]
    index_version: Option<String>,
}

async fn retrieve_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: RetrieveInput = parse_input(input)?;

    let outcome = search::retrieve(&ctx.pool, &req.query, req.k, req.index_version.as_deref()).await?;

    let provenance = outcome
        .hits
        .iter()
        .map(|h| {
            json!({
                "chunk_id": h.chunk_id,
                "doc_id": h.doc_id,
                "index_version": outcome.index_version,
            })
        })
        .collect();

    Ok(ToolOutcome {
        provenance,
        warnings: outcome.warnings.clone(),
        result: serde_json::to_value(&outcome)?,
    })
}

// ============ retrieve_with_embeddings ============

#[derive(Deserialize)]
struct HybridInput {
    query: String,
    #[serde(default)]
    k: Option<i64>,
    #[serde(default = "default_ref")]
    r#ref: String,
    #[serde(default)]
    provider_id: Option<String>,
    #[serde(default)]
    dimensions: Option<usize>,
    #[serde(default)]
    bm25_k: Option<i64>,
    #[serde(default)]
    vector_k: Option<i64>,
    #[serde(default = "default_alpha")]
    alpha: f64,
}

fn default_ref() -> String {
    REF_HEAD.to_string()
}

fn default_alpha() -> f64 {
    0.6
}

async fn retrieve_with_embeddings_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: HybridInput = parse_input(input)?;

    let params = search::HybridParams {
        query: &req.query,
        k: req.k,
        reference: &req.r#ref,
        provider_id: req.provider_id.as_deref(),
        dimensions: req.dimensions,
        bm25_k: req.bm25_k,
        vector_k: req.vector_k,
        alpha: req.alpha,
    };
    let outcome = search::retrieve_with_embeddings(&ctx.pool, &ctx.registry, &params).await?;

    Ok(ToolOutcome {
        provenance: vec![json!({
            "tree_hash": outcome.tree_hash,
            "commit_hash": outcome.commit_hash,
            "artifact_id": outcome.artifact_id,
            "model_id": outcome.model_id,
        })],
        result: serde_json::to_value(&outcome)?,
        warnings: Vec::new(),
    })
}

// ============ build_fts_tree / validate_fts ============

#[derive(Deserialize)]
struct FtsBuildInput {
    #[serde(default = "default_ref")]
    r#ref: String,
    #[serde(default)]
    force_rebuild: bool,
}

async fn build_fts_tree_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: FtsBuildInput = parse_input(input)?;
    let report = fts::build_fts_tree(&ctx.pool, &req.r#ref, req.force_rebuild).await?;

    Ok(ToolOutcome {
        provenance: vec![json!({
            "artifact_id": report.artifact_id,
            "tree_hash": report.tree_hash,
            "commit_hash": report.commit_hash,
        })],
        result: serde_json::to_value(report)?,
        warnings: Vec::new(),
    })
}

#[derive(Deserialize)]
struct FtsValidateInput {
    #[serde(default = "default_ref")]
    r#ref: String,
    #[serde(default)]
    deep: bool,
}

async fn validate_fts_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: FtsValidateInput = parse_input(input)?;
    let report = fts::validate_fts(&ctx.pool, &req.r#ref, req.deep).await?;

    Ok(ToolOutcome {
        provenance: vec![json!({ "tree_hash": report.tree_hash, "bundle_hash": report.bundle_hash })],
        result: serde_json::to_value(report)?,
        warnings: Vec::new(),
    })
}

// ============ build_embeddings ============

#[derive(Deserialize)]
struct EmbedBuildInput {
    #[serde(default = "default_ref")]
    r#ref: String,
    #[serde(default)]
    provider_id: Option<String>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    dimensions: Option<usize>,
}

async fn build_embeddings_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: EmbedBuildInput = parse_input(input)?;
    let report = embed_build::build_embeddings(
        &ctx.pool,
        &ctx.registry,
        &req.r#ref,
        req.provider_id.as_deref(),
        req.batch_size,
        req.dimensions,
    )
    .await?;

    Ok(ToolOutcome {
        provenance: vec![json!({
            "artifact_id": report.artifact_id,
            "tree_hash": report.tree_hash,
            "commit_hash": report.commit_hash,
            "model_id": report.model_id,
        })],
        result: serde_json::to_value(report)?,
        warnings: Vec::new(),
    })
}

// ============ gc_artifacts ============

#[derive(Deserialize)]
struct GcInput {
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default)]
    keep_refs: Option<Vec<String>>,
    #[serde(default)]
    kinds: Option<Vec<String>>,
}

fn default_mode() -> String {
    "dry_run".to_string()
}

async fn gc_artifacts_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: GcInput = parse_input(input)?;
    let commit_mode = match req.mode.as_str() {
        "commit" => true,
        "dry_run" => false,
        other => {
            return Err(tool_err(
                ErrorCode::ToolFailure,
                format!("mode must be dry_run or commit, got {}", other),
            ))
        }
    };

    let report = gc::gc_artifacts(
        &ctx.pool,
        req.keep_refs.as_deref(),
        req.kinds.as_deref(),
        commit_mode,
    )
    .await?;

    Ok(ToolOutcome {
        result: serde_json::to_value(report)?,
        ..Default::default()
    })
}

// ============ schedule_task / list_tasks ============

#[derive(Deserialize)]
struct ScheduleInput {
    title: String,
    action: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    run_at: Option<String>,
    #[serde(default)]
    interval_seconds: Option<i64>,
    #[serde(default)]
    reference_time: Option<String>,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn schedule_task_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: ScheduleInput = parse_input(input)?;
    let commit = match req.mode.as_str() {
        "commit" => true,
        "dry_run" => false,
        other => {
            return Err(tool_err(
                ErrorCode::ToolFailure,
                format!("mode must be dry_run or commit, got {}", other),
            ))
        }
    };

    let mut tx = ctx.pool.begin().await?;
    let outcome = scheduler::schedule_task(
        &mut tx,
        &scheduler::ScheduleRequest {
            title: &req.title,
            action: &req.action,
            payload: &req.payload,
            run_at: req.run_at.as_deref(),
            interval_seconds: req.interval_seconds,
            reference_time: req.reference_time.as_deref(),
            idempotency_key: req.idempotency_key.as_deref(),
            commit,
        },
    )
    .await?;
    tx.commit().await?;

    Ok(ToolOutcome {
        result: serde_json::to_value(outcome)?,
        ..Default::default()
    })
}

#[derive(Deserialize)]
struct ListTasksInput {
    #[serde(default = "default_task_limit")]
    limit: i64,
}

fn default_task_limit() -> i64 {
    50
}

async fn list_tasks_tool(ctx: &ToolContext, input: &Value) -> Result<ToolOutcome> {
    let req: ListTasksInput = parse_input(input)?;

    let mut conn = ctx.pool.acquire().await?;
    let tasks = scheduler::pending_tasks(&mut conn, req.limit.max(1)).await?;

    Ok(ToolOutcome {
        result: json!({ "tasks": tasks }),
        ..Default::default()
    })
}
