//! End-to-end scenarios over a real SQLite database:
//! replay-stable identities, diff, checkout round-trips, the FTS gate and
//! artifact lifecycle, hybrid ranking, GC reachability, scheduler
//! idempotency, and the envelope contract.

use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::Row;
use tempfile::TempDir;

use index_harness::config::{ChunkingConfig, Config, DbConfig, EmbeddingConfig, RetrievalConfig, ServerConfig};
use index_harness::db;
use index_harness::embedding::{cosine_similarity, EmbeddingProvider, ProviderRegistry};
use index_harness::envelope::Envelope;
use index_harness::migrate;
use index_harness::tools::{run_tool, ToolContext};
use index_harness::{dag, fts};

async fn setup() -> (TempDir, ToolContext) {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("idx.sqlite");

    let pool = db::connect_path(&db_path).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let mut embedding = EmbeddingConfig::default();
    embedding.dims = Some(8);

    let config = Config {
        db: DbConfig { path: db_path },
        chunking: ChunkingConfig::default(),
        retrieval: RetrievalConfig::default(),
        embedding,
        server: ServerConfig::default(),
    };

    let ctx = ToolContext {
        pool,
        registry: Arc::new(ProviderRegistry::from_config(&config.embedding)),
        config: Arc::new(config),
    };
    (tmp, ctx)
}

async fn call(ctx: &ToolContext, tool: &str, input: Value) -> Envelope {
    run_tool(ctx, tool, input).await
}

async fn call_ok(ctx: &ToolContext, tool: &str, input: Value) -> Value {
    let env = call(ctx, tool, input).await;
    assert!(
        env.errors.is_empty(),
        "{} failed: {:?}",
        tool,
        env.errors
    );
    env.result
}

fn err_code(env: &Envelope) -> &str {
    &env.errors.first().expect("expected an error").code
}

async fn ingest(ctx: &ToolContext, doc_id: &str, text: &str) {
    call_ok(
        ctx,
        "ingest_document",
        json!({ "doc_id": doc_id, "text": text }),
    )
    .await;
}

async fn commit(ctx: &ToolContext) -> (String, String) {
    let result = call_ok(ctx, "commit_index", json!({})).await;
    (
        result["commit_hash"].as_str().unwrap().to_string(),
        result["tree_hash"].as_str().unwrap().to_string(),
    )
}

// ============ DAG scenarios ============

#[tokio::test]
async fn test_stable_commit_identity_across_databases() {
    let (_tmp1, ctx1) = setup().await;
    let (_tmp2, ctx2) = setup().await;

    for ctx in [&ctx1, &ctx2] {
        ingest(ctx, "A", "hello").await;
        ingest(ctx, "B", "world").await;
    }

    let (commit1, tree1) = commit(&ctx1).await;
    let (commit2, tree2) = commit(&ctx2).await;

    assert_eq!(tree1, tree2, "same inserts must hash to the same tree");
    assert_eq!(commit1, commit2, "same tree + parents must hash to the same commit");
}

#[tokio::test]
async fn test_commit_is_idempotent_for_unchanged_state() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "hello").await;
    let (c1, t1) = commit(&ctx).await;

    // Committing again on the same tree with HEAD as parent creates a new
    // commit (parents differ), but the tree is unchanged.
    let (c2, t2) = commit(&ctx).await;
    assert_eq!(t1, t2);
    assert_ne!(c1, c2);

    let result = call_ok(&ctx, "commit_index", json!({})).await;
    assert_eq!(result["parents"][0].as_str().unwrap(), c2);
}

#[tokio::test]
async fn test_diff_correctness() {
    let (_tmp, ctx) = setup().await;

    ingest(&ctx, "A", "x").await;
    ingest(&ctx, "B", "y").await;
    let (c1, _) = commit(&ctx).await;

    ingest(&ctx, "B", "y2").await;
    ingest(&ctx, "C", "z").await;
    let (c2, _) = commit(&ctx).await;

    let diff = call_ok(&ctx, "diff_index", json!({ "from": c1, "to": c2 })).await;
    assert_eq!(diff["added"], json!(["C"]));
    assert_eq!(diff["removed"], json!([]));
    assert_eq!(diff["changed"], json!(["B"]));
}

#[tokio::test]
async fn test_checkout_round_trip() {
    let (_tmp, ctx) = setup().await;

    ingest(&ctx, "A", "alpha text about rust\n\nsecond paragraph").await;
    ingest(&ctx, "B", "beta text about python").await;
    let (c1, t1) = commit(&ctx).await;

    // Mutate the working tree.
    ingest(&ctx, "A", "completely different").await;
    call_ok(&ctx, "drop_document", json!({ "doc_id": "B" })).await;

    let result = call_ok(&ctx, "checkout_index", json!({ "target": c1 })).await;
    assert_eq!(result["tree_hash"].as_str().unwrap(), t1);
    assert_eq!(result["documents"], json!(2));

    // The recomputed working tree must equal the checked-out snapshot.
    let mut conn = ctx.pool.acquire().await.unwrap();
    let state = dag::create_tree_from_current_state(&mut conn).await.unwrap();
    assert_eq!(state.tree_hash, t1);

    // The working FTS was rebuilt with the restored text.
    let out = call_ok(&ctx, "retrieve", json!({ "query": "python" })).await;
    assert_eq!(out["hits"][0]["doc_id"].as_str().unwrap(), "B");
}

#[tokio::test]
async fn test_checkout_unknown_target() {
    let (_tmp, ctx) = setup().await;
    let env = call(&ctx, "checkout_index", json!({ "target": "no-such-ref" })).await;
    assert_eq!(err_code(&env), "ERR_REF_NOT_FOUND");
    assert!(env.result.is_null());
}

#[tokio::test]
async fn test_update_ref_moves_main() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "one").await;
    let (c1, _) = commit(&ctx).await;
    ingest(&ctx, "A", "two").await;
    let (c2, _) = commit(&ctx).await;

    call_ok(&ctx, "update_ref", json!({ "ref_name": "main", "target": c1 })).await;

    let mut conn = ctx.pool.acquire().await.unwrap();
    let main = dag::resolve_target(&mut conn, "main").await.unwrap();
    assert_eq!(main.as_deref(), Some(c1.as_str()));
    let head = dag::resolve_target(&mut conn, "HEAD").await.unwrap();
    assert_eq!(head.as_deref(), Some(c2.as_str()));
}

// ============ FTS gate + artifact scenarios ============

#[tokio::test]
async fn test_fts_build_and_idempotent_skip() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "rust programming with cargo").await;
    ingest(&ctx, "B", "python machine learning").await;
    commit(&ctx).await;

    let first = call_ok(&ctx, "build_fts_tree", json!({ "ref": "HEAD" })).await;
    assert_eq!(first["status"], "built");
    assert_eq!(first["chunk_count"], json!(2));

    let second = call_ok(&ctx, "build_fts_tree", json!({ "ref": "HEAD" })).await;
    assert_eq!(second["status"], "skipped");
    assert_eq!(second["artifact_id"], first["artifact_id"]);
    assert_eq!(second["payload_hash"], first["payload_hash"]);
}

#[tokio::test]
async fn test_fts_drift_detection() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "rust programming with cargo").await;
    ingest(&ctx, "B", "python machine learning").await;
    commit(&ctx).await;
    call_ok(&ctx, "build_fts_tree", json!({ "ref": "HEAD" })).await;

    // Damage the indexed rows behind the artifact's back (gate opened
    // manually, the way no tool ever does).
    sqlx::query("UPDATE fts_maintenance SET enabled = 1 WHERE id = 1")
        .execute(&ctx.pool)
        .await
        .unwrap();
    sqlx::query("DELETE FROM fts_chunks WHERE chunk_id LIKE 'A:%'")
        .execute(&ctx.pool)
        .await
        .unwrap();
    sqlx::query("UPDATE fts_maintenance SET enabled = 0 WHERE id = 1")
        .execute(&ctx.pool)
        .await
        .unwrap();

    let env = call(&ctx, "build_fts_tree", json!({ "ref": "HEAD" })).await;
    assert_eq!(err_code(&env), "ERR_ARTIFACT_DRIFT");
}

#[tokio::test]
async fn test_fts_gate_blocks_direct_writes() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "gate test content").await;
    commit(&ctx).await;
    call_ok(&ctx, "build_fts_tree", json!({ "ref": "HEAD" })).await;

    // INSERT while closed
    let insert = sqlx::query(
        "INSERT INTO fts_chunks (id, tree_hash, chunk_id, content_hash, text) VALUES (1, 't', 'c', 'h', 'x')",
    )
    .execute(&ctx.pool)
    .await;
    assert!(insert.is_err(), "gate must reject inserts while closed");

    // DELETE while closed
    let delete = sqlx::query("DELETE FROM fts_chunks")
        .execute(&ctx.pool)
        .await;
    assert!(delete.is_err(), "gate must reject deletes while closed");

    // UPDATE is rejected regardless of the gate
    sqlx::query("UPDATE fts_maintenance SET enabled = 1 WHERE id = 1")
        .execute(&ctx.pool)
        .await
        .unwrap();
    let update = sqlx::query("UPDATE fts_chunks SET text = 'tampered'")
        .execute(&ctx.pool)
        .await;
    assert!(update.is_err(), "fts_chunks rows must be immutable");
    sqlx::query("UPDATE fts_maintenance SET enabled = 0 WHERE id = 1")
        .execute(&ctx.pool)
        .await
        .unwrap();

    // The singleton can be neither duplicated nor deleted.
    let second_insert = sqlx::query("INSERT INTO fts_maintenance (id, enabled) VALUES (1, 0)")
        .execute(&ctx.pool)
        .await;
    assert!(second_insert.is_err());
    let gate_delete = sqlx::query("DELETE FROM fts_maintenance")
        .execute(&ctx.pool)
        .await;
    assert!(gate_delete.is_err());
}

#[tokio::test]
async fn test_fts_build_requires_frozen_tree() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "unfrozen tree").await;

    // Assemble a commit by hand without freezing tree_docs/tree_chunks.
    let mut conn = ctx.pool.acquire().await.unwrap();
    let state = dag::create_tree_from_current_state(&mut conn).await.unwrap();
    dag::save_tree(&mut conn, &state.tree_hash, &state.entries_json)
        .await
        .unwrap();
    let commit_hash = dag::create_commit(&mut conn, &state.tree_hash, &[], "")
        .await
        .unwrap();
    dag::update_ref(&mut conn, "HEAD", &commit_hash).await.unwrap();
    drop(conn);

    let env = call(&ctx, "build_fts_tree", json!({ "ref": "HEAD" })).await;
    assert_eq!(err_code(&env), "ERR_NOT_FROZEN");
}

#[tokio::test]
async fn test_validate_fts_after_build() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "validation canary content here").await;
    commit(&ctx).await;
    call_ok(&ctx, "build_fts_tree", json!({ "ref": "HEAD" })).await;

    let report = call_ok(&ctx, "validate_fts", json!({ "ref": "HEAD", "deep": true })).await;
    assert_eq!(report["ok"], json!(true), "checks: {}", report["checks"]);

    // bundle_hash is stable across runs.
    let again = call_ok(&ctx, "validate_fts", json!({ "ref": "HEAD" })).await;
    assert_eq!(report["bundle_hash"], again["bundle_hash"]);
}

#[tokio::test]
async fn test_fts_rebuild_reproduces_artifact_identity() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "reproducible artifact").await;
    commit(&ctx).await;

    let first = call_ok(&ctx, "build_fts_tree", json!({ "ref": "HEAD" })).await;

    // Force a full rebuild; identity and payload must be unchanged.
    sqlx::query("DELETE FROM index_artifacts").execute(&ctx.pool).await.unwrap();
    let rebuilt = call_ok(
        &ctx,
        "build_fts_tree",
        json!({ "ref": "HEAD", "force_rebuild": true }),
    )
    .await;
    assert_eq!(rebuilt["status"], "built");
    assert_eq!(rebuilt["artifact_id"], first["artifact_id"]);
    assert_eq!(rebuilt["payload_hash"], first["payload_hash"]);
}

// ============ Embeddings + hybrid retrieval ============

#[tokio::test]
async fn test_build_embeddings_requires_clean_working_tree() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "embed me").await;
    commit(&ctx).await;
    ingest(&ctx, "A", "now the working tree is dirty").await;

    let env = call(&ctx, "build_embeddings", json!({ "ref": "HEAD" })).await;
    assert_eq!(err_code(&env), "ERR_WORKING_TREE_DIRTY");
}

#[tokio::test]
async fn test_hybrid_requires_embeddings_artifact() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "no vectors yet").await;
    commit(&ctx).await;

    let env = call(
        &ctx,
        "retrieve_with_embeddings",
        json!({ "query": "vectors", "ref": "HEAD" }),
    )
    .await;
    assert_eq!(err_code(&env), "ERR_EMBEDDINGS_NOT_FOUND");
}

#[tokio::test]
async fn test_embeddings_artifact_shape() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "first chunk text").await;
    ingest(&ctx, "B", "second chunk text").await;
    commit(&ctx).await;

    let report = call_ok(&ctx, "build_embeddings", json!({ "ref": "HEAD" })).await;
    assert_eq!(report["chunk_count"], json!(2));
    assert_eq!(report["dims"], json!(8));
    assert_eq!(report["model_id"], "local-sha256");

    // Every stored vector blob has dims * 4 bytes.
    let rows = sqlx::query("SELECT dims, vector FROM chunk_embeddings")
        .fetch_all(&ctx.pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    for row in rows {
        let dims: i64 = row.get("dims");
        let blob: Vec<u8> = row.get("vector");
        assert_eq!(blob.len() as i64, dims * 4);
    }
}

#[tokio::test]
async fn test_hybrid_alpha_extremes_and_blend() {
    let (_tmp, ctx) = setup().await;

    // Three single-chunk docs with distinct BM25 affinity for the query.
    ingest(&ctx, "high", "saffron saffron saffron spice").await;
    ingest(&ctx, "mid", "saffron and other spices in the rack").await;
    ingest(
        &ctx,
        "low",
        "a long note about cooking herbs and one mention of saffron among many other words entirely",
    )
    .await;
    commit(&ctx).await;
    call_ok(&ctx, "build_embeddings", json!({ "ref": "HEAD" })).await;

    let query = "saffron";

    // Expected BM25 ordering from the pure working-tree path.
    let bm25 = call_ok(&ctx, "retrieve", json!({ "query": query })).await;
    let bm25_order: Vec<String> = bm25["hits"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["chunk_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(bm25_order.len(), 3);

    // Expected cosine ordering computed from the same deterministic provider.
    let provider = ctx.registry.get("local").unwrap();
    let qv = provider.embed(&[query.to_string()], None).await.unwrap().vectors[0].clone();
    let rows = sqlx::query("SELECT chunk_id, text FROM chunks ORDER BY chunk_id ASC")
        .fetch_all(&ctx.pool)
        .await
        .unwrap();
    let mut cosine: Vec<(String, f32)> = Vec::new();
    for row in &rows {
        let text: String = row.get("text");
        let cv = provider.embed(&[text], None).await.unwrap().vectors[0].clone();
        cosine.push((row.get("chunk_id"), cosine_similarity(&qv, &cv)));
    }
    cosine.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then_with(|| a.0.cmp(&b.0)));
    let cosine_order: Vec<String> = cosine.iter().map(|(id, _)| id.clone()).collect();

    // α = 1 reproduces pure BM25 order.
    let hybrid = call_ok(
        &ctx,
        "retrieve_with_embeddings",
        json!({ "query": query, "ref": "HEAD", "alpha": 1.0 }),
    )
    .await;
    let order: Vec<String> = hybrid["hits"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["chunk_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(order, bm25_order, "alpha=1 must equal pure BM25 ordering");

    // α = 0 reproduces pure cosine order.
    let hybrid = call_ok(
        &ctx,
        "retrieve_with_embeddings",
        json!({ "query": query, "ref": "HEAD", "alpha": 0.0 }),
    )
    .await;
    let order: Vec<String> = hybrid["hits"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["chunk_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(order, cosine_order, "alpha=0 must equal pure cosine ordering");

    // α = 0.5: per-hit scores decompose into the two normalized signals.
    let hybrid = call_ok(
        &ctx,
        "retrieve_with_embeddings",
        json!({ "query": query, "ref": "HEAD", "alpha": 0.5 }),
    )
    .await;
    for hit in hybrid["hits"].as_array().unwrap() {
        let score = hit["score"].as_f64().unwrap();
        let b = hit["bm25_score"].as_f64().unwrap();
        let c = hit["cosine_score"].as_f64().unwrap();
        assert!((score - (0.5 * b + 0.5 * c)).abs() < 1e-9);
    }

    // Determinism: same call, same ordering and scores.
    let again = call_ok(
        &ctx,
        "retrieve_with_embeddings",
        json!({ "query": query, "ref": "HEAD", "alpha": 0.5 }),
    )
    .await;
    assert_eq!(hybrid["hits"], again["hits"]);
}

// ============ GC ============

#[tokio::test]
async fn test_gc_keeps_only_reachable_artifacts() {
    let (_tmp, ctx) = setup().await;

    ingest(&ctx, "A", "version one").await;
    let (c1, t1) = commit(&ctx).await;
    call_ok(&ctx, "build_embeddings", json!({ "ref": "HEAD" })).await;

    ingest(&ctx, "A", "version two").await;
    let (_c2, t2) = commit(&ctx).await;
    call_ok(&ctx, "build_embeddings", json!({ "ref": "HEAD" })).await;

    // Pin main to the first commit; C2 becomes unreachable from it.
    call_ok(&ctx, "update_ref", json!({ "ref_name": "main", "target": c1 })).await;

    let plan = call_ok(
        &ctx,
        "gc_artifacts",
        json!({ "mode": "dry_run", "keep_refs": ["main"] }),
    )
    .await;
    let planned: Vec<&str> = plan["delete_artifacts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["tree_hash"].as_str().unwrap())
        .collect();
    assert!(planned.contains(&t2.as_str()));
    assert!(!planned.contains(&t1.as_str()));

    // Dry run must not delete anything.
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_artifacts")
        .fetch_one(&ctx.pool)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let report = call_ok(
        &ctx,
        "gc_artifacts",
        json!({ "mode": "commit", "keep_refs": ["main"] }),
    )
    .await;
    assert_eq!(report["deleted"], json!(true));

    // Only the reachable tree's artifact and vectors survive.
    let surviving: Vec<String> = sqlx::query_scalar("SELECT tree_hash FROM index_artifacts")
        .fetch_all(&ctx.pool)
        .await
        .unwrap();
    assert_eq!(surviving, vec![t1.clone()]);
    let vector_trees: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT tree_hash FROM chunk_embeddings")
            .fetch_all(&ctx.pool)
            .await
            .unwrap();
    assert_eq!(vector_trees, vec![t1]);
}

#[tokio::test]
async fn test_gc_unknown_keep_ref() {
    let (_tmp, ctx) = setup().await;
    let env = call(
        &ctx,
        "gc_artifacts",
        json!({ "mode": "dry_run", "keep_refs": ["release"] }),
    )
    .await;
    assert_eq!(err_code(&env), "ERR_REF_NOT_FOUND");
}

// ============ Scheduler ============

#[tokio::test]
async fn test_schedule_task_dry_run_is_deterministic() {
    let (_tmp, ctx) = setup().await;

    let input = json!({
        "title": "Reindex",
        "action": "Build-FTS",
        "payload": { "ref": "HEAD" },
        "run_at": "2024-06-01T00:00:00Z",
        "mode": "dry_run",
    });
    let a = call_ok(&ctx, "schedule_task", input.clone()).await;
    let b = call_ok(&ctx, "schedule_task", input).await;
    assert_eq!(a["task_id"], b["task_id"]);
    assert_eq!(a["status"], "planned");

    // Nothing was persisted.
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
        .fetch_one(&ctx.pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_schedule_task_commit_and_idempotent_hit() {
    let (_tmp, ctx) = setup().await;

    let missing_key = call(
        &ctx,
        "schedule_task",
        json!({
            "title": "T", "action": "a",
            "run_at": "2024-06-01T00:00:00Z",
            "mode": "commit",
        }),
    )
    .await;
    assert_eq!(err_code(&missing_key), "ERR_IDEMPOTENCY_REQUIRED");

    let input = json!({
        "title": "Reindex",
        "action": "build-fts",
        "payload": { "ref": "HEAD" },
        "run_at": "2024-06-01T00:00:00Z",
        "mode": "commit",
        "idempotency_key": "reindex-head",
    });
    let first = call_ok(&ctx, "schedule_task", input.clone()).await;
    assert_eq!(first["status"], "scheduled");

    let second = call_ok(&ctx, "schedule_task", input).await;
    assert_eq!(second["status"], "idempotent_hit");
    assert_eq!(second["task_id"], first["task_id"]);
    assert_eq!(second["task"], first["task"], "replay must return the stored record");
}

#[tokio::test]
async fn test_schedule_task_determinism_errors() {
    let (_tmp, ctx) = setup().await;

    let env = call(
        &ctx,
        "schedule_task",
        json!({ "title": "T", "action": "a", "interval_seconds": 60 }),
    )
    .await;
    assert_eq!(err_code(&env), "ERR_DETERMINISM");

    let env = call(&ctx, "schedule_task", json!({ "title": "T", "action": "a" })).await;
    assert_eq!(err_code(&env), "ERR_INVALID_SCHEDULE");
}

#[tokio::test]
async fn test_pending_queue_orders_by_next_run_at() {
    let (_tmp, ctx) = setup().await;

    for (key, run_at) in [
        ("later", "2024-06-02T00:00:00Z"),
        ("sooner", "2024-06-01T00:00:00Z"),
    ] {
        call_ok(
            &ctx,
            "schedule_task",
            json!({
                "title": key, "action": "run",
                "run_at": run_at,
                "mode": "commit",
                "idempotency_key": key,
            }),
        )
        .await;
    }

    let listing = call_ok(&ctx, "list_tasks", json!({})).await;
    let titles: Vec<&str> = listing["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles, vec!["sooner", "later"]);
}

// ============ Envelope + audit ============

#[tokio::test]
async fn test_envelope_hashes_and_audit_log() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "audited content").await;

    let a = call(
        &ctx,
        "retrieve",
        json!({ "query": "audited", "request_id": "req-a" }),
    )
    .await;
    let b = call(
        &ctx,
        "retrieve",
        json!({ "query": "audited", "request_id": "req-b" }),
    )
    .await;

    // Equal results hash equally even across distinct requests.
    assert_eq!(a.outputs_hash, b.outputs_hash);
    assert_eq!(a.request_id, "req-a");

    let logged: Vec<String> = sqlx::query_scalar("SELECT request_id FROM audit_log ORDER BY request_id")
        .fetch_all(&ctx.pool)
        .await
        .unwrap();
    assert!(logged.contains(&"req-a".to_string()));
    assert!(logged.contains(&"req-b".to_string()));

    // The stored envelope is the envelope we returned.
    let stored: String =
        sqlx::query_scalar("SELECT envelope_json FROM audit_log WHERE request_id = 'req-a'")
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    let parsed: Value = serde_json::from_str(&stored).unwrap();
    assert_eq!(parsed["outputs_hash"].as_str().unwrap(), a.outputs_hash);
}

#[tokio::test]
async fn test_retrieve_warnings() {
    let (_tmp, ctx) = setup().await;
    ingest(&ctx, "A", "warning probe").await;

    // No commits yet.
    let env = call(&ctx, "retrieve", json!({ "query": "probe" })).await;
    assert!(env.warnings.iter().any(|w| w.code == "WARN_NO_COMMITS"));

    // Clean after a commit.
    commit(&ctx).await;
    let env = call(&ctx, "retrieve", json!({ "query": "probe" })).await;
    assert!(env.warnings.is_empty());

    // Dirty after mutation.
    ingest(&ctx, "A", "mutated probe").await;
    let env = call(&ctx, "retrieve", json!({ "query": "probe" })).await;
    assert!(env
        .warnings
        .iter()
        .any(|w| w.code == "WARN_WORKING_TREE_DIRTY"));

    // Version mismatch against an explicit stale version.
    let env = call(
        &ctx,
        "retrieve",
        json!({ "query": "probe", "index_version": "0000000000000000000000000000000000000000000000000000000000000000" }),
    )
    .await;
    assert!(env
        .warnings
        .iter()
        .any(|w| w.code == "WARN_VERSION_MISMATCH"));
}

#[tokio::test]
async fn test_unknown_tool_is_enveloped() {
    let (_tmp, ctx) = setup().await;
    let env = call(&ctx, "no_such_tool", json!({})).await;
    assert_eq!(err_code(&env), "ERR_TOOL_FAILURE");
    assert!(env.result.is_null());
}

// ============ Gate machinery helpers ============

#[tokio::test]
async fn test_gate_open_close_round_trip() {
    let (_tmp, ctx) = setup().await;

    let mut conn = ctx.pool.acquire().await.unwrap();
    fts::open_gate(&mut conn).await.unwrap();
    let enabled: i64 = sqlx::query_scalar("SELECT enabled FROM fts_maintenance WHERE id = 1")
        .fetch_one(&mut *conn)
        .await
        .unwrap();
    assert_eq!(enabled, 1);
    fts::close_gate(&mut conn).await.unwrap();
    let enabled: i64 = sqlx::query_scalar("SELECT enabled FROM fts_maintenance WHERE id = 1")
        .fetch_one(&mut *conn)
        .await
        .unwrap();
    assert_eq!(enabled, 0);
}
