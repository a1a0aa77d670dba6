//! # Index Harness CLI (`idx`)
//!
//! The `idx` binary is the primary interface for Index Harness. Every
//! command below maps onto one tool of the audit-enveloped tool surface;
//! the printed output *is* the envelope, so scripted callers get the same
//! contract as the HTTP server.
//!
//! ## Commands
//!
//! | Command | Tool |
//! |---------|------|
//! | `idx init` | — (schema migrations) |
//! | `idx ingest <doc_id>` | `ingest_document` |
//! | `idx drop <doc_id>` | `drop_document` |
//! | `idx commit` | `commit_index` |
//! | `idx checkout <target>` | `checkout_index` |
//! | `idx diff <from> <to>` | `diff_index` |
//! | `idx update-ref <name> <target>` | `update_ref` |
//! | `idx search "<query>"` | `retrieve` / `retrieve_with_embeddings` |
//! | `idx fts build\|validate` | `build_fts_tree` / `validate_fts` |
//! | `idx embed build` | `build_embeddings` |
//! | `idx gc` | `gc_artifacts` |
//! | `idx task schedule\|list` | `schedule_task` / `list_tasks` |
//! | `idx serve` | — (HTTP tool server) |
//!
//! ## Examples
//!
//! ```bash
//! idx init
//! idx ingest runbook --title "Deploy runbook" --file ./docs/deploy.md
//! idx commit --message "initial snapshot"
//! idx fts build HEAD
//! idx embed build HEAD
//! idx search "rollback procedure" --hybrid --alpha 0.5
//! idx gc --mode dry_run
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use index_harness::config::{self, Config};
use index_harness::db;
use index_harness::embedding::ProviderRegistry;
use index_harness::migrate;
use index_harness::server;
use index_harness::tools::{run_tool, ToolContext};

/// Index Harness — a deterministic, content-addressed document index with
/// versioned snapshots and hybrid retrieval for AI tools.
#[derive(Parser)]
#[command(
    name = "idx",
    about = "Index Harness — a content-addressed document index with versioned snapshots and hybrid retrieval",
    version,
    long_about = "Index Harness keeps documents and their chunks in a git-like content-addressed DAG, \
    builds history-correct FTS and embedding artifacts per committed tree, and serves BM25 and \
    hybrid retrieval with provenance through an audit-enveloped tool surface."
)]
struct Cli {
    /// Path to configuration file (TOML). When omitted, configuration is
    /// read from the environment (IDX_DB_PATH, OPENAI_API_KEY, ...).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates all tables, FTS5 virtual tables, gate triggers, and the
    /// maintenance singleton. Idempotent.
    Init,

    /// Ingest a document into the working tree.
    Ingest {
        /// Working document id.
        doc_id: String,
        /// Human-readable title.
        #[arg(long)]
        title: Option<String>,
        /// Read the document body from this file.
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
        /// Document body given inline.
        #[arg(long)]
        text: Option<String>,
    },

    /// Remove a document from the working tree.
    Drop {
        doc_id: String,
    },

    /// Freeze the working tree into a commit and advance HEAD/main.
    Commit {
        /// Commit message (recorded, not part of the commit identity).
        #[arg(long, short)]
        message: Option<String>,
    },

    /// Materialize a committed tree into the working tables.
    Checkout {
        /// Ref name or full commit hash.
        target: String,
    },

    /// Document-level diff between two commits.
    Diff {
        from: String,
        to: String,
    },

    /// Point a ref at a commit.
    UpdateRef {
        ref_name: String,
        target: String,
    },

    /// Search indexed chunks.
    Search {
        /// The search query string.
        query: String,
        /// Maximum number of results (1..=25).
        #[arg(long)]
        k: Option<i64>,
        /// Use hybrid BM25 + cosine retrieval over a committed tree.
        #[arg(long)]
        hybrid: bool,
        /// Target ref for hybrid retrieval.
        #[arg(long, default_value = "HEAD")]
        r#ref: String,
        /// Embedding provider id for hybrid retrieval.
        #[arg(long)]
        provider: Option<String>,
        /// BM25 weight α in [0, 1]; cosine gets 1−α.
        #[arg(long)]
        alpha: Option<f64>,
        /// BM25 candidate pool size (≤200).
        #[arg(long)]
        bm25_k: Option<i64>,
        /// Vector candidate pool size (≤500).
        #[arg(long)]
        vector_k: Option<i64>,
        /// Query embedding dimensions override.
        #[arg(long)]
        dimensions: Option<usize>,
    },

    /// Per-tree FTS artifact lifecycle.
    Fts {
        #[command(subcommand)]
        action: FtsAction,
    },

    /// Embedding artifact lifecycle.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Prune artifacts not reachable from kept refs.
    Gc {
        /// `dry_run` (default) or `commit`.
        #[arg(long, default_value = "dry_run")]
        mode: String,
        /// Refs anchoring the reachable set (repeatable). All refs when omitted.
        #[arg(long = "keep-ref")]
        keep_refs: Vec<String>,
        /// Restrict deletion to these artifact kinds (repeatable).
        #[arg(long = "kind")]
        kinds: Vec<String>,
    },

    /// Durable task records.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Start the HTTP tool server.
    Serve,
}

/// FTS subcommands.
#[derive(Subcommand)]
enum FtsAction {
    /// Build the history-correct FTS artifact for a committed tree.
    Build {
        /// Ref name or commit hash.
        #[arg(default_value = "HEAD")]
        reference: String,
        /// Reset leftover index rows for the tree before rebuilding.
        #[arg(long)]
        force: bool,
    },
    /// Attest gate triggers, counts, and index integrity for a tree.
    Validate {
        #[arg(default_value = "HEAD")]
        reference: String,
        /// Also run the rowid-level index audit.
        #[arg(long)]
        deep: bool,
    },
}

/// Embedding subcommands.
#[derive(Subcommand)]
enum EmbedAction {
    /// Embed a committed tree's chunks and register the artifact.
    Build {
        #[arg(default_value = "HEAD")]
        reference: String,
        /// Embedding provider id (defaults to the configured provider).
        #[arg(long)]
        provider: Option<String>,
        /// Texts per provider call (1..=2048).
        #[arg(long)]
        batch_size: Option<usize>,
        /// Vector dimensions override.
        #[arg(long)]
        dimensions: Option<usize>,
    },
}

/// Task subcommands.
#[derive(Subcommand)]
enum TaskAction {
    /// Plan or persist a task record.
    Schedule {
        #[arg(long)]
        title: String,
        #[arg(long)]
        action: String,
        /// Task payload as a JSON document.
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Explicit next run time (RFC 3339). Wins over --interval.
        #[arg(long)]
        run_at: Option<String>,
        /// Interval in seconds, resolved against --reference-time.
        #[arg(long)]
        interval: Option<i64>,
        /// Deterministic base time for --interval (RFC 3339).
        #[arg(long)]
        reference_time: Option<String>,
        /// `dry_run` (default) or `commit`.
        #[arg(long, default_value = "dry_run")]
        mode: String,
        /// Required in commit mode; fixes the task identity.
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// List pending tasks ordered by next_run_at.
    List {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::from_env(),
    };

    let pool = db::connect(&cfg).await?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&pool).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let ctx = ToolContext {
        pool,
        registry: Arc::new(ProviderRegistry::from_config(&cfg.embedding)),
        config: Arc::new(cfg),
    };

    let (tool, input) = match cli.command {
        Commands::Init => unreachable!(),
        Commands::Ingest {
            doc_id,
            title,
            file,
            text,
        } => {
            let body = match (file, text) {
                (Some(path), None) => std::fs::read_to_string(&path)?,
                (None, Some(text)) => text,
                (None, None) => anyhow::bail!("ingest requires --file or --text"),
                (Some(_), Some(_)) => unreachable!("clap enforces the conflict"),
            };
            (
                "ingest_document",
                json!({ "doc_id": doc_id, "title": title, "text": body }),
            )
        }
        Commands::Drop { doc_id } => ("drop_document", json!({ "doc_id": doc_id })),
        Commands::Commit { message } => ("commit_index", json!({ "message": message })),
        Commands::Checkout { target } => ("checkout_index", json!({ "target": target })),
        Commands::Diff { from, to } => ("diff_index", json!({ "from": from, "to": to })),
        Commands::UpdateRef { ref_name, target } => {
            ("update_ref", json!({ "ref_name": ref_name, "target": target }))
        }
        Commands::Search {
            query,
            k,
            hybrid,
            r#ref,
            provider,
            alpha,
            bm25_k,
            vector_k,
            dimensions,
        } => {
            if hybrid {
                let alpha = alpha.unwrap_or(ctx.config.retrieval.hybrid_alpha);
                (
                    "retrieve_with_embeddings",
                    json!({
                        "query": query,
                        "k": k,
                        "ref": r#ref,
                        "provider_id": provider,
                        "alpha": alpha,
                        "bm25_k": bm25_k,
                        "vector_k": vector_k,
                        "dimensions": dimensions,
                    }),
                )
            } else {
                ("retrieve", json!({ "query": query, "k": k }))
            }
        }
        Commands::Fts { action } => match action {
            FtsAction::Build { reference, force } => (
                "build_fts_tree",
                json!({ "ref": reference, "force_rebuild": force }),
            ),
            FtsAction::Validate { reference, deep } => {
                ("validate_fts", json!({ "ref": reference, "deep": deep }))
            }
        },
        Commands::Embed { action } => match action {
            EmbedAction::Build {
                reference,
                provider,
                batch_size,
                dimensions,
            } => (
                "build_embeddings",
                json!({
                    "ref": reference,
                    "provider_id": provider,
                    "batch_size": batch_size,
                    "dimensions": dimensions,
                }),
            ),
        },
        Commands::Gc {
            mode,
            keep_refs,
            kinds,
        } => (
            "gc_artifacts",
            json!({
                "mode": mode,
                "keep_refs": if keep_refs.is_empty() { None } else { Some(keep_refs) },
                "kinds": if kinds.is_empty() { None } else { Some(kinds) },
            }),
        ),
        Commands::Task { action } => match action {
            TaskAction::Schedule {
                title,
                action,
                payload,
                run_at,
                interval,
                reference_time,
                mode,
                idempotency_key,
            } => {
                let payload: serde_json::Value = serde_json::from_str(&payload)
                    .map_err(|e| anyhow::anyhow!("--payload is not valid JSON: {}", e))?;
                (
                    "schedule_task",
                    json!({
                        "title": title,
                        "action": action,
                        "payload": payload,
                        "run_at": run_at,
                        "interval_seconds": interval,
                        "reference_time": reference_time,
                        "mode": mode,
                        "idempotency_key": idempotency_key,
                    }),
                )
            }
            TaskAction::List { limit } => ("list_tasks", json!({ "limit": limit })),
        },
        Commands::Serve => {
            server::run_server(ctx).await?;
            return Ok(());
        }
    };

    let envelope = run_tool(&ctx, tool, input).await;
    println!("{}", serde_json::to_string_pretty(&envelope)?);

    if !envelope.errors.is_empty() {
        std::process::exit(1);
    }

    Ok(())
}
