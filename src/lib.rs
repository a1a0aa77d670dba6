//! # Index Harness
//!
//! **A deterministic, content-addressed document index with versioned
//! snapshots and hybrid retrieval for AI tools.**
//!
//! Index Harness keeps documents and their chunks in a miniature
//! source-control DAG (blobs, trees, commits, refs), derives
//! history-correct FTS and per-model embedding artifacts from committed
//! trees, and serves BM25 and hybrid retrieval with provenance through an
//! audit-enveloped tool surface.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────────┐   ┌───────────────────┐
//! │  ingest    │──▶│  working tables  │──▶│  DAG snapshots    │
//! │ (chunking) │   │ documents/chunks │   │ blobs·trees·refs  │
//! └────────────┘   └────────┬────────┘   └─────────┬─────────┘
//!                           │                      │
//!                     BM25 (chunks_fts)      derived artifacts
//!                           │              fts_chunks · embeddings
//!                           ▼                      ▼
//!                      ┌─────────────────────────────┐
//!                      │  tool surface (envelopes)   │
//!                      │        CLI  ·  HTTP         │
//!                      └─────────────────────────────┘
//! ```
//!
//! ## Determinism
//!
//! Every persisted identity — tree hashes, commit hashes, artifact ids,
//! task ids, envelope input/output hashes — derives from canonical JSON
//! (sorted keys, no whitespace) fed to SHA-256. Timestamps never reach
//! identities: commits are pinned to the epoch, and replaying the same
//! inserts into a fresh database reproduces every hash.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`canon`] | Canonical JSON codec and SHA-256 helpers |
//! | [`models`] | Core data types: `TreeEntry`, `Chunk`, diff/checkout shapes |
//! | [`config`] | TOML + environment configuration |
//! | [`db`] | SQLite pool (WAL, foreign keys) |
//! | [`migrate`] | Schema migrations (idempotent) |
//! | [`chunk`] | Span-exact paragraph chunker |
//! | [`ingest`] | Working-tree document upsert and rechunking |
//! | [`dag`] | Blobs, trees, commits, refs; checkout; diff |
//! | [`fts`] | Per-tree FTS builder, maintenance gate, validator |
//! | [`embedding`] | Provider trait, local + HTTP providers, vector utils |
//! | [`embed_build`] | Embedding artifact builder |
//! | [`search`] | Working-tree BM25 and committed-tree hybrid retrieval |
//! | [`gc`] | Reachability-based artifact pruning |
//! | [`scheduler`] | Durable, idempotent task records |
//! | [`envelope`] | Audit envelope and best-effort audit log |
//! | [`tools`] | Tool contracts and dispatch |
//! | [`server`] | HTTP tool server (Axum) |

pub mod canon;
pub mod chunk;
pub mod config;
pub mod dag;
pub mod db;
pub mod embed_build;
pub mod embedding;
pub mod envelope;
pub mod errors;
pub mod fts;
pub mod gc;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod scheduler;
pub mod search;
pub mod server;
pub mod tools;
