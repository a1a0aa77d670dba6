//! Core data types shared across the index.
//!
//! The data lifecycle is:
//!
//! ```text
//! ingest → documents/chunks (working) → create_tree → trees/tree_docs/tree_chunks
//!                                             ↓
//!                                          commits → refs
//!                                             ↓
//!                              build_fts_tree / build_embeddings → index_artifacts
//!                                             ↓
//!                                retrieve / retrieve_with_embeddings
//! ```
//!
//! Identity is always canonical JSON + SHA-256 (see [`crate::canon`]):
//! a [`TreeEntry`] list hashes to a tree, `{parents, tree_hash}` hashes to
//! a commit, and artifact manifests hash to artifact ids.

use serde::{Deserialize, Serialize};

/// A single row of a tree snapshot: one chunk of one document.
///
/// Trees are identified by the SHA-256 of the canonical JSON of their
/// sorted entry list, so field names here are part of the on-disk
/// contract. Entries sort by `(doc_id ASC, chunk_id ASC)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Working document id.
    pub doc_id: String,
    /// SHA-256 of the full document text.
    pub doc_content_hash: String,
    /// Document title, omitted from the canonical form when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Chunk id within the document.
    pub chunk_id: String,
    /// SHA-256 of the chunk text.
    pub chunk_content_hash: String,
    /// Byte offset of the chunk within the document text.
    pub span_start: i64,
    /// Exclusive end byte offset.
    pub span_end: i64,
}

/// A working-tree chunk as produced by the chunker and stored in `chunks`.
///
/// Invariant: `text == doc_text[span_start..span_end]` whenever the parent
/// document is materialized, and `content_hash == sha256(text)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub span_start: i64,
    pub span_end: i64,
    pub text: String,
    pub content_hash: String,
}

/// Result of hashing the working tables into a tree shape.
#[derive(Debug, Clone, Serialize)]
pub struct TreeState {
    pub tree_hash: String,
    pub entries_json: String,
    pub row_count: i64,
}

/// Document-level diff between two trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

/// Summary returned by `materialize_tree` (checkout).
#[derive(Debug, Clone, Serialize)]
pub struct MaterializeSummary {
    pub tree_hash: String,
    pub documents: i64,
    pub chunks: i64,
}

/// Artifact kinds registered in `index_artifacts`.
pub const ARTIFACT_KIND_FTS: &str = "fts";
pub const ARTIFACT_KIND_EMBEDDINGS: &str = "chunk_embeddings";

/// The fixed timestamp stored on commits and other replay-deterministic
/// rows. Wall clocks never reach persisted identifiers.
pub const EPOCH_ISO: &str = "1970-01-01T00:00:00.000Z";

/// Ref names with special treatment in artifact anchoring.
pub const REF_HEAD: &str = "HEAD";
pub const REF_MAIN: &str = "main";
