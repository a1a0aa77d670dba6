//! Artifact garbage collection.
//!
//! Roots are the kept refs (or every ref); reachability is a DFS over
//! commit parent lists, projected to tree hashes. Any artifact or stored
//! embedding whose tree is not reachable is a deletion candidate. Dry-run
//! returns the full plan without touching anything; commit mode deletes in
//! FK order: `artifact_refs` → `index_artifacts` → `chunk_embeddings`.
//!
//! GC assumes the single-writer invariant: no concurrent commit is moving
//! refs while the reachable set is computed.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::{BTreeSet, HashSet};

use crate::errors::{tool_err, ErrorCode};
use crate::models::ARTIFACT_KIND_EMBEDDINGS;

/// One artifact slated for (or surviving) deletion.
#[derive(Debug, Clone, Serialize)]
pub struct GcArtifact {
    pub artifact_id: String,
    pub tree_hash: String,
    pub kind: String,
}

/// Full plan returned by [`gc_artifacts`] in both modes.
#[derive(Debug, Clone, Serialize)]
pub struct GcReport {
    pub mode: String,
    pub reachable_refs: Vec<String>,
    pub reachable_commits: Vec<String>,
    pub reachable_trees: Vec<String>,
    pub delete_artifacts: Vec<GcArtifact>,
    pub delete_embedding_trees: Vec<String>,
    pub deleted: bool,
}

/// Compute (and in commit mode apply) the GC plan.
pub async fn gc_artifacts(
    pool: &SqlitePool,
    keep_refs: Option<&[String]>,
    kinds: Option<&[String]>,
    commit_mode: bool,
) -> Result<GcReport> {
    let mut tx = pool.begin().await?;

    // Roots
    let roots: Vec<(String, String)> = match keep_refs {
        Some(names) => {
            let mut resolved = Vec::with_capacity(names.len());
            for name in names {
                let commit: Option<String> =
                    sqlx::query_scalar("SELECT commit_hash FROM refs WHERE ref_name = ?")
                        .bind(name)
                        .fetch_optional(&mut *tx)
                        .await?;
                let commit = commit.ok_or_else(|| {
                    tool_err(ErrorCode::RefNotFound, format!("unknown keep ref: {}", name))
                })?;
                resolved.push((name.clone(), commit));
            }
            resolved
        }
        None => {
            let rows = sqlx::query("SELECT ref_name, commit_hash FROM refs ORDER BY ref_name")
                .fetch_all(&mut *tx)
                .await?;
            rows.iter()
                .map(|r| (r.get("ref_name"), r.get("commit_hash")))
                .collect()
        }
    };

    // DFS over parent lists.
    let mut visited: HashSet<String> = HashSet::new();
    let mut reachable_trees: BTreeSet<String> = BTreeSet::new();
    let mut stack: Vec<String> = roots.iter().map(|(_, c)| c.clone()).collect();

    while let Some(commit_hash) = stack.pop() {
        if !visited.insert(commit_hash.clone()) {
            continue;
        }
        let row = sqlx::query("SELECT tree_hash, parents_json FROM commits WHERE commit_hash = ?")
            .bind(&commit_hash)
            .fetch_optional(&mut *tx)
            .await?;
        let row = row.ok_or_else(|| {
            tool_err(
                ErrorCode::CommitNotFound,
                format!("reachability walk hit unknown commit {}", commit_hash),
            )
        })?;

        reachable_trees.insert(row.get("tree_hash"));

        let parents_json: String = row.get("parents_json");
        let parents: Vec<String> = serde_json::from_str(&parents_json).map_err(|e| {
            tool_err(
                ErrorCode::DataCorruption,
                format!("commit {} has malformed parents: {}", commit_hash, e),
            )
        })?;
        stack.extend(parents);
    }

    let kind_kept = |kind: &str| -> bool {
        match kinds {
            Some(list) => list.iter().any(|k| k == kind),
            None => true,
        }
    };

    // Candidate artifacts
    let rows = sqlx::query("SELECT artifact_id, tree_hash, kind FROM index_artifacts ORDER BY artifact_id")
        .fetch_all(&mut *tx)
        .await?;
    let delete_artifacts: Vec<GcArtifact> = rows
        .iter()
        .map(|r| GcArtifact {
            artifact_id: r.get("artifact_id"),
            tree_hash: r.get("tree_hash"),
            kind: r.get("kind"),
        })
        .filter(|a| !reachable_trees.contains(&a.tree_hash) && kind_kept(&a.kind))
        .collect();

    // Candidate embedding trees
    let delete_embedding_trees: Vec<String> = if kind_kept(ARTIFACT_KIND_EMBEDDINGS) {
        let trees: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT tree_hash FROM chunk_embeddings ORDER BY tree_hash")
                .fetch_all(&mut *tx)
                .await?;
        trees
            .into_iter()
            .filter(|t| !reachable_trees.contains(t))
            .collect()
    } else {
        Vec::new()
    };

    let mut deleted = false;
    if commit_mode {
        for artifact in &delete_artifacts {
            delete_artifact(&mut tx, &artifact.artifact_id).await?;
        }
        for tree in &delete_embedding_trees {
            sqlx::query("DELETE FROM chunk_embeddings WHERE tree_hash = ?")
                .bind(tree)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        deleted = true;
    }

    let mut reachable_commits: Vec<String> = visited.into_iter().collect();
    reachable_commits.sort();

    Ok(GcReport {
        mode: if commit_mode { "commit" } else { "dry_run" }.to_string(),
        reachable_refs: roots.into_iter().map(|(name, _)| name).collect(),
        reachable_commits,
        reachable_trees: reachable_trees.into_iter().collect(),
        delete_artifacts,
        delete_embedding_trees,
        deleted,
    })
}

/// FK order: refs first, then the artifact row.
async fn delete_artifact(conn: &mut SqliteConnection, artifact_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM artifact_refs WHERE artifact_id = ?")
        .bind(artifact_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM index_artifacts WHERE artifact_id = ?")
        .bind(artifact_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
