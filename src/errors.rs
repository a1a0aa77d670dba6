//! Tool-surface error taxonomy.
//!
//! Errors are first-class values carried inside the envelope, not
//! exceptions across the boundary. Handlers raise a [`ToolError`] with a
//! stable code through `anyhow`; the envelope layer downcasts it back out.
//! Anything that is not a `ToolError` (I/O, SQL, provider failures)
//! surfaces as `ERR_TOOL_FAILURE` with the underlying message.

use std::fmt;

use thiserror::Error;

/// Stable error codes — the complete tool-surface taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    RefMismatch,
    RefNotFound,
    CommitNotFound,
    TreeNotFound,
    TreeHashMissing,
    TreeDocsMissing,
    TreeChunksMissing,
    TreePayloadMissing,
    BlobMissing,
    DataCorruption,
    NotFrozen,
    DirtyState,
    ArtifactDrift,
    GateMissing,
    RowidCollision,
    FtsIncomplete,
    FtsExtraRows,
    BuildFailed,
    WorkingTreeDirty,
    EmbeddingDims,
    EmbeddingsNotFound,
    InvalidSchedule,
    Determinism,
    IdempotencyRequired,
    ToolFailure,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::RefMismatch => "ERR_REF_MISMATCH",
            ErrorCode::RefNotFound => "ERR_REF_NOT_FOUND",
            ErrorCode::CommitNotFound => "ERR_COMMIT_NOT_FOUND",
            ErrorCode::TreeNotFound => "ERR_TREE_NOT_FOUND",
            ErrorCode::TreeHashMissing => "ERR_TREE_HASH_MISSING",
            ErrorCode::TreeDocsMissing => "ERR_TREE_DOCS_MISSING",
            ErrorCode::TreeChunksMissing => "ERR_TREE_CHUNKS_MISSING",
            ErrorCode::TreePayloadMissing => "ERR_TREE_PAYLOAD_MISSING",
            ErrorCode::BlobMissing => "ERR_BLOB_MISSING",
            ErrorCode::DataCorruption => "ERR_DATA_CORRUPTION",
            ErrorCode::NotFrozen => "ERR_NOT_FROZEN",
            ErrorCode::DirtyState => "ERR_DIRTY_STATE",
            ErrorCode::ArtifactDrift => "ERR_ARTIFACT_DRIFT",
            ErrorCode::GateMissing => "ERR_GATE_MISSING",
            ErrorCode::RowidCollision => "ERR_ROWID_COLLISION",
            ErrorCode::FtsIncomplete => "ERR_FTS_INCOMPLETE",
            ErrorCode::FtsExtraRows => "ERR_FTS_EXTRA_ROWS",
            ErrorCode::BuildFailed => "ERR_BUILD_FAILED",
            ErrorCode::WorkingTreeDirty => "ERR_WORKING_TREE_DIRTY",
            ErrorCode::EmbeddingDims => "ERR_EMBEDDING_DIMS",
            ErrorCode::EmbeddingsNotFound => "ERR_EMBEDDINGS_NOT_FOUND",
            ErrorCode::InvalidSchedule => "ERR_INVALID_SCHEDULE",
            ErrorCode::Determinism => "ERR_DETERMINISM",
            ErrorCode::IdempotencyRequired => "ERR_IDEMPOTENCY_REQUIRED",
            ErrorCode::ToolFailure => "ERR_TOOL_FAILURE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coded tool failure, carried through `anyhow` and recovered at the
/// envelope boundary.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Shorthand for `Err(ToolError { .. }.into())` call sites.
pub fn tool_err(code: ErrorCode, message: impl Into<String>) -> anyhow::Error {
    ToolError::new(code, message).into()
}

/// Extract the stable code and message from a failure. Non-`ToolError`
/// causes collapse to `ERR_TOOL_FAILURE`.
pub fn classify(err: &anyhow::Error) -> (ErrorCode, String) {
    match err.downcast_ref::<ToolError>() {
        Some(te) => (te.code, te.message.clone()),
        None => (ErrorCode::ToolFailure, err.to_string()),
    }
}

/// Warning codes attached to envelopes without failing the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningCode {
    NoCommits,
    WorkingTreeDirty,
    VersionMismatch,
}

impl WarningCode {
    pub fn as_str(self) -> &'static str {
        match self {
            WarningCode::NoCommits => "WARN_NO_COMMITS",
            WarningCode::WorkingTreeDirty => "WARN_WORKING_TREE_DIRTY",
            WarningCode::VersionMismatch => "WARN_VERSION_MISMATCH",
        }
    }
}

/// A warning entry as serialized into the envelope.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Warning {
    pub code: &'static str,
    pub message: String,
}

impl Warning {
    pub fn new(code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_roundtrip_through_anyhow() {
        let err: anyhow::Error = tool_err(ErrorCode::RefNotFound, "no such ref: feature");
        let (code, message) = classify(&err);
        assert_eq!(code, ErrorCode::RefNotFound);
        assert_eq!(message, "no such ref: feature");
    }

    #[test]
    fn test_foreign_error_collapses_to_tool_failure() {
        let err = anyhow::anyhow!("connection reset");
        let (code, message) = classify(&err);
        assert_eq!(code, ErrorCode::ToolFailure);
        assert_eq!(message, "connection reset");
    }

    #[test]
    fn test_code_strings_are_stable() {
        assert_eq!(ErrorCode::ArtifactDrift.as_str(), "ERR_ARTIFACT_DRIFT");
        assert_eq!(ErrorCode::GateMissing.to_string(), "ERR_GATE_MISSING");
        assert_eq!(WarningCode::NoCommits.as_str(), "WARN_NO_COMMITS");
    }
}
