//! Deterministic audit envelope.
//!
//! Every tool call returns the same record shape, carrying canonical-JSON
//! hashes of its input and of its result. `outputs_hash` covers `result`
//! alone — never the request id or timestamp — so equal results hash
//! equally across distinct requests.
//!
//! The audit-log append is a best-effort side effect performed after the
//! envelope is built: a failed append is logged and swallowed, never
//! surfaced to the caller.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::canon::hash_value;
use crate::errors::{classify, Warning};

/// Version stamped on every envelope for the tool contract itself.
pub const TOOL_VERSION: &str = "1.0.0";

/// One error entry inside an envelope.
#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeError {
    pub code: String,
    pub message: String,
}

/// Envelope metrics; the timestamp is informational and excluded from all
/// hashes.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub timestamp: String,
}

/// The uniform tool response record.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub request_id: String,
    pub tool_name: String,
    pub tool_version: String,
    pub server_version: String,
    pub inputs_hash: String,
    pub outputs_hash: String,
    pub result: Value,
    pub provenance: Vec<Value>,
    pub warnings: Vec<Warning>,
    pub errors: Vec<EnvelopeError>,
    pub metrics: Metrics,
}

/// Successful tool output before enveloping.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub result: Value,
    pub provenance: Vec<Value>,
    pub warnings: Vec<Warning>,
}

/// Wrap a handler outcome (or failure) into the envelope shape.
pub fn build_envelope(
    tool_name: &str,
    request_id: String,
    input: &Value,
    outcome: anyhow::Result<ToolOutcome>,
) -> Envelope {
    let inputs_hash = hash_value(input);

    let (result, provenance, warnings, errors) = match outcome {
        Ok(outcome) => (outcome.result, outcome.provenance, outcome.warnings, Vec::new()),
        Err(err) => {
            let (code, message) = classify(&err);
            (
                Value::Null,
                Vec::new(),
                Vec::new(),
                vec![EnvelopeError {
                    code: code.as_str().to_string(),
                    message,
                }],
            )
        }
    };

    let outputs_hash = hash_value(&result);

    Envelope {
        request_id,
        tool_name: tool_name.to_string(),
        tool_version: TOOL_VERSION.to_string(),
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        inputs_hash,
        outputs_hash,
        result,
        provenance,
        warnings,
        errors,
        metrics: Metrics {
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        },
    }
}

/// Best-effort audit append: keeps the last-written envelope per request
/// id. Failures are logged and dropped so the reply is never lost.
pub async fn append_audit(pool: &SqlitePool, envelope: &Envelope) {
    let payload = match serde_json::to_string(envelope) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("audit append skipped, envelope not serializable: {}", e);
            return;
        }
    };

    let result = sqlx::query(
        r#"
        INSERT OR REPLACE INTO audit_log
            (request_id, tool_name, inputs_hash, outputs_hash, envelope_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&envelope.request_id)
    .bind(&envelope.tool_name)
    .bind(&envelope.inputs_hash)
    .bind(&envelope.outputs_hash)
    .bind(&payload)
    .bind(&envelope.metrics.timestamp)
    .execute(pool)
    .await;

    if let Err(e) = result {
        tracing::warn!("audit append failed for {}: {}", envelope.request_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{tool_err, ErrorCode};
    use serde_json::json;

    #[test]
    fn test_equal_results_hash_equally() {
        let a = build_envelope(
            "retrieve",
            "req-1".to_string(),
            &json!({"query": "x"}),
            Ok(ToolOutcome {
                result: json!({"hits": [1, 2]}),
                ..Default::default()
            }),
        );
        let b = build_envelope(
            "retrieve",
            "req-2".to_string(),
            &json!({"query": "y"}),
            Ok(ToolOutcome {
                result: json!({"hits": [1, 2]}),
                ..Default::default()
            }),
        );
        assert_eq!(a.outputs_hash, b.outputs_hash);
        assert_ne!(a.inputs_hash, b.inputs_hash);
    }

    #[test]
    fn test_error_envelope_has_null_result() {
        let env = build_envelope(
            "checkout_index",
            "req-1".to_string(),
            &json!({"target": "nope"}),
            Err(tool_err(ErrorCode::RefNotFound, "unknown ref")),
        );
        assert!(env.result.is_null());
        assert_eq!(env.errors.len(), 1);
        assert_eq!(env.errors[0].code, "ERR_REF_NOT_FOUND");
        assert_eq!(env.outputs_hash, hash_value(&Value::Null));
    }
}
