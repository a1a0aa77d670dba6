//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and two concrete variants:
//! - **[`LocalHashProvider`]** — deterministic vectors derived from
//!   SHA-256 of `(text, dims)` alone. No network, reproducible anywhere;
//!   the default when no API key is configured.
//! - **[`OpenAiProvider`]** — an OpenAI-compatible HTTP client with
//!   batching, retry, and exponential backoff.
//!
//! Providers are collected into a read-only [`ProviderRegistry`] at
//! startup and addressed by id from the tool surface.
//!
//! Also provides the vector utilities shared by the artifact builder and
//! the retriever:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`] — decode a stored BLOB back into a `Vec<f32>`
//!
//! # Provider contract
//!
//! `embed(inputs, dimensions?)` must return one vector per input, in
//! input order, all with the same non-zero length. The artifact builder
//! re-checks this and rejects violations rather than storing mixed-dims
//! artifacts.
//!
//! # Retry strategy (HTTP provider)
//!
//! Transport errors, HTTP 429, and 5xx responses are retryable; every
//! other status fails the batch outright. Retries sleep through a
//! doubling delay ladder starting at one second and capped at 32s, for
//! at most `max_retries` extra attempts.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EmbeddingConfig, ENV_API_KEY, ENV_BASE_URL};

/// One provider response: vectors in input order, uniform dims.
#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    pub model: String,
    pub vectors: Vec<Vec<f32>>,
    pub dims: usize,
}

/// Interface every embedding backend implements.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Registry id, e.g. `"local"` or `"openai"`.
    fn provider_id(&self) -> &str;
    /// Model identifier recorded in artifacts, e.g. `"local-sha256"`.
    fn model_id(&self) -> &str;
    /// Default dimensionality when the caller does not override it.
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, inputs: &[String], dimensions: Option<usize>) -> Result<EmbeddingBatch>;
}

// ============ Local deterministic provider ============

/// Deterministic embedding provider for offline and replay use.
///
/// Each component is a unit-range value expanded from
/// `sha256("{text}\x1f{dims}\x1f{block}")`, so the vector for a given
/// `(text, dims)` pair is identical across machines and runs.
pub struct LocalHashProvider {
    dims: usize,
}

impl LocalHashProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn vector_for(text: &str, dims: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(dims);
        let mut block = 0u32;
        while out.len() < dims {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update([0x1f]);
            hasher.update(dims.to_string().as_bytes());
            hasher.update([0x1f]);
            hasher.update(block.to_string().as_bytes());
            let digest = hasher.finalize();
            for word in digest.chunks_exact(4) {
                if out.len() >= dims {
                    break;
                }
                let v = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                out.push(v as f32 / u32::MAX as f32);
            }
            block += 1;
        }
        out
    }
}

#[async_trait]
impl EmbeddingProvider for LocalHashProvider {
    fn provider_id(&self) -> &str {
        "local"
    }
    fn model_id(&self) -> &str {
        "local-sha256"
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, inputs: &[String], dimensions: Option<usize>) -> Result<EmbeddingBatch> {
        let dims = dimensions.unwrap_or(self.dims);
        if dims == 0 {
            bail!("embedding dimensions must be > 0");
        }
        let vectors = inputs
            .iter()
            .map(|text| Self::vector_for(text, dims))
            .collect();
        Ok(EmbeddingBatch {
            model: self.model_id().to_string(),
            vectors,
            dims,
        })
    }
}

// ============ OpenAI-compatible HTTP provider ============

/// Embedding provider for OpenAI-compatible `/embeddings` endpoints.
///
/// The API key comes from `OPENAI_API_KEY`; the base URL defaults to the
/// OpenAI API and can be overridden via config or `IDX_EMBEDDINGS_BASE_URL`.
pub struct OpenAiProvider {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for the openai provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for the openai provider"))?;
        let api_key = std::env::var(ENV_API_KEY)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", ENV_API_KEY))?;
        let base_url = std::env::var(ENV_BASE_URL)
            .ok()
            .or_else(|| config.base_url.clone())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            model,
            dims,
            base_url,
            api_key,
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }
    fn model_id(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, inputs: &[String], dimensions: Option<usize>) -> Result<EmbeddingBatch> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let mut request = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });
        if let Some(d) = dimensions {
            request["dimensions"] = serde_json::json!(d);
        }
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));

        let mut retries_used = 0u32;
        let vectors = loop {
            match self.request_embeddings(&client, &url, &request).await {
                Ok(vectors) => break vectors,
                Err(failure) => {
                    if !failure.retryable || retries_used >= self.max_retries {
                        bail!("{}", failure.message);
                    }
                    tokio::time::sleep(backoff_delay(retries_used)).await;
                    retries_used += 1;
                }
            }
        };

        if vectors.len() != inputs.len() {
            bail!(
                "embeddings endpoint answered {} vectors for a batch of {}",
                vectors.len(),
                inputs.len()
            );
        }
        let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
        Ok(EmbeddingBatch {
            model: self.model.clone(),
            vectors,
            dims,
        })
    }
}

/// One failed request, tagged with whether a retry could help.
struct RequestFailure {
    retryable: bool,
    message: String,
}

impl OpenAiProvider {
    /// Issue a single request and classify its outcome. Transport errors,
    /// 429, and 5xx are retryable; all other statuses are terminal.
    async fn request_embeddings(
        &self,
        client: &reqwest::Client,
        url: &str,
        request: &serde_json::Value,
    ) -> std::result::Result<Vec<Vec<f32>>, RequestFailure> {
        let response = client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| RequestFailure {
                retryable: true,
                message: format!("embeddings request failed to send: {}", e),
            })?;

        let status = response.status();
        if status.is_success() {
            let payload: serde_json::Value = response.json().await.map_err(|e| RequestFailure {
                retryable: false,
                message: format!("embeddings response was not JSON: {}", e),
            })?;
            return parse_embeddings_response(&payload).map_err(|e| RequestFailure {
                retryable: false,
                message: e.to_string(),
            });
        }

        let retryable = status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
        let detail = response.text().await.unwrap_or_default();
        Err(RequestFailure {
            retryable,
            message: format!("embeddings endpoint answered {}: {}", status, detail),
        })
    }
}

/// Sleep before the `n`th retry (0-based): doubles from 1s, capped at 32s.
fn backoff_delay(retry: u32) -> Duration {
    Duration::from_secs(1u64 << retry.min(5))
}

/// Pull the vectors out of an OpenAI-shaped response body.
fn parse_embeddings_response(payload: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let rows = payload["data"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("embeddings response carries no data array"))?;

    rows.iter()
        .map(|row| {
            row["embedding"]
                .as_array()
                .map(|xs| xs.iter().map(|x| x.as_f64().unwrap_or_default() as f32).collect())
                .ok_or_else(|| anyhow::anyhow!("embeddings response row is missing its vector"))
        })
        .collect()
}

// ============ Registry ============

/// Read-only provider registry, built once at startup.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn EmbeddingProvider>>,
    default_id: String,
}

impl ProviderRegistry {
    /// Build the registry from config. The local deterministic provider is
    /// always registered; the HTTP provider joins when configured and a
    /// key is present. Falls back to `local` as the default otherwise.
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let mut providers: HashMap<String, Arc<dyn EmbeddingProvider>> = HashMap::new();

        let local_dims = config.dims.unwrap_or(64);
        providers.insert(
            "local".to_string(),
            Arc::new(LocalHashProvider::new(local_dims)),
        );

        let mut default_id = "local".to_string();
        if config.provider == "openai" {
            match OpenAiProvider::new(config) {
                Ok(p) => {
                    providers.insert("openai".to_string(), Arc::new(p));
                    default_id = "openai".to_string();
                }
                Err(e) => {
                    tracing::warn!("openai embedding provider unavailable, using local: {}", e);
                }
            }
        }

        Self {
            providers,
            default_id,
        }
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn EmbeddingProvider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn default_provider_id(&self) -> &str {
        &self.default_id
    }
}

// ============ Vector utilities ============

/// Serialize a vector into the on-disk embedding format: each component
/// as four little-endian bytes, concatenated in order. `blob.len()` is
/// always `vector.len() * 4`.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Deserialize a stored embedding blob. The `dims` column is the
/// authority on length; a trailing partial component (a corrupt blob)
/// is dropped rather than invented.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    let mut components = Vec::with_capacity(blob.len() / 4);
    let mut rest = blob;
    while let Some((word, tail)) = rest.split_first_chunk::<4>() {
        components.push(f32::from_le_bytes(*word));
        rest = tail;
    }
    components
}

/// Cosine similarity of two vectors, accumulated in `f64` for stable
/// ranking on long vectors.
///
/// Length mismatches and zero-magnitude inputs score `0.0`, dropping
/// them to the bottom of the ranking instead of poisoning it with NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let (dot, mag_a, mag_b) = a.iter().zip(b).fold(
        (0.0f64, 0.0f64, 0.0f64),
        |(dot, mag_a, mag_b), (&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            (dot + x * y, mag_a + x * x, mag_b + y * y)
        },
    );

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a.sqrt() * mag_b.sqrt())) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_provider_is_deterministic() {
        let p = LocalHashProvider::new(32);
        let a = p.embed(&["hello".to_string()], None).await.unwrap();
        let b = p.embed(&["hello".to_string()], None).await.unwrap();
        assert_eq!(a.vectors, b.vectors);
        assert_eq!(a.dims, 32);
        assert_eq!(a.vectors[0].len(), 32);
    }

    #[tokio::test]
    async fn test_local_provider_varies_by_text_and_dims() {
        let p = LocalHashProvider::new(16);
        let a = p.embed(&["hello".to_string()], None).await.unwrap();
        let b = p.embed(&["world".to_string()], None).await.unwrap();
        assert_ne!(a.vectors, b.vectors);

        let wide = p.embed(&["hello".to_string()], Some(24)).await.unwrap();
        assert_eq!(wide.dims, 24);
        // Different dims reseed the whole vector, not just the tail.
        assert_ne!(a.vectors[0][..], wide.vectors[0][..16]);
    }

    #[tokio::test]
    async fn test_local_provider_unit_range() {
        let p = LocalHashProvider::new(100);
        let batch = p.embed(&["range check".to_string()], None).await.unwrap();
        for v in &batch.vectors[0] {
            assert!((0.0..=1.0).contains(v));
        }
    }

    #[tokio::test]
    async fn test_local_provider_one_vector_per_input() {
        let p = LocalHashProvider::new(8);
        let inputs: Vec<String> = (0..5).map(|i| format!("text {}", i)).collect();
        let batch = p.embed(&inputs, None).await.unwrap();
        assert_eq!(batch.vectors.len(), 5);
    }

    #[test]
    fn test_blob_layout_is_four_le_bytes_per_component() {
        // 1.0f32 = 0x3f800000 → little-endian [00, 00, 80, 3f].
        assert_eq!(vec_to_blob(&[1.0]), vec![0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(vec_to_blob(&[]), Vec::<u8>::new());

        let vector = vec![0.25f32, -8.5, 1e-3, 42.0];
        let blob = vec_to_blob(&vector);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vec(&blob), vector);
    }

    #[test]
    fn test_blob_decode_drops_trailing_partial_component() {
        let mut blob = vec_to_blob(&[6.0f32, -6.0]);
        blob.truncate(blob.len() - 1);
        assert_eq!(blob_to_vec(&blob), vec![6.0]);
    }

    #[test]
    fn test_cosine_ignores_magnitude() {
        // Parallel vectors of different lengths still score 1.
        let sim = cosine_similarity(&[2.0, 4.0, 6.0], &[1.0, 2.0, 3.0]);
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_antiparallel_and_orthogonal() {
        let sim = cosine_similarity(&[3.0, -1.0], &[-6.0, 2.0]);
        assert!((sim + 1.0).abs() < 1e-5);

        let sim = cosine_similarity(&[5.0, 0.0, 0.0], &[0.0, 0.0, 7.0]);
        assert!(sim.abs() < 1e-5);
    }

    #[test]
    fn test_cosine_known_angle() {
        // 45° between the x axis and the diagonal: cos = √2 / 2.
        let sim = cosine_similarity(&[1.0, 0.0], &[1.0, 1.0]);
        assert!((sim - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_degenerate_inputs_score_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[4.0, 4.0]), 0.0);
    }

    #[test]
    fn test_parse_embeddings_response() {
        let payload = serde_json::json!({
            "data": [
                { "embedding": [0.5, -0.5, 0.125], "index": 0 },
                { "embedding": [1.0, 0.0, -1.0], "index": 1 }
            ],
            "model": "text-embedding-3-small"
        });
        let vectors = parse_embeddings_response(&payload).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![0.5, -0.5, 0.125]);

        assert!(parse_embeddings_response(&serde_json::json!({ "data": 7 })).is_err());
        assert!(parse_embeddings_response(&serde_json::json!({
            "data": [{ "index": 0 }]
        }))
        .is_err());
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(40), Duration::from_secs(32));
    }

    #[test]
    fn test_registry_always_has_local() {
        let registry = ProviderRegistry::from_config(&EmbeddingConfig::default());
        assert!(registry.get("local").is_some());
        assert_eq!(registry.default_provider_id(), "local");
        assert!(registry.get("missing").is_none());
    }
}
