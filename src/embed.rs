use std::time::Duration;

use serde::Deserialize;

use crate::config::{AppContext, Config};
use crate::error::{MempackError, Result};

/// Hard ceiling on one provider round-trip.
const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// Narrow capability the retrieval path consumes: texts in, vectors out.
pub trait EmbeddingProvider {
    fn model(&self) -> &str;
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Blocking HTTP client for a local embedding server speaking the
/// `POST <host>/api/embed` contract.
pub struct HttpEmbeddingClient {
    host: String,
    model: String,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbeddingClient {
    pub fn new(host: &str, model: &str, deadline: Option<Duration>) -> Self {
        let timeout = deadline.map(|d| d.min(EMBED_TIMEOUT)).unwrap_or(EMBED_TIMEOUT);
        Self {
            host: host.trim_end_matches('/').to_string(),
            model: model.to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    /// Availability probe, memoized per `(host, model)` in the context.
    pub fn probe(&self, ctx: &AppContext) -> bool {
        if let Some(cached) = ctx.cached_probe(&self.host, &self.model) {
            return cached;
        }
        let ok = self.embed(&["ping".to_string()]).is_ok();
        ctx.record_probe(&self.host, &self.model, ok);
        ok
    }
}

impl EmbeddingProvider for HttpEmbeddingClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let url = format!("{}/api/embed", self.host);
        let response = self
            .agent
            .post(&url)
            .send_json(serde_json::json!({ "model": self.model, "input": texts }))
            .map_err(|e| MempackError::EmbeddingProvider(e.to_string()))?;

        let parsed: EmbedResponse = response
            .into_json()
            .map_err(|e| MempackError::EmbeddingResponse(e.to_string()))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(MempackError::EmbeddingResponse(format!(
                "expected {} vectors, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        if parsed.embeddings.iter().any(|v| v.is_empty()) {
            return Err(MempackError::EmbeddingResponse("empty vector in response".into()));
        }
        Ok(parsed.embeddings)
    }
}

/// Build the configured provider, or `None` when vector search is off.
pub fn provider_from_config(
    config: &Config,
    deadline: Option<Duration>,
) -> Option<HttpEmbeddingClient> {
    if config.embedding_provider.is_empty() || config.embedding_provider == "none" {
        return None;
    }
    Some(HttpEmbeddingClient::new(
        &config.embedding_host,
        &config.embedding_model,
        deadline,
    ))
}

/// Cosine similarity; zero for mismatched or degenerate vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identity_and_orthogonality() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn provider_disabled_by_config() {
        let config = Config::default();
        assert!(provider_from_config(&config, None).is_none());

        let config = Config {
            embedding_provider: "ollama".into(),
            ..Config::default()
        };
        let provider = provider_from_config(&config, None).unwrap();
        assert_eq!(provider.model(), "nomic-embed-text");
    }

    #[test]
    fn host_trailing_slash_is_trimmed() {
        let client = HttpEmbeddingClient::new("http://localhost:11434/", "m", None);
        assert_eq!(client.host, "http://localhost:11434");
    }

    #[test]
    fn unreachable_host_is_a_provider_error() {
        // Reserved TEST-NET address; nothing listens there.
        let client = HttpEmbeddingClient::new(
            "http://192.0.2.1:1",
            "m",
            Some(Duration::from_millis(50)),
        );
        let err = client.embed(&["x".to_string()]).unwrap_err();
        assert_eq!(err.code(), "embedding_provider_error");
    }
}
