//! Underwriting manual lookups for the `kb_search` tool.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Best passage returned for a query.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KbHit {
    pub location: String,
    pub text: String,
}

/// Retrieval over the underwriting manual.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Top passage for `term`, `None` when nothing matches.
    async fn retrieve(&self, term: &str) -> Result<Option<KbHit>>;
}

#[derive(Debug, Serialize)]
struct RetrieveRequest<'a> {
    query: &'a str,
    top_k: usize,
}

#[derive(Debug, Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    results: Vec<KbHit>,
}

/// Retrieval service reached over HTTP.
///
/// Posts `{"query", "top_k"}` and expects `{"results": [{"location", "text"}]}`.
pub struct HttpKnowledgeBase {
    http_client: reqwest::Client,
    url: String,
    top_k: usize,
    timeout_seconds: u64,
}

impl HttpKnowledgeBase {
    pub fn new(url: &str, top_k: usize, timeout_seconds: u64) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http_client,
            url: url.to_string(),
            top_k: top_k.max(1),
            timeout_seconds,
        })
    }
}

#[async_trait]
impl KnowledgeBase for HttpKnowledgeBase {
    async fn retrieve(&self, term: &str) -> Result<Option<KbHit>> {
        let request = RetrieveRequest {
            query: term,
            top_k: self.top_k,
        };

        let response = self
            .http_client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::anyhow!("Request timed out after {}s", self.timeout_seconds)
                } else if e.is_connect() {
                    anyhow::anyhow!("Cannot connect to knowledge base at {}", self.url)
                } else {
                    anyhow::anyhow!("Failed to send request: {}", e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Knowledge base error {}: {}", status, body));
        }

        let parsed: RetrieveResponse = response
            .json()
            .await
            .context("Failed to parse knowledge base response")?;

        debug!(term, hits = parsed.results.len(), "Knowledge base lookup");
        Ok(parsed.results.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let parsed: RetrieveResponse = serde_json::from_str(
            r#"{"results": [{"location": "manual/diabetes.md", "text": "Type 2 ..."}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.results[0].location, "manual/diabetes.md");

        let empty: RetrieveResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.results.is_empty());
    }

    #[test]
    fn test_top_k_is_at_least_one() {
        let kb = HttpKnowledgeBase::new("http://localhost:9/retrieve", 0, 5).unwrap();
        assert_eq!(kb.top_k, 1);
    }

    #[test]
    fn test_unreachable_service_is_an_error() {
        let kb = HttpKnowledgeBase::new("http://127.0.0.1:9/retrieve", 1, 2).unwrap();
        let result = tokio_test::block_on(kb.retrieve("diabetes"));
        assert!(result.is_err());
    }
}
