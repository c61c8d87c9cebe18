//! Outbound client for the external memory store.
//!
//! Thin authenticated HTTPS RPC wrapper around the store's add/search/list/
//! delete API. The client is stateless beyond reqwest's connection pooling
//! and is shared concurrently by the sync loop, the reflection engine and
//! the IPC façade. It also owns the retry/backoff policy those consumers
//! share; the client itself performs a single attempt per call so callers
//! decide where waiting is acceptable.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};

use crate::config::StoreConfig;
use crate::models::{MemoryRecord, Message};

/// Store call failures, split by whether a retry can help.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient transport or store-side failure (timeouts, 429, 5xx).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Permanent validation failure reported by the store. Never retried.
    #[error("store rejected request ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// The store answered success but the body did not match the contract.
    #[error("invalid store response: {0}")]
    InvalidResponse(String),

    #[error("missing store API key")]
    MissingApiKey,
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Shared backoff policy: exponential doubling from `base_delay_ms`, capped
/// at `max_delay_ms`, with jitter, for `max_retries` retries after the first
/// attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.retry_base_ms,
            max_delay_ms: config.retry_cap_ms,
        }
    }

    /// The concrete delay schedule for one submission ticket.
    pub fn schedule(&self) -> Vec<Duration> {
        ExponentialBackoff::from_millis(2)
            .factor((self.base_delay_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .map(jitter)
            .take(self.max_retries)
            .collect()
    }
}

/// Abstraction over the external memory store, at the seam where the sync
/// loop and the reflection engine meet the network.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist one message sequence. Returns the store-assigned memory id.
    async fn add(
        &self,
        messages: &[Message],
        user_id: &str,
        metadata: serde_json::Value,
    ) -> Result<String, StoreError>;

    /// Relevance-ranked search, ranking delegated entirely to the store.
    async fn search(
        &self,
        query: &str,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<MemoryRecord>, StoreError>;

    async fn list(&self, user_id: &str) -> Result<Vec<MemoryRecord>, StoreError>;

    async fn delete(&self, memory_id: &str) -> Result<DeleteOutcome, StoreError>;

    async fn delete_all(&self, user_id: &str) -> Result<(), StoreError>;
}

// ============================================================================
// Wire shapes (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct AddRequest<'a> {
    messages: &'a [Message],
    user_id: &'a str,
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    user_id: &'a str,
    limit: u32,
}

#[derive(Debug, Deserialize)]
struct ResultsEnvelope {
    results: Vec<MemoryRecord>,
}

// ============================================================================
// HttpMemoryStoreClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpMemoryStoreClient {
    client: Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl HttpMemoryStoreClient {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::with_base_url(config, config.base_url.clone())
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(config: &StoreConfig, base_url: String) -> Result<Self, StoreError> {
        let api_key = config.resolved_api_key();
        if api_key.is_empty() {
            return Err(StoreError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.api_key)
    }

    async fn error_from(response: reqwest::Response) -> StoreError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            StoreError::Unavailable(format!("store returned {}: {}", status, body))
        } else {
            StoreError::Rejected {
                code: status.as_u16(),
                message: body,
            }
        }
    }
}

fn transport(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl MemoryStore for HttpMemoryStoreClient {
    async fn add(
        &self,
        messages: &[Message],
        user_id: &str,
        metadata: serde_json::Value,
    ) -> Result<String, StoreError> {
        let url = format!("{}/v1/memories/", self.base_url);
        let request = AddRequest {
            messages,
            user_id,
            metadata,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: AddResponse = response
            .json()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
        Ok(body.id)
    }

    async fn search(
        &self,
        query: &str,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<MemoryRecord>, StoreError> {
        let url = format!("{}/v1/memories/search/", self.base_url);
        let request = SearchRequest {
            query,
            user_id,
            limit,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: ResultsEnvelope = response
            .json()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
        Ok(body.results)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<MemoryRecord>, StoreError> {
        let url = format!("{}/v1/memories/", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .query(&[("user_id", user_id)])
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: ResultsEnvelope = response
            .json()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
        Ok(body.results)
    }

    async fn delete(&self, memory_id: &str) -> Result<DeleteOutcome, StoreError> {
        let url = format!("{}/v1/memories/{}/", self.base_url, memory_id);

        let response = self
            .client
            .delete(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(transport)?;

        if response.status().as_u16() == 404 {
            return Ok(DeleteOutcome::NotFound);
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(DeleteOutcome::Deleted)
    }

    async fn delete_all(&self, user_id: &str) -> Result<(), StoreError> {
        let url = format!("{}/v1/memories/", self.base_url);

        let response = self
            .client
            .delete(&url)
            .header("Authorization", self.auth_header())
            .query(&[("user_id", user_id)])
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> StoreConfig {
        StoreConfig {
            base_url: "http://unused.invalid".to_string(),
            api_key: "test-key".to_string(),
            timeout_seconds: 5,
            max_retries: 2,
            retry_base_ms: 500,
            retry_cap_ms: 5_000,
        }
    }

    fn test_messages() -> Vec<Message> {
        vec![
            Message::new(Role::User, "hello"),
            Message::new(Role::Assistant, "hi there"),
        ]
    }

    fn record_json(id: &str, content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "memory": content,
            "user_id": "u1",
            "metadata": {},
            "created_at": "2024-05-01T12:00:00Z"
        })
    }

    #[tokio::test]
    async fn add_posts_messages_with_auth_and_returns_id() {
        let mock_server = MockServer::start().await;
        let client =
            HttpMemoryStoreClient::with_base_url(&test_config(), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/memories/"))
            .and(header("authorization", "Token test-key"))
            .and(body_json(serde_json::json!({
                "messages": [
                    {"role": "user", "content": "hello"},
                    {"role": "assistant", "content": "hi there"}
                ],
                "user_id": "u1",
                "metadata": {"source": "direct"}
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "mem-1"})),
            )
            .mount(&mock_server)
            .await;

        let id = client
            .add(
                &test_messages(),
                "u1",
                serde_json::json!({"source": "direct"}),
            )
            .await
            .expect("add should succeed");
        assert_eq!(id, "mem-1");
    }

    #[tokio::test]
    async fn add_maps_server_errors_to_unavailable() {
        let mock_server = MockServer::start().await;
        let client =
            HttpMemoryStoreClient::with_base_url(&test_config(), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&mock_server)
            .await;

        let err = client
            .add(&test_messages(), "u1", serde_json::json!({}))
            .await
            .expect_err("expected failure");
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn add_maps_validation_errors_to_rejected() {
        let mock_server = MockServer::start().await;
        let client =
            HttpMemoryStoreClient::with_base_url(&test_config(), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("malformed payload"))
            .mount(&mock_server)
            .await;

        let err = client
            .add(&test_messages(), "u1", serde_json::json!({}))
            .await
            .expect_err("expected failure");
        match err {
            StoreError::Rejected { code, message } => {
                assert_eq!(code, 400);
                assert!(message.contains("malformed"));
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rate_limit_is_retryable() {
        let mock_server = MockServer::start().await;
        let client =
            HttpMemoryStoreClient::with_base_url(&test_config(), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&mock_server)
            .await;

        let err = client
            .add(&test_messages(), "u1", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn search_parses_ranked_results_in_order() {
        let mock_server = MockServer::start().await;
        let client =
            HttpMemoryStoreClient::with_base_url(&test_config(), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/memories/search/"))
            .and(body_json(serde_json::json!({
                "query": "rust traits",
                "user_id": "u1",
                "limit": 5
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [record_json("m2", "second"), record_json("m1", "first")]
            })))
            .mount(&mock_server)
            .await;

        let results = client.search("rust traits", "u1", 5).await.unwrap();
        assert_eq!(results.len(), 2);
        // Store ranking is preserved, no local re-ranking.
        assert_eq!(results[0].id, "m2");
        assert_eq!(results[1].id, "m1");
    }

    #[tokio::test]
    async fn list_scopes_by_user_id() {
        let mock_server = MockServer::start().await;
        let client =
            HttpMemoryStoreClient::with_base_url(&test_config(), mock_server.uri()).unwrap();

        Mock::given(method("GET"))
            .and(path("/v1/memories/"))
            .and(query_param("user_id", "u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [record_json("m1", "only one")]
            })))
            .mount(&mock_server)
            .await;

        let results = client.list("u1").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "only one");
    }

    #[tokio::test]
    async fn delete_distinguishes_not_found() {
        let mock_server = MockServer::start().await;
        let client =
            HttpMemoryStoreClient::with_base_url(&test_config(), mock_server.uri()).unwrap();

        Mock::given(method("DELETE"))
            .and(path("/v1/memories/gone/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/memories/m1/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        assert_eq!(client.delete("gone").await.unwrap(), DeleteOutcome::NotFound);
        assert_eq!(client.delete("m1").await.unwrap(), DeleteOutcome::Deleted);
    }

    #[tokio::test]
    async fn malformed_success_body_is_invalid_response() {
        let mock_server = MockServer::start().await;
        let client =
            HttpMemoryStoreClient::with_base_url(&test_config(), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let err = client
            .add(&test_messages(), "u1", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidResponse(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_api_key_is_rejected_at_construction() {
        let mut config = test_config();
        config.api_key = String::new();
        // Ensure the env fallback is not picked up from the test environment.
        std::env::remove_var("MEMTAP_STORE_API_KEY");
        let result = HttpMemoryStoreClient::new(&config);
        assert!(matches!(result, Err(StoreError::MissingApiKey)));
    }

    #[test]
    fn retry_schedule_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 4,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        };
        let schedule = policy.schedule();
        assert_eq!(schedule.len(), 4);
        // Jitter only shrinks delays, so the cap holds for every entry.
        for delay in &schedule {
            assert!(*delay <= Duration::from_millis(5_000));
        }
    }
}
