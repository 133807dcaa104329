//! Sync API Client - HTTP communication with the system of record
//!
//! One endpoint per (entity type, operation):
//! - create: `POST {base}/{entity_type}`
//! - update: `PUT {base}/{entity_type}/{entity_id}`
//! - delete: `DELETE {base}/{entity_type}/{entity_id}`
//!
//! Every request carries the item's `Idempotency-Key` header so the server
//! can discard replays of an attempt whose response was lost.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

use super::models::{FailureKind, Operation, QueueItem, SyncFailure};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Remote system of record, as seen by the orchestrator
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Apply one queued operation remotely
    async fn push(&self, item: &QueueItem) -> Result<(), SyncApiError>;
}

/// API client for the remote entity endpoints
pub struct SyncApiClient {
    client: Client,
    base_url: Url,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl SyncApiClient {
    /// Create new API client
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncApiError> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| SyncApiError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncApiError::InvalidUrl(format!("{} cannot be a base URL", base_url)));
        }
        // Keep the last path segment when joining
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncApiError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Set access token
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    /// Get current token
    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token (logout)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    /// Method and URL for an item
    pub fn endpoint(&self, item: &QueueItem) -> Result<(Method, Url), SyncApiError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SyncApiError::InvalidUrl(self.base_url.to_string()))?;
            segments.pop_if_empty().push(&item.entity_type);
            if item.operation != Operation::Create {
                segments.push(&item.entity_id);
            }
        }

        let method = match item.operation {
            Operation::Create => Method::POST,
            Operation::Update => Method::PUT,
            Operation::Delete => Method::DELETE,
        };
        Ok((method, url))
    }
}

#[async_trait]
impl RemoteApi for SyncApiClient {
    async fn push(&self, item: &QueueItem) -> Result<(), SyncApiError> {
        let (method, url) = self.endpoint(item)?;
        log::debug!("{} {} (item {})", method, url, item.id);

        let mut request = self
            .client
            .request(method, url)
            .header(IDEMPOTENCY_HEADER, &item.idempotency_key);

        if item.operation != Operation::Delete {
            request = request.json(&item.payload);
        }
        if let Some(token) = self.get_token().await {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(SyncApiError::from_transport)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncApiError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rejected ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to create HTTP client: {0}")]
    ClientBuild(String),
}

impl SyncApiError {
    fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::NetworkError(error.to_string())
        }
    }

    /// Classify for the queue
    pub fn to_failure(&self) -> SyncFailure {
        let kind = match self {
            Self::Timeout
            | Self::NetworkError(_)
            | Self::RateLimitExceeded
            | Self::ServerError { .. }
            | Self::ClientBuild(_) => FailureKind::Network,
            Self::Unauthorized | Self::Forbidden => FailureKind::Auth,
            Self::Conflict(_) => FailureKind::Conflict,
            Self::Validation { .. } | Self::InvalidUrl(_) => FailureKind::Validation,
        };
        SyncFailure::new(kind, self.to_string())
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    match status {
        StatusCode::UNAUTHORIZED => SyncApiError::Unauthorized,
        StatusCode::FORBIDDEN => SyncApiError::Forbidden,
        StatusCode::CONFLICT => SyncApiError::Conflict(message),
        StatusCode::TOO_MANY_REQUESTS => SyncApiError::RateLimitExceeded,
        StatusCode::REQUEST_TIMEOUT => SyncApiError::Timeout,
        s if s.is_client_error() => SyncApiError::Validation { status: s.as_u16(), message },
        s => SyncApiError::ServerError { status: s.as_u16(), message },
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::QueueStatus;
    use chrono::Utc;

    fn item(operation: Operation) -> QueueItem {
        QueueItem {
            id: "item-1".to_string(),
            entity_type: "quality-check".to_string(),
            entity_id: "qc 17".to_string(),
            operation,
            payload: serde_json::json!({ "passed": true }),
            idempotency_key: "idem-1".to_string(),
            status: QueueStatus::Syncing,
            attempt_count: 0,
            last_error: None,
            enqueued_at: Utc::now(),
            last_attempt_at: None,
            seq: 1,
        }
    }

    #[test]
    fn test_endpoints() {
        let client = SyncApiClient::new("https://example.com/api/v1", Duration::from_secs(5)).unwrap();

        let (method, url) = client.endpoint(&item(Operation::Create)).unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(url.as_str(), "https://example.com/api/v1/quality-check");

        let (method, url) = client.endpoint(&item(Operation::Update)).unwrap();
        assert_eq!(method, Method::PUT);
        assert_eq!(url.as_str(), "https://example.com/api/v1/quality-check/qc%2017");

        let (method, _) = client.endpoint(&item(Operation::Delete)).unwrap();
        assert_eq!(method, Method::DELETE);
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            SyncApiClient::new("not a url", Duration::from_secs(5)),
            Err(SyncApiError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_classification() {
        assert_eq!(SyncApiError::Timeout.to_failure().kind, FailureKind::Network);
        assert_eq!(
            SyncApiError::ServerError { status: 503, message: String::new() }.to_failure().kind,
            FailureKind::Network
        );
        assert_eq!(SyncApiError::Unauthorized.to_failure().kind, FailureKind::Auth);
        assert_eq!(SyncApiError::Forbidden.to_failure().kind, FailureKind::Auth);
        assert_eq!(SyncApiError::Conflict("x".into()).to_failure().kind, FailureKind::Conflict);
        assert_eq!(
            SyncApiError::Validation { status: 422, message: String::new() }.to_failure().kind,
            FailureKind::Validation
        );
    }

    #[tokio::test]
    async fn test_token_management() {
        let client = SyncApiClient::new("https://example.com", Duration::from_secs(5)).unwrap();
        assert!(client.get_token().await.is_none());

        client.set_token("test_token".to_string()).await;
        assert_eq!(client.get_token().await, Some("test_token".to_string()));

        client.clear_token().await;
        assert!(client.get_token().await.is_none());
    }
}
