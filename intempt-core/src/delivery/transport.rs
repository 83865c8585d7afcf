//! Transport capability and the HTTP client for the collection endpoint

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;

use crate::config::DeliveryConfig;
use crate::error::{Error, NetworkErrorKind, Result};

use super::payload::BatchRequest;

/// Raw outcome of a request that reached the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Classify a non-2xx status: 5xx may be retried, the rest may not
    pub fn failure_kind(&self) -> NetworkErrorKind {
        if (500..600).contains(&self.status) {
            NetworkErrorKind::Transient
        } else {
            NetworkErrorKind::Permanent
        }
    }
}

/// A request that never produced a response
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    /// The request could not be built; resending it cannot help
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request failed: {0}")]
    Other(String),
}

/// Sends one batch request to the collection endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &BatchRequest,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// HTTP client for the Intempt collection API
pub struct HttpTransport {
    http_client: reqwest::Client,
    events_url: String,
}

impl HttpTransport {
    /// Create a new transport from configuration
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config.endpoint.trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            events_url: format!("{}/events", base_url),
        })
    }

    pub fn events_url(&self) -> &str {
        &self.events_url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &BatchRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", request.token))
            .map_err(|e| TransportError::InvalidRequest(format!("invalid token: {}", e)))?;

        let response = self
            .http_client
            .post(&self.events_url)
            .header(AUTHORIZATION, auth_value)
            .header("X-Organization-Id", request.org_id.as_str())
            .header("X-Tracker-Id", request.tracker_id.as_str())
            .json(request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(TransportResponse { status, body })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connection(e.to_string())
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}
