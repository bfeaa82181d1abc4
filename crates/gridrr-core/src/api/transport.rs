//! The wire seam between the client and the Gridrr backend.
//!
//! `Transport` executes one already-prepared request and reports the raw
//! status and body. Everything above it (bearer attachment, refresh and
//! retry, status classification) lives in `ApiClient`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::Serialize;
use tracing::debug;

use super::ApiError;

/// Base URL for the Gridrr REST API
pub const DEFAULT_API_BASE_URL: &str = "https://api.gridrr.com/api";

/// HTTP request timeout in seconds.
/// A stalled refresh fails after this and releases every waiter.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl HttpMethod {
    fn as_reqwest(self) -> Method {
        match self {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
        }
    }
}

/// A request relative to the API base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<serde_json::Value>,
    /// Bearer credential attached by `ApiClient` right before sending.
    pub bearer: Option<String>,
    /// Set once the request has been resent after a refresh.
    pub retried: bool,
    /// Credential endpoints never go through refresh-and-retry.
    pub skip_refresh: bool,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            bearer: None,
            retried: false,
            skip_refresh: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn without_refresh(mut self) -> Self {
        self.skip_refresh = true;
        self
    }

    /// Eligible for the one refresh-and-retry round.
    pub fn may_refresh(&self) -> bool {
        !self.retried && !self.skip_refresh
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one request. Non-2xx statuses are NOT errors at this level;
    /// only transport failures are.
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError>;
}

/// `reqwest`-backed transport.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        // The refresh credential travels as an HTTP-only cookie.
        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = self.url(&request.path);
        let mut builder = self
            .client
            .request(request.method.as_reqwest(), &url)
            .header(header::ACCEPT, "application/json");

        if let Some(ref token) = request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(method = ?request.method, url = %url, status, "Request completed");

        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let transport =
            ReqwestTransport::new("https://api.gridrr.com/api/", Duration::from_secs(5)).expect("client");
        assert_eq!(transport.url("/auth/me"), "https://api.gridrr.com/api/auth/me");
        assert_eq!(transport.url("auth/me"), "https://api.gridrr.com/api/auth/me");
    }

    #[test]
    fn test_request_retry_eligibility() {
        let req = ApiRequest::get("/posts");
        assert!(req.may_refresh());

        let mut retried = ApiRequest::get("/posts");
        retried.retried = true;
        assert!(!retried.may_refresh());

        assert!(!ApiRequest::post("/auth/login").without_refresh().may_refresh());
    }
}
