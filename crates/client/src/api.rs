//! REST client for the audit start endpoint.
//!
//! The backend exposes `POST /api/audits/start`, which queues an audit and
//! answers with the job identifier used to scope channel events. Start
//! failures are not retried; they surface to the caller immediately.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Path of the start endpoint relative to the API base URL.
const START_AUDIT_PATH: &str = "/api/audits/start";

/// Depth of the audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditType {
    #[default]
    Standard,
    Comprehensive,
}

impl std::str::FromStr for AuditType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "comprehensive" => Ok(Self::Comprehensive),
            other => Err(format!("unknown audit type: {other}")),
        }
    }
}

/// Crawl options sent with a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    #[validate(range(min = 1, max = 10000))]
    pub max_pages: u32,
    pub include_subdomains: bool,
    pub analyze_competitors: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_pages: 100,
            include_subdomains: false,
            analyze_competitors: false,
        }
    }
}

/// Body of `POST /api/audits/start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct StartAuditRequest {
    /// Site to audit.
    #[validate(url)]
    pub url: String,
    #[serde(rename = "type")]
    pub audit_type: AuditType,
    #[validate(nested)]
    pub config: AuditConfig,
}

impl StartAuditRequest {
    pub fn new(url: impl Into<String>, audit_type: AuditType) -> Self {
        Self {
            url: url.into(),
            audit_type,
            config: AuditConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AuditConfig) -> Self {
        self.config = config;
        self
    }
}

/// Response of a successful start call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAuditResponse {
    pub job_id: String,
}

/// Errors from the audit REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request failed validation and was never sent.
    #[error("Invalid start request: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Audit API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// HTTP client for the audit backend.
#[derive(Debug, Clone)]
pub struct AuditApi {
    client: reqwest::Client,
    api_url: String,
}

impl AuditApi {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:3000`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Queue an audit and return its job identifier.
    pub async fn start_audit(
        &self,
        request: &StartAuditRequest,
    ) -> Result<StartAuditResponse, ApiError> {
        request.validate()?;

        let response = self
            .client
            .post(format!("{}{START_AUDIT_PATH}", self.api_url))
            .json(request)
            .send()
            .await?;

        let started: StartAuditResponse = Self::parse_response(response).await?;
        tracing::info!(
            job_id = %started.job_id,
            url = %request.url,
            audit_type = ?request.audit_type,
            "Audit started",
        );
        Ok(started)
    }

    // ---- private helpers ----

    /// Return the response unchanged on success, or an
    /// [`ApiError::Api`] with status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
