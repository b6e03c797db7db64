//! Backend REST client: relay token issuance and the fleet roster.
//!
//! `TokenSource` and `RosterSource` are the seams the pool and the dashboard
//! session depend on; `HttpApi` is the reqwest implementation. Response
//! parsing is kept in pure functions for testability.
//!
//! ERROR HANDLING
//! ==============
//! Every failure maps to `ApiError`. Callers in the core treat all of them as
//! transient: a failed token fetch is retried on the next reconciliation pass
//! and a failed poll keeps the previous roster.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::types::{Bus, Role};
use crate::config::RelayConfig;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("request failed: {0}")]
    Request(String),

    /// The backend returned a non-success status.
    #[error("{endpoint} responded with status {status}")]
    Status { endpoint: String, status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("response parse failed: {0}")]
    Parse(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl ApiError {
    /// Whether retrying the same request later could succeed.
    ///
    /// Authorization failures are included: tokens and sessions rotate, so a
    /// 401/403 on one pass is retried on the next like any other failure.
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Status { status, .. } => matches!(status, 401 | 403 | 408 | 429 | 500..=599),
            Self::Parse(_) | Self::HttpClientBuild(_) => false,
        }
    }
}

// =============================================================================
// SEAMS
// =============================================================================

/// Issues short-lived relay URLs scoped to one bus and one viewer role.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns the fully-formed WebSocket URL (token included) for `bus_id`.
    async fn relay_url(&self, bus_id: &str, role: Role) -> Result<String, ApiError>;
}

/// Supplies the authoritative fleet roster.
#[async_trait::async_trait]
pub trait RosterSource: Send + Sync {
    async fn fetch_roster(&self) -> Result<Vec<Bus>, ApiError>;
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
    token_path: String,
    roster_path: String,
    api_token: Option<String>,
}

impl HttpApi {
    /// # Errors
    ///
    /// Returns [`ApiError::HttpClientBuild`] if the reqwest client cannot be built.
    pub fn new(config: &RelayConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .connect_timeout(config.http_timeout)
            .build()
            .map_err(|e| ApiError::HttpClientBuild(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.api_base_url.clone(),
            token_path: config.token_path.clone(),
            roster_path: config.roster_path.clone(),
            api_token: config.api_token.clone(),
        })
    }

    async fn get_text(&self, path: &str, query: &[(&str, &str)]) -> Result<String, ApiError> {
        let url = endpoint(&self.base_url, path);
        let mut request = self.http.get(&url).query(query);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(ApiError::Status { endpoint: path.to_owned(), status, body });
        }
        Ok(body)
    }
}

#[async_trait::async_trait]
impl TokenSource for HttpApi {
    async fn relay_url(&self, bus_id: &str, role: Role) -> Result<String, ApiError> {
        let body = self
            .get_text(&self.token_path, &[("busId", bus_id), ("role", role.as_str())])
            .await?;
        parse_token_response(&body)
    }
}

#[async_trait::async_trait]
impl RosterSource for HttpApi {
    async fn fetch_roster(&self) -> Result<Vec<Bus>, ApiError> {
        let body = self.get_text(&self.roster_path, &[]).await?;
        parse_roster(&body)
    }
}

// =============================================================================
// PARSING
// =============================================================================

fn endpoint(base_url: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(rename = "wsUrl")]
    ws_url: String,
}

fn parse_token_response(body: &str) -> Result<String, ApiError> {
    let parsed: TokenResponse = serde_json::from_str(body).map_err(|e| ApiError::Parse(e.to_string()))?;
    if parsed.ws_url.trim().is_empty() {
        return Err(ApiError::Parse("empty wsUrl".to_owned()));
    }
    Ok(parsed.ws_url)
}

/// Parse a roster body: either a bare array or an object wrapping it under
/// `buses` or `data`. Entries that are not valid buses are skipped.
fn parse_roster(body: &str) -> Result<Vec<Bus>, ApiError> {
    let value: Value = serde_json::from_str(body).map_err(|e| ApiError::Parse(e.to_string()))?;
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(mut obj) => match obj.remove("buses").or_else(|| obj.remove("data")) {
            Some(Value::Array(rows)) => rows,
            _ => return Err(ApiError::Parse("roster object has no buses array".to_owned())),
        },
        _ => return Err(ApiError::Parse("roster is not an array".to_owned())),
    };

    Ok(rows
        .into_iter()
        .filter_map(|row| match serde_json::from_value::<Bus>(row) {
            Ok(bus) => Some(bus),
            Err(e) => {
                warn!(error = %e, "roster: skipping malformed bus entry");
                None
            }
        })
        .collect())
}

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;
