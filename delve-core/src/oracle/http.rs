//! JSON-over-HTTP oracle adapter.
//!
//! POSTs `{"kind": ..., "context": ...}` to one endpoint and expects
//! `{"decision": ..., "cost_usd": ...}` back. Non-success statuses keep their
//! code so the classifier can tell rate limits from bad requests.

use super::{Oracle, OracleReply, PromptKind};
use crate::error::OracleError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Maximum response body echoed into an error message.
const MAX_ERROR_BODY: usize = 500;

pub struct HttpOracle {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOracle {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OracleError::call(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
        })
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn parse_reply(body: &str) -> Result<OracleReply, OracleError> {
        let json: Value = serde_json::from_str(body)
            .map_err(|e| OracleError::call(format!("Invalid JSON from oracle: {e}")))?;
        let decision = json
            .get("decision")
            .cloned()
            .ok_or_else(|| OracleError::call("oracle response missing 'decision'"))?;
        let cost_usd = json["cost_usd"].as_f64().unwrap_or(0.0).max(0.0);
        Ok(OracleReply { decision, cost_usd })
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    fn name(&self) -> &str {
        "http"
    }

    async fn decide(&self, kind: PromptKind, context: &Value) -> Result<OracleReply, OracleError> {
        debug!(endpoint = %self.endpoint, kind = %kind, "Sending oracle request");

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&json!({ "kind": kind, "context": context }));
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| {
            let message = format!("Request failed: {e}");
            match e.status() {
                Some(status) => OracleError::with_status(message, status.as_u16()),
                None => OracleError::call(message),
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OracleError::call(format!("Failed to read response body: {e}")))?;

        if !status.is_success() {
            let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(OracleError::with_status(
                format!("HTTP {status}: {snippet}"),
                status.as_u16(),
            ));
        }

        Self::parse_reply(&body)
    }
}
