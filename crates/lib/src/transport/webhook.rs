//! Webhook transport: POST each outbound message as JSON to a configured URL.

use super::{Transport, TransportError};
use async_trait::async_trait;
use reqwest::StatusCode;

/// Sends `{"target": ..., "body": ...}` to the webhook URL, optionally with a bearer token.
pub struct WebhookTransport {
    id: String,
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            id: "webhook".to_string(),
            url: url.into(),
            token,
            client: reqwest::Client::new(),
        }
    }
}

/// Error code for a non-success HTTP status.
pub(crate) fn status_code_reason(status: StatusCode) -> String {
    match status.as_u16() {
        429 => "throttled".to_string(),
        400 | 422 => "rejected".to_string(),
        404 => "invalid_destination".to_string(),
        401 | 403 => "unauthorized".to_string(),
        415 => "unsupported_format".to_string(),
        503 => "unavailable".to_string(),
        _ if status.is_server_error() => "server_error".to_string(),
        s => format!("http_{}", s),
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, target: &str, body: &str) -> Result<(), TransportError> {
        let payload = serde_json::json!({ "target": target, "body": body });
        let mut req = self.client.post(&self.url).json(&payload);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        let res = req.send().await.map_err(|e| {
            let code = if e.is_timeout() { "timeout" } else { "network" };
            TransportError::new(code, e.to_string())
        })?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(TransportError::new(
                status_code_reason(status),
                format!("webhook returned {} {}", status, text),
            ));
        }
        Ok(())
    }
}
