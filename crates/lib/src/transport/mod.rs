//! Outbound transports.
//!
//! A transport actually moves a message to its destination (an SMS gateway, a webhook,
//! a chat bot API). The relay never talks to one directly; it goes through the
//! [`crate::dispatcher::Dispatcher`], which adds timeouts and failure classification.

mod webhook;

pub use webhook::WebhookTransport;

use async_trait::async_trait;

/// Raw failure reported by a transport. `code` is a short machine-readable reason
/// (e.g. "network", "throttled", "invalid_destination") that the dispatcher classifies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: String,
    pub message: String,
}

impl TransportError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Handle to an outbound transport supplied by the host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport id for logs (e.g. "webhook").
    fn id(&self) -> &str;

    /// Deliver `body` to `target`.
    async fn send(&self, target: &str, body: &str) -> Result<(), TransportError>;
}
