//! Outbound dispatcher: one uniform `send` over any [`Transport`], with a timeout and
//! transport errors sorted into retryable and non-retryable failures.

use crate::transport::Transport;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Whether a failed send is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Timeouts, throttling, network trouble: retry later.
    #[error("transient send failure: {0}")]
    Transient(String),
    /// Bad destination or rejected payload: retrying will not help.
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl DispatchError {
    pub fn class(&self) -> FailureClass {
        match self {
            DispatchError::Transient(_) => FailureClass::Transient,
            DispatchError::Permanent(_) => FailureClass::Permanent,
        }
    }
}

const TRANSIENT_CODES: &[&str] = &["network", "timeout", "throttled", "unavailable", "server_error"];
const PERMANENT_CODES: &[&str] = &[
    "invalid_destination",
    "unsupported_format",
    "rejected",
    "unauthorized",
];

/// Maps transport error codes to a [`FailureClass`]. Unknown codes are transient.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    classes: HashMap<String, FailureClass>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        let mut classes = HashMap::new();
        for code in TRANSIENT_CODES {
            classes.insert(code.to_string(), FailureClass::Transient);
        }
        for code in PERMANENT_CODES {
            classes.insert(code.to_string(), FailureClass::Permanent);
        }
        Self { classes }
    }
}

impl ErrorClassifier {
    /// Built-in mapping with `overrides` applied on top.
    pub fn with_overrides(overrides: &HashMap<String, FailureClass>) -> Self {
        let mut c = Self::default();
        for (code, class) in overrides {
            c.classes.insert(code.trim().to_lowercase(), *class);
        }
        c
    }

    pub fn classify(&self, code: &str) -> FailureClass {
        self.classes
            .get(&code.trim().to_lowercase())
            .copied()
            .unwrap_or(FailureClass::Transient)
    }
}

/// Wraps the host transport for the relay engine.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    classifier: ErrorClassifier,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, classifier: ErrorClassifier) -> Self {
        Self {
            transport,
            classifier,
        }
    }

    pub fn transport_id(&self) -> &str {
        self.transport.id()
    }

    /// Send one message. A timeout or a panicking transport counts as transient.
    pub async fn send(
        &self,
        target: &str,
        body: &str,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        let call = AssertUnwindSafe(self.transport.send(target, body)).catch_unwind();
        match tokio::time::timeout(timeout, call).await {
            Err(_) => Err(DispatchError::Transient(format!(
                "send timed out after {}ms",
                timeout.as_millis()
            ))),
            Ok(Err(_)) => {
                log::error!("transport {} panicked during send", self.transport.id());
                Err(DispatchError::Transient("transport panicked".to_string()))
            }
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => match self.classifier.classify(&e.code) {
                FailureClass::Transient => Err(DispatchError::Transient(e.to_string())),
                FailureClass::Permanent => Err(DispatchError::Permanent(e.to_string())),
            },
        }
    }
}
