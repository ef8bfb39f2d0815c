//! Forwarding rule and its store.
//!
//! The store holds one versioned [`ForwardingRule`]. Readers take a snapshot; every
//! accepted update bumps the version and is published to subscribers. Tasks keep the
//! snapshot they were created with, so an update never reaches a message already queued.

use crate::decoder::InboundMessage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// Where and how inbound messages are forwarded. The default is disabled with no target, version 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    pub target: String,
    pub enabled: bool,
    /// Body template with `{body}`, `{sender}` and `{received_at}` placeholders. None forwards the body as is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub version: u64,
}

impl ForwardingRule {
    /// True when messages should be forwarded under this rule.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.target.trim().is_empty()
    }

    /// Outbound text for a message under this rule.
    pub fn render(&self, msg: &InboundMessage) -> String {
        match self.template.as_deref() {
            None => msg.body.clone(),
            Some(t) => render_template(t, msg),
        }
    }
}

/// Single pass over the template: each known placeholder is replaced once, and
/// substituted text is never scanned again. Unknown `{...}` stays literal.
fn render_template(template: &str, msg: &InboundMessage) -> String {
    let mut out = String::with_capacity(template.len() + msg.body.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let token = after.find('}').map(|close| (&after[..close], close));
        match token {
            Some(("body", close)) => {
                out.push_str(&msg.body);
                rest = &after[close + 1..];
            }
            Some(("sender", close)) => {
                out.push_str(&msg.sender);
                rest = &after[close + 1..];
            }
            Some(("received_at", close)) => {
                out.push_str(&msg.received_at.to_rfc3339());
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Versioned rule cell: many readers, one writer at a time.
pub struct RuleStore {
    tx: watch::Sender<Arc<ForwardingRule>>,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore {
    /// Store starting with a disabled rule at version 0.
    pub fn new() -> Self {
        Self::with_rule(ForwardingRule::default())
    }

    /// Store seeded with a previously persisted rule; later updates continue from its version.
    pub fn with_rule(rule: ForwardingRule) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(rule));
        Self { tx }
    }

    /// Current rule.
    pub fn get(&self) -> ForwardingRule {
        (**self.tx.borrow()).clone()
    }

    /// Current rule without cloning its contents; this is what tasks capture.
    pub fn snapshot(&self) -> Arc<ForwardingRule> {
        self.tx.borrow().clone()
    }

    /// Replace the rule and bump its version. An empty target is rejected and leaves the rule unchanged.
    pub fn update(
        &self,
        target: &str,
        enabled: bool,
        template: Option<String>,
    ) -> Result<ForwardingRule, ConfigError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "forwarding target must not be empty".to_string(),
            ));
        }
        let template = template.filter(|t| !t.is_empty());
        let mut updated = ForwardingRule::default();
        self.tx.send_modify(|current| {
            updated = ForwardingRule {
                target: target.to_string(),
                enabled,
                template,
                version: current.version + 1,
            };
            *current = Arc::new(updated.clone());
        });
        log::info!(
            "forwarding rule updated to version {} (enabled: {})",
            updated.version,
            updated.enabled
        );
        Ok(updated)
    }

    /// Receiver that observes every version change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ForwardingRule>> {
        self.tx.subscribe()
    }
}

/// JSON file holding the last accepted rule, so a host can restore it after restart.
pub struct RuleFile {
    path: PathBuf,
}

impl RuleFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the rule; a missing or unreadable file yields None.
    pub async fn load(&self) -> Option<ForwardingRule> {
        let s = tokio::fs::read_to_string(&self.path).await.ok()?;
        match serde_json::from_str(&s) {
            Ok(rule) => Some(rule),
            Err(e) => {
                log::warn!("ignoring invalid rule file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Write the rule to a sibling temp file, then rename it over the target so readers
    /// never see a partial file.
    pub async fn save(&self, rule: &ForwardingRule) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(rule)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rule.json".to_string());
        let tmp = self
            .path
            .with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }
}
