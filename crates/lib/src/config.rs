//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.forwarder/config.json`) and environment.
//! The forwarding rule itself lives in a separate rule file (see [`crate::rules::RuleFile`]).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatcher::FailureClass;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Relay engine policy (workers, retries, queue bounds).
    #[serde(default)]
    pub relay: RelayConfig,

    /// Outbound transport settings.
    #[serde(default)]
    pub outbound: OutboundConfig,

    /// Path of the persisted forwarding rule. Relative paths are resolved against the config file's parent.
    #[serde(default)]
    pub rule_file: Option<PathBuf>,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 17171).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: when a token is set, rule changes require `Authorization: Bearer <token>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// Shared secret. Overridden by FORWARDER_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

fn default_gateway_port() -> u16 {
    17171
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Relay policy: worker pool size, retry schedule, queue bounds and retention windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Number of delivery workers draining the queue (default 4).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Retries allowed after the first attempt before a task is marked failed (default 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay; doubles on each further retry (default 500ms).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single retry delay (default 60s).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Queued tasks allowed per sender before enqueue fails (default 100).
    #[serde(default = "default_per_sender_capacity")]
    pub per_sender_capacity: usize,

    /// Window in which a repeated message id is collapsed into one delivery (default 600s).
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    /// How long failed tasks stay available for inspection (default 3600s).
    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: u64,

    /// Timeout for one outbound send (default 10s).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// How long shutdown waits for in-flight sends (default 5s).
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Extra transport error codes and their class; merged over the built-in mapping.
    #[serde(default)]
    pub error_classes: HashMap<String, FailureClass>,
}

fn default_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_per_sender_capacity() -> usize {
    100
}

fn default_dedup_window_secs() -> u64 {
    600
}

fn default_failed_retention_secs() -> u64 {
    3600
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            per_sender_capacity: default_per_sender_capacity(),
            dedup_window_secs: default_dedup_window_secs(),
            failed_retention_secs: default_failed_retention_secs(),
            send_timeout_ms: default_send_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            error_classes: HashMap::new(),
        }
    }
}

/// Outbound webhook transport settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConfig {
    /// URL that receives `{"target", "body"}` POSTs. When unset the gateway refuses to start.
    pub webhook_url: Option<String>,
    /// Bearer token sent to the webhook. Overridden by FORWARDER_OUTBOUND_TOKEN env.
    pub token: Option<String>,
}

impl RelayConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the gateway token: env FORWARDER_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    non_empty_env("FORWARDER_GATEWAY_TOKEN").or_else(|| {
        config
            .gateway
            .auth
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the outbound webhook token: env FORWARDER_OUTBOUND_TOKEN overrides config.
pub fn resolve_outbound_token(config: &Config) -> Option<String> {
    non_empty_env("FORWARDER_OUTBOUND_TOKEN").or_else(|| {
        config
            .outbound
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("FORWARDER_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".forwarder").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Resolve the rule file: `ruleFile` if set (relative to the config file's parent), else `rule.json` beside the config.
pub fn resolve_rule_path(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.rule_file {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent.join(p)
            }
        }
        _ => config_parent.join("rule.json"),
    }
}

/// Load config from the given path (or FORWARDER_CONFIG_PATH / default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
