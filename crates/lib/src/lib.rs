//! Forwarder core library: message relay engine plus the gateway host used by the CLI.
//!
//! Inbound payloads are decoded, matched against the forwarding rule, queued per sender
//! and delivered through a host-supplied transport with retry.

pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod init;
pub mod queue;
pub mod rules;
pub mod task;
pub mod transport;

pub use decoder::{decode, DecodeError, InboundMessage, TransportMeta};
pub use dispatcher::{DispatchError, Dispatcher, ErrorClassifier, FailureClass};
pub use engine::{Admission, RelayEngine, RelayError, RelayPolicy, RelayStats};
pub use events::{RelayEvent, RelayEventKind, SkipReason};
pub use queue::{DeliveryQueue, QueueError};
pub use rules::{ConfigError, ForwardingRule, RuleFile, RuleStore};
pub use task::{RelayTask, TaskId, TaskSnapshot, TaskState};
pub use transport::{Transport, TransportError, WebhookTransport};
