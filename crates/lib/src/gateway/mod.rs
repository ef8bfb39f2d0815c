//! Gateway: HTTP + WebSocket host for the relay engine.
//!
//! Single port serves the inbound endpoint, rule management, task inspection and a
//! WebSocket stream of relay events.

mod protocol;
mod server;

pub use protocol::{event_frame, RuleParams, SHUTDOWN_EVENT_JSON};
pub use server::{build_state, router, run_gateway, GatewayState};
