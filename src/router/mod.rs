//! Command channel to the recognition router
//!
//! Outbound: `[command_tag, payload]`. Inbound: `[tag, params_json, audio]`.
//! Each connection opens with the node's identity frame and a `GREET`.

mod client;
pub mod codec;
mod command;
pub mod retry;
mod tracker;

pub use client::{CommandChannel, RouterLink};
pub use command::{Command, GREET, OutboundCommand, RouterDirective};
pub use retry::RetryPolicy;
pub use tracker::{UtterancePhase, UtteranceTracker};
