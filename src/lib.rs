//! Wakenode - wake word front end for a voice assistant router
//!
//! Listens to a microphone, detects a wake word, streams the following
//! utterance to a recognition router and plays back what the router says.
//! Nodes on the same network mute each other while one of them is busy.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────┐   events    ┌──────────────┐  commands  ┌──────────┐
//! │ capture thread        │ ──────────▶ │              │ ─────────▶ │          │
//! │ trigger → endpointing │             │     node     │            │  router  │
//! │                       │ ◀────────── │  (dispatch)  │ ◀───────── │          │
//! └───────────────────────┘   wake up   └──────┬───────┘ directives └──────────┘
//!                                              │ mute / unmute
//!                                       ┌──────▼───────┐
//!                                       │    peers     │  UDP hello + pub/sub
//!                                       └──────────────┘
//! ```

pub mod config;
pub mod error;
pub mod node;
pub mod peers;
pub mod router;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use node::{Dispatcher, Node};
