//! # WhisperRelay Daemon Library
//!
//! This crate provides the relay server for WhisperRelay, an
//! end-to-end-encrypted chat. The server tracks which users are online,
//! hands out their public key material, and routes opaque encrypted
//! envelopes between exactly two parties. Plaintext and private keys never
//! exist on the server.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                    Relay Server                       │
//! ├───────────────────────────────────────────────────────┤
//! │                                                       │
//! │   per-connection task ── dispatch ──┐                 │
//! │   per-connection task ── dispatch ──┤                 │
//! │                                     ▼                 │
//! │  ┌─────────────────┐      ┌──────────────────┐        │
//! │  │ Message Router  │─────▶│ Session Registry │        │
//! │  └─────────────────┘      └──────────────────┘        │
//! │          │                         │                  │
//! │          └──── outbound queues ────┘                  │
//! │                      │                                │
//! │              writer task per connection               │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`registry`]: Presence bookkeeping and username uniqueness
//! - [`router`]: Envelope relay between registered connections
//! - [`server`]: WebSocket accept loop and per-connection protocol

pub mod config;
pub mod registry;
pub mod router;
pub mod server;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export registry types for convenience
pub use registry::{
    ConnectionId, Identity, RegistryError, SessionRegistry, DEFAULT_OUTBOUND_QUEUE_DEPTH,
};

// Re-export router types for convenience
pub use router::{MessageRouter, RouterError};

// Re-export server types for convenience
pub use server::RelayServer;
