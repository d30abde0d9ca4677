//! # WhisperRelay Protocol Library
//!
//! Shared wire definitions for the WhisperRelay end-to-end-encrypted chat
//! relay. The server's only job is presence bookkeeping and routing: it
//! never holds key material beyond the opaque public key strings clients
//! publish, and relayed [`Envelope`] payloads pass through unread.
//!
//! ## Modules
//!
//! - [`messages`]: client/server message enums and payload types
//! - [`error`]: the shared [`ProtocolError`] type

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{ClientMessage, Envelope, PeerInfo, ServerMessage};
