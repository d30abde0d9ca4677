//! Wire message definitions for the WhisperRelay protocol.
//!
//! Messages travel as JSON text frames over a single WebSocket per client.
//! Message types use a kebab-case `type` tag; payload fields are camelCase
//! for easy interop with browser clients.
//!
//! The server relays [`Envelope`] contents verbatim. Both fields are
//! transport-safe strings (clients base64-encode an AES-GCM IV and the
//! ciphertext); the server never decodes or validates them.

use serde::{Deserialize, Serialize};

/// An opaque encrypted payload: initialization vector plus ciphertext.
///
/// The relay stores and forwards these strings untouched. Only the two
/// endpoints hold the keys needed to interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Initialization vector, transport-safe encoded by the sender.
    pub iv: String,
    /// Ciphertext, transport-safe encoded by the sender.
    pub ciphertext: String,
}

/// A registered user's presence record as shared with other clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Display name, original casing preserved.
    pub username: String,
    /// Public key export supplied at registration (opaque to the server).
    pub public_key: String,
}

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Claim a username and publish public key material.
    ///
    /// Must be the first (and only) registration on a connection; relaying
    /// is unavailable until it succeeds.
    #[serde(rename_all = "camelCase")]
    Register { username: String, public_key: String },

    /// Relay an encrypted envelope to another registered user.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        to_username: String,
        envelope: Envelope,
    },
}

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Snapshot of every other registered user, sent once to the caller
    /// immediately after its registration succeeds.
    UpdateUserList { users: Vec<PeerInfo> },

    /// A new user registered. Broadcast to all other registered connections.
    #[serde(rename_all = "camelCase")]
    UserConnected { username: String, public_key: String },

    /// A registered user's connection closed. Broadcast to all others.
    UserDisconnected { username: String },

    /// An envelope relayed from another user. The sender is identified by
    /// username only; connection handles never leave the server.
    #[serde(rename_all = "camelCase")]
    ReceiveMessage {
        from_username: String,
        envelope: Envelope,
    },

    /// Registration was rejected. Depending on the reason the server may
    /// close the connection afterwards.
    RegistrationFailed { reason: String },

    /// Non-fatal error report to the caller (e.g. recipient offline).
    Error { message: String },
}

impl ClientMessage {
    /// Parses a client message from a JSON text frame.
    pub fn from_json(text: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    /// Encodes the message as a JSON text frame.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
