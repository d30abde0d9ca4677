//! Envelope router: delivers one opaque payload between two registered
//! connections, or reports why it could not.
//!
//! The router never inspects, decodes, or size-limits envelope contents;
//! it only resolves usernames through the [`SessionRegistry`] and attaches
//! correct sender attribution.

use std::sync::Arc;

use thiserror::Error;

use protocol::{Envelope, ServerMessage};

use crate::registry::{ConnectionId, SessionRegistry};

/// Errors that can occur while relaying an envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    /// The sending connection has no registered identity. Protocol
    /// violation by the client; the request is dropped.
    #[error("sender is not registered")]
    UnauthenticatedSender,

    /// The destination username does not resolve to a live connection.
    /// A normal routing outcome, reported back to the sender.
    #[error("user {username} is not online")]
    RecipientOffline {
        /// The username that failed to resolve.
        username: String,
    },
}

/// Routes relay requests through the shared registry.
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
}

impl MessageRouter {
    /// Creates a router over the given registry.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Relays `envelope` from the connection `sender` to the user named
    /// `to_username`.
    ///
    /// The recipient receives the sender's *username*, never its
    /// connection handle. Delivery is fire-and-forget: success means the
    /// envelope was enqueued for the recipient's connection, not that the
    /// recipient's application processed it.
    pub fn relay(
        &self,
        sender: &ConnectionId,
        to_username: &str,
        envelope: Envelope,
    ) -> Result<(), RouterError> {
        let sender_identity = self
            .registry
            .resolve_connection(sender)
            .ok_or(RouterError::UnauthenticatedSender)?;

        let offline = || RouterError::RecipientOffline {
            username: to_username.trim().to_string(),
        };
        let recipient = self
            .registry
            .resolve_username(to_username)
            .ok_or_else(offline)?;

        tracing::debug!(
            from = %sender_identity.username,
            to = %to_username,
            "Relaying message"
        );

        let message = ServerMessage::ReceiveMessage {
            from_username: sender_identity.username,
            envelope,
        };

        // The recipient can vanish between resolution and delivery; a
        // failed enqueue is the same outcome as never resolving.
        if self.registry.send_to(&recipient, message) {
            Ok(())
        } else {
            Err(offline())
        }
    }
}
