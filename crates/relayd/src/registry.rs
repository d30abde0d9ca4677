//! Session registry: the source of truth for who is online.
//!
//! The registry maps live connections to registered identities and enforces
//! global case-insensitive username uniqueness. It exclusively owns all
//! identity records; the router and the connection tasks only read through
//! its API.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use protocol::{PeerInfo, ServerMessage};

/// Opaque server-assigned handle for one live connection.
///
/// Never shown to other clients; recipients only ever learn usernames.
pub type ConnectionId = uuid::Uuid;

/// Default depth of each connection's outbound delivery queue.
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Errors returned by registration attempts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Username or public key was empty after trimming. No state change;
    /// the client may retry with corrected input.
    #[error("invalid registration: {0}")]
    InvalidInput(String),

    /// Another live connection already holds this username
    /// (case-insensitive). Terminal for the connection: the caller is
    /// expected to inform the client and close.
    #[error("username already taken: {0}")]
    NameTaken(String),

    /// This connection is already registered. The existing identity is
    /// left untouched.
    #[error("connection already registered as: {0}")]
    AlreadyRegistered(String),
}

/// The identity bound to one connection for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Owning connection.
    pub connection_id: ConnectionId,
    /// Display name, original casing preserved.
    pub username: String,
    /// Opaque public key export supplied at registration.
    pub public_key: String,
}

impl Identity {
    /// The portion of the identity shared with other clients.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            username: self.username.clone(),
            public_key: self.public_key.clone(),
        }
    }
}

/// A registered connection: its identity plus the delivery queue feeding
/// its writer task.
struct RegisteredUser {
    identity: Identity,
    outbound: mpsc::Sender<ServerMessage>,
}

/// Thread-safe registry of online identities.
///
/// Two maps: connection handle to identity, and lowercased username back to
/// connection handle. The username index is the uniqueness authority; its
/// entry API makes the check-and-claim a single indivisible step, so two
/// concurrent registrations for the same name can never both succeed.
pub struct SessionRegistry {
    connections: DashMap<ConnectionId, RegisteredUser>,
    usernames: DashMap<String, ConnectionId>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            usernames: DashMap::new(),
        }
    }

    /// Registers an identity for `connection_id`.
    ///
    /// On success returns the created identity plus the point-in-time
    /// snapshot of all *other* registered identities, for the caller's
    /// initial user list. The caller is responsible for broadcasting the
    /// arrival afterwards; by then the identity is fully resolvable.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        username: &str,
        public_key: &str,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<(Identity, Vec<PeerInfo>), RegistryError> {
        let username = username.trim();
        let public_key = public_key.trim();

        if username.is_empty() || public_key.is_empty() {
            return Err(RegistryError::InvalidInput(
                "username and public key must be non-empty".to_string(),
            ));
        }

        // Claim the connection slot first, holding its entry across the
        // name claim; a racing register for the same connection blocks
        // here and then lands in Occupied, so one connection can never
        // end up owning two names.
        let connection_slot = match self.connections.entry(connection_id) {
            Entry::Occupied(existing) => {
                return Err(RegistryError::AlreadyRegistered(
                    existing.get().identity.username.clone(),
                ));
            }
            Entry::Vacant(slot) => slot,
        };

        // Claim the name. The vacant-entry insert is the atomic
        // check-and-claim; losers of a same-name race land in Occupied.
        match self.usernames.entry(username.to_lowercase()) {
            Entry::Occupied(_) => {
                return Err(RegistryError::NameTaken(username.to_string()));
            }
            Entry::Vacant(entry) => {
                entry.insert(connection_id);
            }
        }

        let identity = Identity {
            connection_id,
            username: username.to_string(),
            public_key: public_key.to_string(),
        };
        connection_slot.insert(RegisteredUser {
            identity: identity.clone(),
            outbound,
        });

        tracing::info!(
            connection_id = %connection_id,
            username = %identity.username,
            "User registered"
        );

        let peers = self
            .connections
            .iter()
            .filter(|entry| *entry.key() != connection_id)
            .map(|entry| entry.value().identity.peer_info())
            .collect();

        Ok((identity, peers))
    }

    /// Removes the identity owned by `connection_id`, if any.
    ///
    /// Idempotent: the first caller gets the removed identity back (so it
    /// can broadcast the departure), later callers get `None`. Once this
    /// returns, the username no longer resolves.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<Identity> {
        let (_, user) = self.connections.remove(connection_id)?;

        // Only drop the index entry if it still points at this connection.
        self.usernames
            .remove_if(&user.identity.username.to_lowercase(), |_, owner| {
                owner == connection_id
            });

        tracing::info!(
            connection_id = %connection_id,
            username = %user.identity.username,
            "User removed"
        );

        Some(user.identity)
    }

    /// Resolves a username (case-insensitive exact match) to its live
    /// connection. Returns `None` once the owner has unregistered.
    pub fn resolve_username(&self, username: &str) -> Option<ConnectionId> {
        self.usernames
            .get(&username.trim().to_lowercase())
            .map(|entry| *entry.value())
    }

    /// Resolves a connection handle to its registered identity.
    pub fn resolve_connection(&self, connection_id: &ConnectionId) -> Option<Identity> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.value().identity.clone())
    }

    /// Enqueues a message for delivery to one connection.
    ///
    /// Non-blocking: a missing connection, a closed queue, or a full queue
    /// all report non-delivery without stalling the caller.
    pub fn send_to(&self, connection_id: &ConnectionId, message: ServerMessage) -> bool {
        let Some(user) = self.connections.get(connection_id) else {
            return false;
        };

        match user.outbound.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    username = %user.identity.username,
                    error = %e,
                    "Dropping message for connection with unavailable queue"
                );
                false
            }
        }
    }

    /// Delivers a message to every registered connection except the
    /// originator.
    ///
    /// Works from a snapshot of (handle, queue) pairs taken before any
    /// delivery, so sends never happen while iterating the map. A peer
    /// registering concurrently may miss the message; a peer already
    /// removed can never receive it.
    pub fn broadcast_except(&self, originator: &ConnectionId, message: ServerMessage) {
        let recipients: Vec<(ConnectionId, mpsc::Sender<ServerMessage>)> = self
            .connections
            .iter()
            .filter(|entry| entry.key() != originator)
            .map(|entry| (*entry.key(), entry.value().outbound.clone()))
            .collect();

        for (connection_id, outbound) in recipients {
            if let Err(e) = outbound.try_send(message.clone()) {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "Dropping broadcast for connection with unavailable queue"
                );
            }
        }
    }

    /// Number of currently registered identities.
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn queue() -> (
        mpsc::Sender<ServerMessage>,
        mpsc::Receiver<ServerMessage>,
    ) {
        mpsc::channel(DEFAULT_OUTBOUND_QUEUE_DEPTH)
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new_v4();
        let (tx, _rx) = queue();

        let (identity, peers) = registry.register(conn, "alice", "pk-alice", tx).unwrap();
        assert_eq!(identity.username, "alice");
        assert!(peers.is_empty());
        assert_eq!(registry.count(), 1);

        assert_eq!(registry.resolve_username("alice"), Some(conn));
        // Case-insensitive lookup, original casing preserved.
        assert_eq!(registry.resolve_username("ALICE"), Some(conn));
        let identity = registry.resolve_connection(&conn).unwrap();
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.public_key, "pk-alice");
    }

    #[test]
    fn test_register_trims_and_preserves_casing() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new_v4();
        let (tx, _rx) = queue();

        registry.register(conn, "  Alice  ", " pk ", tx).unwrap();

        let identity = registry.resolve_connection(&conn).unwrap();
        assert_eq!(identity.username, "Alice");
        assert_eq!(identity.public_key, "pk");
        assert_eq!(registry.resolve_username("alice"), Some(conn));
    }

    #[test]
    fn test_register_rejects_empty_input() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new_v4();
        let (tx, _rx) = queue();

        let result = registry.register(conn, "   ", "pk", tx.clone());
        assert!(matches!(result, Err(RegistryError::InvalidInput(_))));

        let result = registry.register(conn, "alice", "", tx);
        assert!(matches!(result, Err(RegistryError::InvalidInput(_))));

        // No side effects: the connection stays unregistered.
        assert_eq!(registry.count(), 0);
        assert!(registry.resolve_connection(&conn).is_none());
    }

    #[test]
    fn test_register_rejects_case_insensitive_duplicate() {
        let registry = SessionRegistry::new();
        let (tx_a, _rx_a) = queue();
        let (tx_b, _rx_b) = queue();
        let conn_a = ConnectionId::new_v4();
        let conn_b = ConnectionId::new_v4();

        registry.register(conn_a, "alice", "pk-a", tx_a).unwrap();
        let result = registry.register(conn_b, "Alice", "pk-b", tx_b);

        assert_eq!(result, Err(RegistryError::NameTaken("Alice".to_string())));
        assert_eq!(registry.count(), 1);
        // The original registration is untouched.
        assert_eq!(registry.resolve_username("ALICE"), Some(conn_a));
    }

    #[test]
    fn test_second_register_on_same_connection_is_rejected() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new_v4();
        let (tx, _rx) = queue();

        registry
            .register(conn, "alice", "pk", tx.clone())
            .unwrap();
        let result = registry.register(conn, "alice2", "pk2", tx);

        assert_eq!(
            result,
            Err(RegistryError::AlreadyRegistered("alice".to_string()))
        );
        assert_eq!(registry.resolve_username("alice"), Some(conn));
        assert!(registry.resolve_username("alice2").is_none());
    }

    #[test]
    fn test_peer_snapshot_excludes_caller() {
        let registry = SessionRegistry::new();
        let (tx_a, _rx_a) = queue();
        let (tx_b, _rx_b) = queue();
        let conn_a = ConnectionId::new_v4();
        let conn_b = ConnectionId::new_v4();

        registry.register(conn_a, "alice", "pk-a", tx_a).unwrap();
        let (_, peers) = registry.register(conn_b, "bob", "pk-b", tx_b).unwrap();

        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].username, "alice");
        assert_eq!(peers[0].public_key, "pk-a");
    }

    #[test]
    fn test_unregister_is_idempotent_and_frees_name() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new_v4();
        let (tx, _rx) = queue();

        registry.register(conn, "alice", "pk", tx).unwrap();

        let removed = registry.unregister(&conn).unwrap();
        assert_eq!(removed.username, "alice");
        assert!(registry.resolve_username("alice").is_none());
        assert!(registry.resolve_connection(&conn).is_none());

        // Second unregister is a no-op.
        assert!(registry.unregister(&conn).is_none());

        // The name is free for a new connection.
        let conn2 = ConnectionId::new_v4();
        let (tx2, _rx2) = queue();
        registry.register(conn2, "Alice", "pk2", tx2).unwrap();
        assert_eq!(registry.resolve_username("alice"), Some(conn2));
    }

    #[test]
    fn test_send_to_delivers_and_reports_missing() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new_v4();
        let (tx, mut rx) = queue();

        registry.register(conn, "alice", "pk", tx).unwrap();

        let delivered = registry.send_to(
            &conn,
            ServerMessage::UserDisconnected {
                username: "bob".to_string(),
            },
        );
        assert!(delivered);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::UserDisconnected { .. }
        ));

        let unknown = ConnectionId::new_v4();
        assert!(!registry.send_to(
            &unknown,
            ServerMessage::UserDisconnected {
                username: "bob".to_string(),
            }
        ));
    }

    #[test]
    fn test_broadcast_excludes_originator() {
        let registry = SessionRegistry::new();
        let (tx_a, mut rx_a) = queue();
        let (tx_b, mut rx_b) = queue();
        let conn_a = ConnectionId::new_v4();
        let conn_b = ConnectionId::new_v4();

        registry.register(conn_a, "alice", "pk-a", tx_a).unwrap();
        registry.register(conn_b, "bob", "pk-b", tx_b).unwrap();

        registry.broadcast_except(
            &conn_b,
            ServerMessage::UserConnected {
                username: "bob".to_string(),
                public_key: "pk-b".to_string(),
            },
        );

        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerMessage::UserConnected { .. }
        ));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_same_name_registrations_admit_exactly_one() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();

        // Case variants of one logical name, racing from separate tasks.
        for name in ["racer", "Racer", "RACER", "rAcEr", "racER"] {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(8);
                registry.register(ConnectionId::new_v4(), name, "pk", tx)
            }));
        }

        let mut successes = 0;
        let mut name_taken = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(RegistryError::NameTaken(_)) => name_taken += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(name_taken, 4);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_registers_on_one_connection_claim_one_name() {
        let registry = Arc::new(SessionRegistry::new());
        let conn = ConnectionId::new_v4();
        let mut handles = Vec::new();

        // One connection racing itself with distinct names.
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(8);
                registry.register(conn, &format!("claim-{i}"), "pk", tx)
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(RegistryError::AlreadyRegistered(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(registry.count(), 1);

        // Tearing the connection down frees every name it ever touched;
        // losers must not have left entries behind.
        registry.unregister(&conn).unwrap();
        for i in 0..8 {
            assert!(registry.resolve_username(&format!("claim-{i}")).is_none());
        }
    }

    #[tokio::test]
    async fn test_concurrent_register_unregister_leaves_no_orphans() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();

        for i in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let conn = ConnectionId::new_v4();
                let (tx, _rx) = mpsc::channel(8);
                let name = format!("user-{i}");
                if registry.register(conn, &name, "pk", tx).is_ok() {
                    registry.unregister(&conn);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.count(), 0);
        for i in 0..32 {
            assert!(registry.resolve_username(&format!("user-{i}")).is_none());
        }
    }
}
