//! Contracts for the services the relay consumes but does not own.
//!
//! Identity issuance, room membership, key exchange and durable storage all live
//! elsewhere. The relay only sees these traits; the in-memory implementations at the
//! bottom of this module back tests and single-process deployments.

use async_trait::async_trait;
use parley_crypto::SymmetricKey;
use parley_protocol::{Envelope, RoomId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("token rejected: {0}")]
    TokenRejected(String),

    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },
}

impl CollaboratorError {
    pub fn unavailable(service: &'static str, message: impl ToString) -> Self {
        Self::Unavailable {
            service,
            message: message.to_string(),
        }
    }
}

/// Turns a bearer token into the identity it was issued for.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<UserId, CollaboratorError>;
}

/// Answers who belongs to a room.
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    async fn members_of(&self, room: &RoomId) -> Result<HashSet<UserId>, CollaboratorError>;
}

/// What a key is shared between.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyScope {
    Room(RoomId),
    /// Always stored with the lower identity first.
    Pair(UserId, UserId),
}

impl KeyScope {
    pub fn pair(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self::Pair(a, b)
        } else {
            Self::Pair(b, a)
        }
    }
}

/// Supplies the symmetric key for a room or peer pair, if one has been exchanged.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn key_for(&self, scope: &KeyScope) -> Result<Option<SymmetricKey>, CollaboratorError>;
}

/// Takes responsibility for envelopes that had no live recipient.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn persist(&self, envelope: &Envelope) -> Result<(), CollaboratorError>;
}

/// Everything a [`crate::Relay`] needs from the outside.
#[derive(Clone)]
pub struct Collaborators {
    pub verifier: Arc<dyn TokenVerifier>,
    pub directory: Arc<dyn MembershipDirectory>,
    pub keys: Arc<dyn KeyProvider>,
    pub offline: Option<Arc<dyn OfflineStore>>,
}

/// A group conversation as the directory knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub members: HashSet<UserId>,
    /// Identifier of the shared key, when the room is encrypted.
    pub key_id: Option<String>,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashSet::new(),
            key_id: None,
        }
    }

    pub fn with_members(mut self, members: impl IntoIterator<Item = UserId>) -> Self {
        self.members.extend(members);
        self
    }
}

/// Fixed token table.
#[derive(Debug, Default, Clone)]
pub struct StaticTokens {
    tokens: HashMap<String, UserId>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: impl Into<String>, user: impl Into<UserId>) -> Self {
        self.tokens.insert(token.into(), user.into());
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokens {
    async fn verify_token(&self, token: &str) -> Result<UserId, CollaboratorError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| CollaboratorError::TokenRejected("unknown token".to_string()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    rooms: RwLock<HashMap<RoomId, Room>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, room: Room) {
        self.rooms.write().await.insert(room.id.clone(), room);
    }

    pub async fn add_member(&self, room: &RoomId, user: UserId) {
        self.rooms
            .write()
            .await
            .entry(room.clone())
            .or_insert_with(|| Room::new(room.clone()))
            .members
            .insert(user);
    }

    pub async fn remove_member(&self, room: &RoomId, user: &UserId) -> bool {
        self.rooms
            .write()
            .await
            .get_mut(room)
            .map(|room| room.members.remove(user))
            .unwrap_or(false)
    }
}

#[async_trait]
impl MembershipDirectory for InMemoryDirectory {
    async fn members_of(&self, room: &RoomId) -> Result<HashSet<UserId>, CollaboratorError> {
        Ok(self
            .rooms
            .read()
            .await
            .get(room)
            .map(|room| room.members.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticKeys {
    keys: HashMap<KeyScope, SymmetricKey>,
}

impl StaticKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, scope: KeyScope, key: SymmetricKey) -> Self {
        self.keys.insert(scope, key);
        self
    }
}

#[async_trait]
impl KeyProvider for StaticKeys {
    async fn key_for(&self, scope: &KeyScope) -> Result<Option<SymmetricKey>, CollaboratorError> {
        Ok(self.keys.get(scope).cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryOfflineStore {
    envelopes: Mutex<Vec<Envelope>>,
}

impl MemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stored(&self) -> Vec<Envelope> {
        self.envelopes.lock().await.clone()
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    async fn persist(&self, envelope: &Envelope) -> Result<(), CollaboratorError> {
        self.envelopes.lock().await.push(envelope.clone());
        Ok(())
    }
}
