//! Live connection registry.
//!
//! Three maps are kept consistent under a single lock: connection to entry,
//! identity to connections, and room to connections. A connection is attached as
//! soon as its socket is up and only appears in the identity and room maps once it
//! has been registered with an authenticated identity.

use parley_protocol::{MessageType, OutboundFrame, RoomId, UserId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};

/// Per-connection outbound queue. Bounded; a full queue is reported as backpressure.
pub type Outbound = mpsc::Sender<OutboundFrame>;

/// How long a reply may wait for room in its connection's queue.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Frames an unauthenticated connection may receive.
pub(crate) fn permitted_before_auth(frame: &OutboundFrame) -> bool {
    matches!(
        frame.message_type(),
        None | Some(MessageType::Presence) | Some(MessageType::Error)
    )
}

/// What changed when a connection joined a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// False when the connection was already in the room.
    pub newly_joined: bool,
    /// True when no other connection of the same identity was in the room.
    pub first_for_user: bool,
}

/// Everything the registry knew about a connection when it was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    pub connection_id: ConnectionId,
    pub identity: Option<UserId>,
    pub rooms: HashSet<RoomId>,
    /// Rooms the identity no longer occupies through any connection.
    pub vacated_rooms: HashSet<RoomId>,
    /// True when this was the identity's last live connection.
    pub last_for_user: bool,
}

/// A resolved delivery target, detached from the registry lock.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub connection_id: ConnectionId,
    pub identity: Option<UserId>,
    outbound: Outbound,
}

impl Recipient {
    pub(crate) fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    identity: Option<UserId>,
    rooms: HashSet<RoomId>,
    /// Own lock so activity can be recorded under the registry's read lock.
    last_seen: StdMutex<Instant>,
    outbound: Outbound,
}

impl ConnectionEntry {
    fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_seen(&self, at: Instant) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    by_room: HashMap<RoomId, HashSet<ConnectionId>>,
}

impl RegistryState {
    fn recipient(&self, id: &ConnectionId) -> Option<Recipient> {
        self.connections.get(id).map(|entry| Recipient {
            connection_id: id.clone(),
            identity: entry.identity.clone(),
            outbound: entry.outbound.clone(),
        })
    }

    fn recipients<'a>(&self, ids: impl IntoIterator<Item = &'a ConnectionId>) -> Vec<Recipient> {
        let mut recipients: Vec<Recipient> =
            ids.into_iter().filter_map(|id| self.recipient(id)).collect();
        recipients.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        recipients
    }

    fn user_in_room(&self, user: &UserId, room: &RoomId, except: &ConnectionId) -> bool {
        self.by_user.get(user).is_some_and(|connections| {
            connections.iter().filter(|id| *id != except).any(|id| {
                self.connections
                    .get(id)
                    .is_some_and(|entry| entry.rooms.contains(room))
            })
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly upgraded socket. It starts unauthenticated.
    pub async fn attach(&self, id: ConnectionId, outbound: Outbound) -> RelayResult<()> {
        let mut state = self.state.write().await;
        if state.connections.contains_key(&id) {
            return Err(RelayError::ConnectionExists(id));
        }

        state.connections.insert(
            id.clone(),
            ConnectionEntry {
                identity: None,
                rooms: HashSet::new(),
                last_seen: StdMutex::new(Instant::now()),
                outbound,
            },
        );
        debug!(connection_id = %id, "connection attached");
        Ok(())
    }

    /// Bind an authenticated identity to a connection.
    ///
    /// Returns `true` when this is the identity's first live connection. Registering
    /// the same identity again is a no-op; a different identity is refused.
    pub async fn register(&self, id: &ConnectionId, identity: UserId) -> RelayResult<bool> {
        let mut state = self.state.write().await;
        let entry = state
            .connections
            .get_mut(id)
            .ok_or_else(|| RelayError::UnknownConnection(id.clone()))?;

        match &entry.identity {
            Some(existing) if *existing == identity => return Ok(false),
            Some(_) => return Err(RelayError::IdentityConflict),
            None => entry.identity = Some(identity.clone()),
        }
        entry.mark_seen(Instant::now());

        let connections = state.by_user.entry(identity.clone()).or_default();
        let first_for_user = connections.is_empty();
        connections.insert(id.clone());

        info!(
            connection_id = %id,
            user_id = %identity,
            first_for_user,
            "connection registered"
        );
        Ok(first_for_user)
    }

    pub async fn join_room(&self, id: &ConnectionId, room: RoomId) -> RelayResult<JoinOutcome> {
        let mut state = self.state.write().await;
        let identity = match state.connections.get(id) {
            None => return Err(RelayError::UnknownConnection(id.clone())),
            Some(entry) => entry.identity.clone().ok_or(RelayError::NotAuthenticated)?,
        };

        let first_for_user = !state.user_in_room(&identity, &room, id);
        let newly_joined = state
            .connections
            .get_mut(id)
            .map(|entry| entry.rooms.insert(room.clone()))
            .unwrap_or(false);
        state.by_room.entry(room.clone()).or_default().insert(id.clone());

        debug!(connection_id = %id, room = %room, newly_joined, "joined room");
        Ok(JoinOutcome {
            newly_joined,
            first_for_user: newly_joined && first_for_user,
        })
    }

    /// Returns `true` when the identity no longer occupies the room through any connection.
    pub async fn leave_room(&self, id: &ConnectionId, room: &RoomId) -> RelayResult<bool> {
        let mut state = self.state.write().await;
        let entry = state
            .connections
            .get_mut(id)
            .ok_or_else(|| RelayError::UnknownConnection(id.clone()))?;
        let identity = entry.identity.clone().ok_or(RelayError::NotAuthenticated)?;

        if !entry.rooms.remove(room) {
            return Ok(false);
        }
        remove_from_index(&mut state.by_room, room, id);

        let vacated = !state.user_in_room(&identity, room, id);
        debug!(connection_id = %id, room = %room, vacated, "left room");
        Ok(vacated)
    }

    /// Remove a connection from every index. Idempotent: the second call returns `None`.
    pub async fn unregister(&self, id: &ConnectionId) -> Option<Departed> {
        let mut state = self.state.write().await;
        let entry = state.connections.remove(id)?;

        for room in &entry.rooms {
            assert!(
                remove_from_index(&mut state.by_room, room, id),
                "registry out of sync: {id} listed room {room} without a room entry"
            );
        }

        let mut last_for_user = false;
        let mut vacated_rooms = HashSet::new();
        if let Some(identity) = &entry.identity {
            let removed = remove_from_index(&mut state.by_user, identity, id);
            assert!(
                removed,
                "registry out of sync: {id} bound to {identity} without a user entry"
            );
            last_for_user = !state.by_user.contains_key(identity);
            vacated_rooms = entry
                .rooms
                .iter()
                .filter(|room| !state.user_in_room(identity, room, id))
                .cloned()
                .collect();
        }

        info!(
            connection_id = %id,
            user_id = ?entry.identity,
            last_for_user,
            "connection unregistered"
        );

        Some(Departed {
            connection_id: id.clone(),
            identity: entry.identity,
            rooms: entry.rooms,
            vacated_rooms,
            last_for_user,
        })
    }

    pub async fn connections_for(&self, user: &UserId) -> HashSet<ConnectionId> {
        self.state
            .read()
            .await
            .by_user
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn connections_in_room(&self, room: &RoomId) -> HashSet<ConnectionId> {
        self.state
            .read()
            .await
            .by_room
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    /// Rooms the identity occupies through any of its connections.
    pub async fn rooms_of_user(&self, user: &UserId) -> HashSet<RoomId> {
        let state = self.state.read().await;
        state
            .by_user
            .get(user)
            .into_iter()
            .flatten()
            .filter_map(|id| state.connections.get(id))
            .flat_map(|entry| entry.rooms.iter().cloned())
            .collect()
    }

    pub async fn identity_of(&self, id: &ConnectionId) -> Option<UserId> {
        self.state
            .read()
            .await
            .connections
            .get(id)
            .and_then(|entry| entry.identity.clone())
    }

    pub async fn is_member(&self, id: &ConnectionId, room: &RoomId) -> bool {
        self.state
            .read()
            .await
            .connections
            .get(id)
            .is_some_and(|entry| entry.rooms.contains(room))
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.state.read().await.by_user.contains_key(user)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Record inbound activity. Only the read lock is taken.
    pub async fn touch(&self, id: &ConnectionId) {
        if let Some(entry) = self.state.read().await.connections.get(id) {
            entry.mark_seen(Instant::now());
        }
    }

    /// When the connection last sent anything. The gateway's idle timeout is measured from it.
    pub async fn last_seen(&self, id: &ConnectionId) -> Option<Instant> {
        self.state
            .read()
            .await
            .connections
            .get(id)
            .map(ConnectionEntry::last_seen)
    }

    /// Queue a frame for one connection, enforcing the pre-authentication allowlist.
    ///
    /// Waits for queue space, up to a bound; a queue that stays full is reported as
    /// [`RelayError::OutboundFull`] and the frame is not sent.
    pub async fn send_to(&self, id: &ConnectionId, frame: OutboundFrame) -> RelayResult<()> {
        let recipient = self
            .state
            .read()
            .await
            .recipient(id)
            .ok_or_else(|| RelayError::UnknownConnection(id.clone()))?;

        if !recipient.is_authenticated() && !permitted_before_auth(&frame) {
            return Err(RelayError::NotAuthenticated);
        }

        match recipient.outbound.send_timeout(frame, REPLY_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(connection_id = %id, "outbound queue stayed full, frame not sent");
                Err(RelayError::OutboundFull(id.clone()))
            }
            Err(SendTimeoutError::Closed(_)) => Err(RelayError::OutboundClosed(id.clone())),
        }
    }

    pub(crate) async fn user_recipients(&self, user: &UserId) -> Vec<Recipient> {
        let state = self.state.read().await;
        match state.by_user.get(user) {
            Some(ids) => state.recipients(ids),
            None => Vec::new(),
        }
    }

    pub(crate) async fn room_recipients(&self, room: &RoomId) -> Vec<Recipient> {
        let state = self.state.read().await;
        match state.by_room.get(room) {
            Some(ids) => state.recipients(ids),
            None => Vec::new(),
        }
    }
}

/// Remove `id` from `key`'s set, dropping the set once empty. Returns whether it was present.
fn remove_from_index<K>(
    index: &mut HashMap<K, HashSet<ConnectionId>>,
    key: &K,
    id: &ConnectionId,
) -> bool
where
    K: std::hash::Hash + Eq,
{
    let Some(ids) = index.get_mut(key) else {
        return false;
    };
    let removed = ids.remove(id);
    if ids.is_empty() {
        index.remove(key);
    }
    removed
}
