//! Room keys resolved through the key id stored on each room.

use std::collections::HashMap;

use async_trait::async_trait;
use parley_config::KeysConfig;
use parley_crypto::{CryptoError, SymmetricKey};
use parley_database::RoomRepository;
use parley_relay::{CollaboratorError, KeyProvider, KeyScope};

pub struct RoomKeyring {
    rooms: RoomRepository,
    keys: HashMap<String, SymmetricKey>,
}

impl RoomKeyring {
    pub fn from_config(rooms: RoomRepository, config: &KeysConfig) -> Result<Self, CryptoError> {
        let keys = config
            .keyring
            .iter()
            .map(|(id, encoded)| Ok((id.clone(), SymmetricKey::from_base64(encoded)?)))
            .collect::<Result<HashMap<_, _>, CryptoError>>()?;
        Ok(Self { rooms, keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl KeyProvider for RoomKeyring {
    /// Pair keys never reach the server, so direct envelopes are forwarded opaque.
    async fn key_for(&self, scope: &KeyScope) -> Result<Option<SymmetricKey>, CollaboratorError> {
        let KeyScope::Room(room) = scope else {
            return Ok(None);
        };
        let Some(room) = self.rooms.find(room).await? else {
            return Ok(None);
        };
        Ok(room.key_id.and_then(|id| self.keys.get(&id).cloned()))
    }
}
