//! Token Store Module
//!
//! Process-wide holder of the credential pair and user record, mirrored to
//! persisted slots so a session survives restarts.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::auth::storage::{best_effort, MemorySlots, Slot, SlotStorage};
use crate::auth::{CredentialPair, UserRecord};

#[derive(Debug, Default)]
struct Session {
    pair: Option<Arc<CredentialPair>>,
    user: Option<UserRecord>,
}

// == Token Store ==
/// Storage facade for the credential pair.
///
/// The pair lives behind a single lock and is swapped as one `Arc`, so a
/// reader never sees the access token of one `set` next to the refresh token
/// of another. Persistence happens while the write lock is held, which keeps
/// the slots in the same order as the in-memory state.
pub struct TokenStore {
    session: RwLock<Session>,
    storage: Box<dyn SlotStorage>,
}

impl TokenStore {
    // == Constructors ==
    /// Opens a store backed by `storage`, restoring any persisted session.
    ///
    /// The combined credentials slot wins. Without it, the per-token slots of
    /// earlier releases are used, and only if both are present.
    pub fn load(storage: impl SlotStorage + 'static) -> Self {
        let pair = best_effort("load", Slot::Credentials, storage.load(Slot::Credentials))
            .flatten()
            .and_then(|raw| serde_json::from_str::<CredentialPair>(&raw).ok())
            .or_else(|| load_split_pair(&storage))
            .map(Arc::new);
        let user = best_effort("load", Slot::User, storage.load(Slot::User))
            .flatten()
            .and_then(|raw| serde_json::from_str::<UserRecord>(&raw).ok());

        debug!("Token store loaded, session present: {}", pair.is_some());

        Self {
            session: RwLock::new(Session { pair, user }),
            storage: Box::new(storage),
        }
    }

    /// Empty, non-durable store.
    pub fn in_memory() -> Self {
        Self::load(MemorySlots::new())
    }

    // == Get ==
    /// Current pair, if any. Side-effect free.
    pub fn get(&self) -> Option<Arc<CredentialPair>> {
        self.session.read().pair.clone()
    }

    /// Current access token, if any.
    pub fn access_token(&self) -> Option<String> {
        self.session.read().pair.as_ref().map(|p| p.access.clone())
    }

    /// Signed-in user record, if any.
    pub fn user(&self) -> Option<UserRecord> {
        self.session.read().user.clone()
    }

    // == Set ==
    /// Replaces both tokens at once.
    pub fn set(&self, pair: CredentialPair) {
        let mut session = self.session.write();
        self.persist_pair(&pair);
        session.pair = Some(Arc::new(pair));
    }

    /// Stores a fresh login: pair and user record together.
    pub fn set_session(&self, pair: CredentialPair, user: Option<UserRecord>) {
        let mut session = self.session.write();
        self.persist_pair(&pair);
        match &user {
            Some(user) => {
                if let Some(raw) = best_effort("encode", Slot::User, serde_json::to_string(user).map_err(Into::into)) {
                    best_effort("save", Slot::User, self.storage.save(Slot::User, &raw));
                }
            }
            None => {
                best_effort("remove", Slot::User, self.storage.remove(Slot::User));
            }
        }
        session.pair = Some(Arc::new(pair));
        session.user = user;
    }

    // == Clear ==
    /// Removes both tokens and the user record.
    pub fn clear(&self) {
        let mut session = self.session.write();
        for slot in Slot::ALL {
            best_effort("remove", slot, self.storage.remove(slot));
        }
        let had_session = session.pair.take().is_some();
        session.user = None;
        if had_session {
            info!("Credentials cleared");
        }
    }

    /// Saves both tokens in one slot write, then drops the per-token slots.
    fn persist_pair(&self, pair: &CredentialPair) {
        let encoded: std::io::Result<String> = serde_json::to_string(pair).map_err(Into::into);
        if let Some(raw) = best_effort("encode", Slot::Credentials, encoded) {
            best_effort("save", Slot::Credentials, self.storage.save(Slot::Credentials, &raw));
        }
        for slot in [Slot::AccessToken, Slot::RefreshToken] {
            best_effort("remove", slot, self.storage.remove(slot));
        }
    }
}

fn load_split_pair(storage: &dyn SlotStorage) -> Option<CredentialPair> {
    let access = best_effort("load", Slot::AccessToken, storage.load(Slot::AccessToken)).flatten()?;
    let refresh = best_effort("load", Slot::RefreshToken, storage.load(Slot::RefreshToken)).flatten()?;
    Some(CredentialPair::new(access, refresh))
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("authenticated", &self.get().is_some())
            .finish()
    }
}
