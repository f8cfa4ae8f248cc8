use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{TokenPair, UserProfile};
use crate::store::{CredentialStore, StorageError};

/// Storage key for the serialized user profile.
pub const USER_KEY: &str = "@app:user";
/// Storage key for the serialized token pair.
pub const TOKEN_KEY: &str = "@app:token";

/// Typed access to the persisted session.
///
/// Keeps the user and token entries both present or both absent. Callers
/// outside the session manager should treat it as read-only.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn CredentialStore>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn CredentialStore>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn CredentialStore> {
        &self.backend
    }

    /// Persist a fresh session, replacing any stored one.
    ///
    /// A failed token write leaves the old token entry in place, so the user
    /// entry is put back to its previous value (or removed if there was none).
    pub async fn save_session(&self, user: &UserProfile, tokens: &TokenPair) -> Result<(), StorageError> {
        let previous_user = self.backend.get(USER_KEY).await?;

        self.write(USER_KEY, user).await?;
        if let Err(e) = self.write(TOKEN_KEY, tokens).await {
            let rollback = match previous_user {
                Some(bytes) => self.backend.save(USER_KEY, &bytes).await,
                None => self.backend.remove(USER_KEY).await,
            };
            if let Err(rollback) = rollback {
                warn!(error = %rollback, "Failed to roll back user entry");
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn save_user(&self, user: &UserProfile) -> Result<(), StorageError> {
        self.write(USER_KEY, user).await
    }

    pub async fn save_tokens(&self, tokens: &TokenPair) -> Result<(), StorageError> {
        self.write(TOKEN_KEY, tokens).await
    }

    pub async fn load_user(&self) -> Result<Option<UserProfile>, StorageError> {
        self.read(USER_KEY).await
    }

    pub async fn load_tokens(&self) -> Result<Option<TokenPair>, StorageError> {
        self.read(TOKEN_KEY).await
    }

    /// Load the persisted session.
    ///
    /// Returns `None` when nothing is stored. When only one of the two entries
    /// is present or readable the leftovers are removed and `None` is returned.
    pub async fn load(&self) -> Result<Option<(UserProfile, TokenPair)>, StorageError> {
        let user = self.read_lenient(USER_KEY).await?;
        let tokens = self.read_lenient(TOKEN_KEY).await?;

        match (user, tokens) {
            (Some(user), Some(tokens)) => Ok(Some((user, tokens))),
            (None, None) => Ok(None),
            (user, tokens) => {
                warn!(
                    has_user = user.is_some(),
                    has_token = tokens.is_some(),
                    "Stored session is incomplete, discarding it"
                );
                if let Err(e) = self.clear().await {
                    warn!(error = %e, "Failed to remove incomplete session");
                }
                Ok(None)
            }
        }
    }

    /// Remove both entries. Both removals are attempted; the first error wins.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let user = self.backend.remove(USER_KEY).await;
        let tokens = self.backend.remove(TOKEN_KEY).await;
        user.and(tokens)
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value).map_err(|source| StorageError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.backend.save(key, &bytes).await
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(bytes) = self.backend.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Serialization {
                key: key.to_string(),
                source,
            })
    }

    /// Like `read`, but an unparseable value counts as absent.
    async fn read_lenient<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.read(key).await {
            Err(StorageError::Serialization { key, source }) => {
                debug!(key = %key, error = %source, "Ignoring unreadable stored value");
                Ok(None)
            }
            other => other,
        }
    }
}
