use std::fmt;

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use futures::future::{BoxFuture, FutureExt};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use super::{CredentialStore, KeyringStore, StorageError};

/// Store key holding the Argon2 salt for passphrase-derived keys.
pub const SALT_KEY: &str = "@app:seal-salt";

/// Keychain account holding a generated sealing key.
const KEYCHAIN_ACCOUNT: &str = "store-key";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

/// 256-bit key for sealing stored values.
#[derive(Clone)]
pub struct SealingKey([u8; KEY_LEN]);

impl SealingKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive a key from a passphrase with Argon2id (default parameters).
    pub fn derive(passphrase: &str, salt: &[u8]) -> Result<Self, StorageError> {
        let mut bytes = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, &mut bytes)
            .map_err(|e| StorageError::Crypto(format!("key derivation failed: {}", e)))?;
        Ok(Self(bytes))
    }

    /// Derive a key from a passphrase, creating and persisting the salt in
    /// `store` on first use.
    pub async fn from_passphrase(
        store: &dyn CredentialStore,
        passphrase: &str,
    ) -> Result<Self, StorageError> {
        let salt = match store.get(SALT_KEY).await? {
            Some(salt) if salt.len() >= SALT_LEN => salt,
            _ => {
                let mut salt = vec![0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                store.save(SALT_KEY, &salt).await?;
                info!("Created new sealing salt");
                salt
            }
        };
        Self::derive(passphrase, &salt)
    }

    /// Load the sealing key from the keychain, generating one on first use.
    pub async fn from_keychain(keychain: &KeyringStore) -> Result<Self, StorageError> {
        if let Some(bytes) = keychain.get(KEYCHAIN_ACCOUNT).await? {
            if let Ok(bytes) = <[u8; KEY_LEN]>::try_from(bytes.as_slice()) {
                return Ok(Self(bytes));
            }
            debug!("Keychain sealing key has wrong length, replacing it");
        }
        let key = Self::generate();
        keychain.save(KEYCHAIN_ACCOUNT, &key.0).await?;
        info!("Stored new sealing key in keychain");
        Ok(key)
    }
}

impl fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealingKey(<redacted>)")
    }
}

/// Encrypts every value with ChaCha20-Poly1305 before handing it to `inner`.
///
/// Layout of a sealed value: 12-byte random nonce followed by the ciphertext
/// and tag. Values that fail authentication surface as `StorageError::Crypto`.
pub struct SealedStore<S> {
    inner: S,
    cipher: ChaCha20Poly1305,
}

impl<S: CredentialStore> SealedStore<S> {
    pub fn new(inner: S, key: &SealingKey) -> Self {
        Self {
            inner,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key.0)),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StorageError::Crypto("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, key: &str, sealed: &[u8]) -> Result<Vec<u8>, StorageError> {
        if sealed.len() < NONCE_LEN {
            return Err(StorageError::Crypto(format!("sealed value for {} is truncated", key)));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StorageError::Crypto(format!("sealed value for {} failed authentication", key)))
    }
}

impl<S: CredentialStore> CredentialStore for SealedStore<S> {
    fn save<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            let sealed = self.seal(value)?;
            self.inner.save(key, &sealed).await
        }
        .boxed()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>> {
        async move {
            match self.inner.get(key).await? {
                Some(sealed) => self.open(key, &sealed).map(Some),
                None => Ok(None),
            }
        }
        .boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        self.inner.remove(key)
    }
}
