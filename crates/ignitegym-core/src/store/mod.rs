//! Persistent credential storage.
//!
//! This module provides:
//! - `CredentialStore`: async key/value contract every backend implements
//! - `FileStore`: one file per key in the data directory, atomic replace
//! - `KeyringStore`: one OS keychain entry per key
//! - `MemoryStore`: process-local storage for tests and throwaway sessions
//! - `SealedStore`: ChaCha20-Poly1305 encryption layered over any backend
//!
//! Backends hold no business logic. Keeping the user and token entries
//! consistent is the job of `auth::SessionStore`.

pub mod file;
pub mod keychain;
pub mod memory;
pub mod sealed;

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

pub use file::FileStore;
pub use keychain::KeyringStore;
pub use memory::MemoryStore;
pub use sealed::{SealedStore, SealingKey};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Keychain error for {key}: {source}")]
    Keyring {
        key: String,
        #[source]
        source: keyring::Error,
    },

    #[error("Stored value for {key} is invalid: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    pub(crate) fn io(key: &str, source: std::io::Error) -> Self {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }
}

/// Durable key/value storage for session data.
///
/// Every call either completes or fails with a `StorageError`; a reader never
/// observes a partially written value. Removing an absent key succeeds.
pub trait CredentialStore: Send + Sync {
    fn save<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<(), StorageError>>;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>>;

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;
}

impl<S: CredentialStore + ?Sized> CredentialStore for &S {
    fn save<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<(), StorageError>> {
        (**self).save(key, value)
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>> {
        (**self).get(key)
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        (**self).remove(key)
    }
}

impl<S: CredentialStore + ?Sized> CredentialStore for Arc<S> {
    fn save<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<(), StorageError>> {
        (**self).save(key, value)
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>> {
        (**self).get(key)
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        (**self).remove(key)
    }
}
