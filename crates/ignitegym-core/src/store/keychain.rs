use futures::future::{BoxFuture, FutureExt};
use keyring::Entry;

use super::{CredentialStore, StorageError};

/// Default keychain service name
pub const SERVICE_NAME: &str = "ignitegym";

/// Stores each key as a secret in the OS keychain.
///
/// Keychain calls block, so they run on the blocking pool.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    async fn blocking<T, F>(&self, key: &str, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(Entry) -> Result<T, keyring::Error> + Send + 'static,
    {
        let service = self.service.clone();
        let account = key.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &account)?;
            op(entry)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?;

        result.map_err(|source| StorageError::Keyring {
            key: key.to_string(),
            source,
        })
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn save<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<(), StorageError>> {
        let value = value.to_vec();
        self.blocking(key, move |entry| entry.set_secret(&value)).boxed()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>> {
        self.blocking(key, |entry| match entry.get_secret() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e),
        })
        .boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        self.blocking(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e),
        })
        .boxed()
    }
}
