use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use super::{CredentialStore, StorageError};

/// Extension for stored value files
const VALUE_EXTENSION: &str = "bin";

/// Stores each key as its own file in a directory.
///
/// Writes land in a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves either the old value or the new one.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Map a store key like `@app:user` to a safe file name (`app-user.bin`).
    fn file_name(key: &str) -> String {
        let stem: String = key
            .trim_start_matches('@')
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        format!("{}.{}", stem, VALUE_EXTENSION)
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.dir.join(Self::file_name(key))
    }

    async fn write_atomic(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::io(key, e))?;

        let path = self.value_path(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::io(key, e));
        }
        debug!(key = key, "Stored value");
        Ok(())
    }
}

impl CredentialStore for FileStore {
    fn save<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<(), StorageError>> {
        self.write_atomic(key, value).boxed()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>> {
        async move {
            match tokio::fs::read(self.value_path(key)).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(StorageError::io(key, e)),
            }
        }
        .boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            match tokio::fs::remove_file(self.value_path(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::io(key, e)),
            }
        }
        .boxed()
    }
}
