//! File-backed JSON collections.
//!
//! Every record collection in the workspace is one JSON document on disk. A
//! [`JsonFile`] hands out three primitives: load everything, replace
//! everything, and a read-modify-write under an exclusive lock. Writes go to a
//! temporary sibling file that is renamed over the target, so readers never
//! observe a half-written document. Record collections are stored as
//! [`Records`], which keeps entries it cannot read instead of dropping them.
//!
//! The lock lives on a sidecar `<file>.lock` rather than the data file itself:
//! the data file is swapped by rename on every write, and a lock held on the
//! old inode would not exclude a writer that opened the new one.

pub mod records;
pub mod timestamp;

pub use records::{Record, Records};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Holds the exclusive lock for one store file until dropped.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("Failed to release store lock: {}", e);
        }
    }
}

/// A typed handle on one JSON document.
pub struct JsonFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonFile<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for JsonFile<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFile").field("path", &self.path).finish()
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl<T> JsonFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        with_suffix(&self.path, ".lock")
    }

    fn tmp_path(&self) -> PathBuf {
        with_suffix(&self.path, ".tmp")
    }

    /// Blocks until the exclusive lock is ours. There is no acquisition timeout.
    fn lock(&self) -> Result<LockGuard, StoreError> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| StoreError::io(&lock_path, e))?;
        Ok(LockGuard { file })
    }

    /// Reads the document. A missing file, or one that does not parse, reads
    /// as the default value. The returned flag is true when the file existed
    /// but could not be parsed.
    fn read_document(&self) -> Result<(T, bool), StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((T::default(), false)),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok((T::default(), false));
        }
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok((value, false)),
            Err(e) => {
                warn!(path = %self.path.display(), "Store file is corrupt, using empty default: {}", e);
                Ok((T::default(), true))
            }
        }
    }

    fn write_atomic(&self, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let body = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.tmp_path();
        let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(&body).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(b"\n").map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);

        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))
    }

    /// Keeps the bytes of a corrupt document next to it before it is overwritten.
    fn preserve_corrupt(&self) {
        let backup = with_suffix(&self.path, ".corrupt");
        match std::fs::copy(&self.path, &backup) {
            Ok(_) => warn!(backup = %backup.display(), "Preserved corrupt store file"),
            Err(e) => warn!("Failed to preserve corrupt store file: {}", e),
        }
    }

    /// Loads the whole document without taking the lock. Renames are atomic,
    /// so this always sees some complete version of the file.
    pub fn load(&self) -> T {
        match self.read_document() {
            Ok((value, _)) => value,
            Err(e) => {
                warn!("{}", e);
                T::default()
            }
        }
    }

    /// Runs `f` on a consistent snapshot while holding the lock.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, StoreError> {
        let _guard = self.lock()?;
        let (value, _) = self.read_document()?;
        Ok(f(&value))
    }

    /// Replaces the whole document.
    pub fn replace(&self, value: &T) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        self.write_atomic(value)
    }

    /// Read-modify-write under the lock. The document is always written back.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StoreError> {
        self.update_if_changed(|value| (f(value), true))
    }

    /// Read-modify-write under the lock. `f` reports whether it changed
    /// anything; the document is only rewritten when it did.
    pub fn update_if_changed<R>(
        &self,
        f: impl FnOnce(&mut T) -> (R, bool),
    ) -> Result<R, StoreError> {
        let _guard = self.lock()?;
        let (mut value, corrupt) = self.read_document()?;
        let (result, changed) = f(&mut value);
        if changed {
            if corrupt {
                self.preserve_corrupt();
            }
            self.write_atomic(&value)?;
        }
        Ok(result)
    }
}

impl<T> JsonFile<T>
where
    T: Serialize + DeserializeOwned + Default + Send + 'static,
{
    pub async fn load_async(&self) -> Result<T, StoreError> {
        let file = self.clone();
        Ok(tokio::task::spawn_blocking(move || file.load()).await?)
    }

    pub async fn read_async<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let file = self.clone();
        tokio::task::spawn_blocking(move || file.read(f)).await?
    }

    pub async fn update_async<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let file = self.clone();
        tokio::task::spawn_blocking(move || file.update(f)).await?
    }

    pub async fn update_if_changed_async<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut T) -> (R, bool) + Send + 'static,
        R: Send + 'static,
    {
        let file = self.clone();
        tokio::task::spawn_blocking(move || file.update_if_changed(f)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
        n: u32,
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let file: JsonFile<Vec<Item>> = JsonFile::new(dir.path().join("items.json"));
        assert!(file.load().is_empty());
    }

    #[test]
    fn corrupt_file_loads_default_and_is_preserved_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        std::fs::write(&path, "{not json").unwrap();
        let file: JsonFile<Vec<Item>> = JsonFile::new(&path);

        assert!(file.load().is_empty());

        file.update(|items| {
            items.push(Item {
                id: "a".into(),
                n: 1,
            })
        })
        .unwrap();

        assert_eq!(file.load().len(), 1);
        let backup = std::fs::read_to_string(dir.path().join("items.json.corrupt")).unwrap();
        assert_eq!(backup, "{not json");
    }

    #[test]
    fn update_if_changed_skips_write_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");
        let file: JsonFile<BTreeMap<String, String>> = JsonFile::new(&path);

        let seen = file.update_if_changed(|map| (map.len(), false)).unwrap();
        assert_eq!(seen, 0);
        assert!(!path.exists());

        file.update_if_changed(|map| {
            map.insert("k".into(), "v".into());
            ((), true)
        })
        .unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("map.json.tmp").exists());
    }

    #[test]
    fn concurrent_writers_never_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let file: Arc<JsonFile<Vec<Item>>> = Arc::new(JsonFile::new(dir.path().join("items.json")));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let file = file.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        file.update(|items| {
                            items.push(Item {
                                id: format!("{}-{}", t, i),
                                n: i,
                            })
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let items = file.load();
        assert_eq!(items.len(), 80);
        let raw = std::fs::read_to_string(file.path()).unwrap();
        assert!(serde_json::from_str::<Vec<Item>>(&raw).is_ok());
    }

    #[tokio::test]
    async fn async_wrappers_round_through_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let file: JsonFile<Vec<Item>> = JsonFile::new(dir.path().join("items.json"));
        file.update_async(|items| {
            items.push(Item {
                id: "x".into(),
                n: 7,
            })
        })
        .await
        .unwrap();
        let n = file.read_async(|items| items[0].n).await.unwrap();
        assert_eq!(n, 7);
    }
}
