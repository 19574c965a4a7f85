use crate::error::StoreError;
use crate::storage::{BlobStore, WeakCache};
use bytes::Bytes;
use std::any::Any;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File-backed store: one file per key under a root directory.
///
/// Writes go through a temporary file and an atomic rename so concurrent
/// readers never observe a torn blob.
pub struct FileBlobStore {
    root: PathBuf,
    cache: WeakCache,
}

impl FileBlobStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            cache: WeakCache::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            && !key.starts_with('.');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn write_atomically(&self, path: &Path, bytes: &Bytes) -> Result<(), StoreError> {
        let tmp = self
            .root
            .join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(existing) => {
                if existing == bytes {
                    Ok(())
                } else {
                    Err(StoreError::KeyConflict {
                        key: key.to_string(),
                    })
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => self.write_atomically(&path, &bytes),
            Err(err) => Err(err.into()),
        }
    }

    fn put_replace(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        self.write_atomically(&path, &bytes)?;
        self.cache.remove(key);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn cache_put(&self, key: &str, value: Arc<dyn Any + Send + Sync>) {
        self.cache.put(key, value);
    }

    fn cache_get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.cache.get(key)
    }
}
