use crate::storage::{BlobStore, WeakCache};
use crate::error::StoreError;
use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory backend, used by tests and as a staging store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
    cache: WeakCache,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        let mut blobs = self.blobs.lock().expect("store lock poisoned");
        if let Some(existing) = blobs.get(key) {
            if *existing != bytes {
                return Err(StoreError::KeyConflict {
                    key: key.to_string(),
                });
            }
            return Ok(());
        }
        blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    fn put_replace(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        self.blobs
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), bytes);
        self.cache.remove(key);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self
            .blobs
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .cloned())
    }

    fn cache_put(&self, key: &str, value: Arc<dyn Any + Send + Sync>) {
        self.cache.put(key, value);
    }

    fn cache_get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.cache.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_idempotent_for_identical_payloads() {
        let store = MemoryBlobStore::new();
        store.put("k", Bytes::from_static(b"abc")).unwrap();
        store.put("k", Bytes::from_static(b"abc")).unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn conflicting_put_fails() {
        let store = MemoryBlobStore::new();
        store.put("k", Bytes::from_static(b"abc")).unwrap();
        let err = store.put("k", Bytes::from_static(b"xyz")).unwrap_err();
        assert!(matches!(err, StoreError::KeyConflict { .. }));
        // other keys unaffected
        store.put("other", Bytes::from_static(b"xyz")).unwrap();
    }

    #[test]
    fn replace_overwrites_and_drops_the_cache_entry() {
        let store = MemoryBlobStore::new();
        store.put("k", Bytes::from_static(b"v1")).unwrap();
        let cached: Arc<dyn Any + Send + Sync> = Arc::new(1u32);
        store.cache_put("k", cached.clone());
        assert!(store.cache_get("k").is_some());
        store.put_replace("k", Bytes::from_static(b"v2")).unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), Bytes::from_static(b"v2"));
        assert!(store.cache_get("k").is_none());
    }

    #[test]
    fn cache_entries_die_with_their_values() {
        let store = MemoryBlobStore::new();
        let value: Arc<dyn Any + Send + Sync> = Arc::new(String::from("v"));
        store.cache_put("k", value.clone());
        assert!(store.cache_get("k").is_some());
        drop(value);
        assert!(store.cache_get("k").is_none());
    }

    #[test]
    fn get_miss_is_none() {
        let store = MemoryBlobStore::new();
        assert!(store.get("absent").unwrap().is_none());
    }
}
