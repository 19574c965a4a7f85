//! Content-addressed blob persistence with a process-local weak cache, and
//! the lazy typed references that resolve through it.

pub mod file;
pub mod memory;

use crate::error::{Error, Result, StoreError};
use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Content-addressed key → bytes persistence.
///
/// Keys are written once: `put` of a different payload under an existing key
/// fails with [`StoreError::KeyConflict`]. The single admitted mutation is
/// node republication (same id, superset of attributes), which goes through
/// [`BlobStore::put_replace`].
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: Bytes) -> std::result::Result<(), StoreError>;

    fn put_replace(&self, key: &str, bytes: Bytes) -> std::result::Result<(), StoreError>;

    fn get(&self, key: &str) -> std::result::Result<Option<Bytes>, StoreError>;

    /// Process-local weak cache, keyed by the same names as the blobs but
    /// orthogonal to them; entries are reclaimed under memory pressure.
    fn cache_put(&self, key: &str, value: Arc<dyn Any + Send + Sync>);

    fn cache_get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Typed put/get with caller-supplied codecs.
pub trait BlobStoreExt: BlobStore {
    fn put_typed<T>(
        &self,
        key: &str,
        value: &T,
        encode: impl FnOnce(&T) -> Result<Bytes>,
    ) -> Result<()> {
        let bytes = encode(value)?;
        self.put(key, bytes)?;
        Ok(())
    }

    fn get_typed<T>(
        &self,
        key: &str,
        decode: impl FnOnce(&[u8]) -> Result<T>,
    ) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<S: BlobStore + ?Sized> BlobStoreExt for S {}

impl<S: BlobStore + ?Sized> BlobStore for Arc<S> {
    fn put(&self, key: &str, bytes: Bytes) -> std::result::Result<(), StoreError> {
        (**self).put(key, bytes)
    }

    fn put_replace(&self, key: &str, bytes: Bytes) -> std::result::Result<(), StoreError> {
        (**self).put_replace(key, bytes)
    }

    fn get(&self, key: &str) -> std::result::Result<Option<Bytes>, StoreError> {
        (**self).get(key)
    }

    fn cache_put(&self, key: &str, value: Arc<dyn Any + Send + Sync>) {
        (**self).cache_put(key, value)
    }

    fn cache_get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        (**self).cache_get(key)
    }
}

/// Weak-reference cache shared by the store backends. Dead entries are swept
/// opportunistically every few hundred insertions.
#[derive(Default)]
pub struct WeakCache {
    entries: Mutex<HashMap<String, Weak<dyn Any + Send + Sync>>>,
    inserts: Mutex<usize>,
}

const SWEEP_INTERVAL: usize = 512;

impl WeakCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, value: Arc<dyn Any + Send + Sync>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(key.to_string(), Arc::downgrade(&value));
        let mut inserts = self.inserts.lock().expect("cache lock poisoned");
        *inserts += 1;
        if *inserts >= SWEEP_INTERVAL {
            *inserts = 0;
            entries.retain(|_, weak| weak.strong_count() > 0);
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .get(key)
            .and_then(Weak::upgrade)
    }

    pub fn remove(&self, key: &str) {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .remove(key);
    }
}

pub type Loader<T> = Arc<dyn Fn(&str) -> Result<Arc<T>> + Send + Sync>;

/// Lazy handle `{id, loader}` resolving to a typed value.
///
/// The value is held weakly: it can be reclaimed under memory pressure and is
/// re-loaded on the next access. Repeated [`PersistentRef::value`] calls
/// return observationally equal values; if two threads race on the first
/// load, at most one wins the slot.
pub struct PersistentRef<T> {
    id: String,
    loader: Loader<T>,
    slot: Mutex<Weak<T>>,
}

impl<T> PersistentRef<T> {
    pub fn new(id: impl Into<String>, loader: Loader<T>) -> Self {
        Self {
            id: id.into(),
            loader,
            slot: Mutex::new(Weak::new()),
        }
    }

    /// A reference whose slot starts out populated; the referent re-loads
    /// through the loader once the caller drops its strong handles.
    pub fn with_value(id: impl Into<String>, loader: Loader<T>, value: &Arc<T>) -> Self {
        Self {
            id: id.into(),
            loader,
            slot: Mutex::new(Arc::downgrade(value)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The referent, loading on first access and re-loading after the weak
    /// slot was reclaimed.
    pub fn value(&self) -> Result<Arc<T>> {
        if let Some(value) = self.try_value() {
            return Ok(value);
        }
        let value = (self.loader)(&self.id)?;
        *self.slot.lock().expect("ref slot poisoned") = Arc::downgrade(&value);
        Ok(value)
    }

    /// The currently cached value, without forcing a load.
    pub fn try_value(&self) -> Option<Arc<T>> {
        self.slot.lock().expect("ref slot poisoned").upgrade()
    }
}

impl<T> std::fmt::Debug for PersistentRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentRef")
            .field("id", &self.id)
            .field("resolved", &self.try_value().is_some())
            .finish()
    }
}

/// Fetch a blob that is required to exist; absence is a data integrity error.
pub(crate) fn get_required(store: &dyn BlobStore, key: &str) -> Result<Bytes> {
    store
        .get(key)?
        .ok_or_else(|| Error::MissingBlob(key.to_string()))
}
