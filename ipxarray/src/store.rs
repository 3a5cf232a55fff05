use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::errors::{Error, Result};

/// Read access to a key/value store holding an array hierarchy: metadata documents and chunks.
///
/// This is all metadata discovery and lazy arrays need from a store.
///
#[async_trait]
pub trait ReadableStore: Send + Sync {
    /// Get the value stored under `key`, `None` if there isn't one.
    ///
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Whether a value is stored under `key`.
    ///
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Every metadata document key, if the store knows them without a listing round trip.
    ///
    fn list_metadata_keys(&self) -> Option<Vec<String>> {
        None
    }

    /// Every key starting with `prefix`.
    ///
    async fn list_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
        Err(Error::NotSupported("listing".into()))
    }
}

/// A store that keeps everything in RAM.
///
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<S, B>(&self, key: S, value: B)
    where
        S: Into<String>,
        B: Into<Bytes>,
    {
        self.objects.write().insert(key.into(), value.into());
    }

    pub fn delete(&self, key: &str) -> Option<Bytes> {
        self.objects.write().remove(key)
    }
}

#[async_trait]
impl ReadableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
