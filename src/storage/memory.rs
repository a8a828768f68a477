use crate::{
    errors::Error,
    storage::{BlobStore, StorageKey},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// [BlobStore] that keeps everything in a map, for tests and short-lived
/// servers
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<StorageKey, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of stored objects
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn exists(&self, key: &StorageKey) -> Result<bool, Error> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn get(&self, key: &StorageKey) -> Result<Option<Bytes>, Error> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn put(&self, key: &StorageKey, data: Bytes) -> Result<(), Error> {
        log::debug!("memory store put, {:?}, {} bytes", key, data.len());
        self.objects.write().await.insert(key.clone(), data);
        Ok(())
    }
}
