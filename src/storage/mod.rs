//! Entity Persistence
//!
//! Scenes persist entities through a [`Storage`] backend keyed by the
//! entity's stable [`EntityId`]. The runtime ships an in-memory backend;
//! real deployments plug in their own.

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::id::EntityId;
use crate::message::{BincodeCodec, Codec, CodecError};

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The value could not be (de)serialized.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The backend failed.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Persistence backend.
pub trait Storage: Send + Sync {
    /// Stored bytes of `id`.
    fn query(&self, id: EntityId) -> BoxFuture<'_, Result<Option<Bytes>, StorageError>>;

    /// Store `data` under `id`, replacing any previous value.
    fn save(&self, id: EntityId, data: Bytes) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Remove `id`. Returns whether it existed.
    fn delete(&self, id: EntityId) -> BoxFuture<'_, Result<bool, StorageError>>;
}

/// Serialize `value` and store it under `id`.
pub async fn save_entity<T: Serialize>(storage: &dyn Storage, id: EntityId, value: &T) -> Result<(), StorageError> {
    let data = BincodeCodec::encode(value)?;
    storage.save(id, data).await
}

/// Load and deserialize the value stored under `id`.
pub async fn query_entity<T: DeserializeOwned>(storage: &dyn Storage, id: EntityId) -> Result<Option<T>, StorageError> {
    match storage.query(id).await? {
        Some(data) => Ok(Some(BincodeCodec::decode(&data)?)),
        None => Ok(None),
    }
}

/// Process-local backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<EntityId, Bytes>,
}

impl MemoryStorage {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored entity count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn query(&self, id: EntityId) -> BoxFuture<'_, Result<Option<Bytes>, StorageError>> {
        let data = self.entries.get(&id).map(|data| data.clone());
        Box::pin(async move { Ok(data) })
    }

    fn save(&self, id: EntityId, data: Bytes) -> BoxFuture<'_, Result<(), StorageError>> {
        self.entries.insert(id, data);
        Box::pin(async { Ok(()) })
    }

    fn delete(&self, id: EntityId) -> BoxFuture<'_, Result<bool, StorageError>> {
        let existed = self.entries.remove(&id).is_some();
        Box::pin(async move { Ok(existed) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Player {
        name: String,
        level: u32,
    }

    #[tokio::test]
    async fn test_typed_roundtrip_and_delete() {
        let storage = MemoryStorage::new();
        let id = EntityId::from_parts(10, 1001, 1, 3).unwrap();
        let player = Player {
            name: "ada".into(),
            level: 7,
        };

        save_entity(&storage, id, &player).await.unwrap();
        assert_eq!(storage.len(), 1);
        let loaded: Option<Player> = query_entity(&storage, id).await.unwrap();
        assert_eq!(loaded, Some(player));

        assert!(storage.delete(id).await.unwrap());
        assert!(!storage.delete(id).await.unwrap());
        let gone: Option<Player> = query_entity(&storage, id).await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_garbage_is_codec_error() {
        let storage = MemoryStorage::new();
        let id = EntityId::from_parts(10, 1001, 1, 4).unwrap();
        storage.save(id, Bytes::from_static(&[0xff])).await.unwrap();
        let result: Result<Option<Player>, _> = query_entity(&storage, id).await;
        assert!(matches!(result, Err(StorageError::Codec(_))));
    }
}
