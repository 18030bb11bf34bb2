//! In-process datastore.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Datastore, DatastoreError, Key};

/// Datastore held in memory; contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    entries: RwLock<BTreeMap<Key, Vec<u8>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn has(&self, key: &Key) -> Result<bool, DatastoreError> {
        Ok(self.entries.read().contains_key(key))
    }

    async fn put(&self, key: &Key, value: Vec<u8>) -> Result<(), DatastoreError> {
        if key.is_root() {
            return Err(DatastoreError::InvalidKey {
                key: key.to_string(),
                reason: "cannot store a value at the root key",
            });
        }
        self.entries.write().insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<(), DatastoreError> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn query_keys(&self, prefix: &Key) -> Result<Vec<Key>, DatastoreError> {
        Ok(self
            .entries
            .read()
            .range(prefix.clone()..)
            .map(|(key, _)| key)
            // Siblings such as `/pieces-old` sort between `/pieces` and its children.
            .take_while(|key| key.as_str().starts_with(prefix.as_str()))
            .filter(|key| key.is_descendant_of(prefix))
            .cloned()
            .collect())
    }

    async fn sync(&self) -> Result<(), DatastoreError> {
        Ok(())
    }
}
