//! Durable key-value namespace backing node metadata.
//!
//! Keys are slash-separated paths. A `Namespaced` wrapper scopes a subsystem
//! under a fixed prefix so several subsystems can share one physical store.

pub mod file;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
pub use file::FileDatastore;
pub use memory::MemoryDatastore;

/// Errors that occur during datastore operations.
#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("Invalid datastore key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Normalized slash-separated datastore key, always starting with `/`.
///
/// Segments are non-empty, never start with `.`, and only contain ASCII
/// alphanumerics, `-`, `_` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(String);

impl Key {
    /// Parses and normalizes a key; repeated and trailing slashes collapse.
    ///
    /// # Errors
    ///
    /// - `DatastoreError::InvalidKey` - If a segment is not allowed
    pub fn new(raw: &str) -> Result<Self, DatastoreError> {
        let mut key = Self::root();
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            key = key.child(segment)?;
        }
        Ok(key)
    }

    /// The empty key `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Appends one segment.
    ///
    /// # Errors
    ///
    /// - `DatastoreError::InvalidKey` - If `segment` is not allowed
    pub fn child(&self, segment: &str) -> Result<Self, DatastoreError> {
        validate_segment(segment)?;
        if self.is_root() {
            Ok(Self(format!("/{segment}")))
        } else {
            Ok(Self(format!("{}/{segment}", self.0)))
        }
    }

    /// Appends all segments of `other`.
    pub fn join(&self, other: &Key) -> Self {
        match (self.is_root(), other.is_root()) {
            (_, true) => self.clone(),
            (true, false) => other.clone(),
            (false, false) => Self(format!("{}{}", self.0, other.0)),
        }
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last segment, `None` for the root key.
    pub fn name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Whether `self` lies strictly below `prefix`.
    pub fn is_descendant_of(&self, prefix: &Key) -> bool {
        if prefix.is_root() {
            return !self.is_root();
        }
        self.0
            .strip_prefix(prefix.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Removes `prefix`, returning the remaining key for strict descendants.
    pub fn strip_prefix(&self, prefix: &Key) -> Option<Key> {
        if !self.is_descendant_of(prefix) {
            return None;
        }
        if prefix.is_root() {
            return Some(self.clone());
        }
        self.0
            .strip_prefix(prefix.as_str())
            .map(|rest| Key(rest.to_string()))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_segment(segment: &str) -> Result<(), DatastoreError> {
    let invalid = |reason| DatastoreError::InvalidKey {
        key: segment.to_string(),
        reason,
    };

    if segment.is_empty() {
        return Err(invalid("empty segment"));
    }
    if segment.starts_with('.') {
        return Err(invalid("segment starts with '.'"));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("segment contains a reserved character"));
    }
    Ok(())
}

/// Key-value operations over durable metadata.
///
/// A `put` is atomic: concurrent readers see either the previous value or the
/// new one, never a partial write.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Returns the stored value, `None` when absent.
    ///
    /// # Errors
    ///
    /// - `DatastoreError::Io` - If the backing store failed
    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError>;

    /// # Errors
    ///
    /// - `DatastoreError::Io` - If the backing store failed
    async fn has(&self, key: &Key) -> Result<bool, DatastoreError>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// - `DatastoreError::InvalidKey` - If `key` is the root key
    /// - `DatastoreError::Io` - If the backing store failed
    async fn put(&self, key: &Key, value: Vec<u8>) -> Result<(), DatastoreError>;

    /// Removes `key`. Removing an absent key succeeds.
    ///
    /// # Errors
    ///
    /// - `DatastoreError::Io` - If the backing store failed
    async fn delete(&self, key: &Key) -> Result<(), DatastoreError>;

    /// Lists keys strictly below `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// - `DatastoreError::Io` - If the backing store failed
    async fn query_keys(&self, prefix: &Key) -> Result<Vec<Key>, DatastoreError>;

    /// Flushes buffered writes to durable storage.
    ///
    /// # Errors
    ///
    /// - `DatastoreError::Io` - If flushing failed
    async fn sync(&self) -> Result<(), DatastoreError>;
}

#[async_trait]
impl<T: Datastore + ?Sized> Datastore for Arc<T> {
    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError> {
        (**self).get(key).await
    }

    async fn has(&self, key: &Key) -> Result<bool, DatastoreError> {
        (**self).has(key).await
    }

    async fn put(&self, key: &Key, value: Vec<u8>) -> Result<(), DatastoreError> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &Key) -> Result<(), DatastoreError> {
        (**self).delete(key).await
    }

    async fn query_keys(&self, prefix: &Key) -> Result<Vec<Key>, DatastoreError> {
        (**self).query_keys(prefix).await
    }

    async fn sync(&self) -> Result<(), DatastoreError> {
        (**self).sync().await
    }
}

/// Datastore view that prefixes every key with a fixed namespace.
#[derive(Debug, Clone)]
pub struct Namespaced<D> {
    inner: D,
    prefix: Key,
}

impl<D: Datastore> Namespaced<D> {
    pub fn new(inner: D, prefix: Key) -> Self {
        Self { inner, prefix }
    }

    pub fn prefix(&self) -> &Key {
        &self.prefix
    }

    fn outer_key(&self, key: &Key) -> Key {
        self.prefix.join(key)
    }
}

#[async_trait]
impl<D: Datastore> Datastore for Namespaced<D> {
    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError> {
        self.inner.get(&self.outer_key(key)).await
    }

    async fn has(&self, key: &Key) -> Result<bool, DatastoreError> {
        self.inner.has(&self.outer_key(key)).await
    }

    async fn put(&self, key: &Key, value: Vec<u8>) -> Result<(), DatastoreError> {
        if key.is_root() {
            return Err(DatastoreError::InvalidKey {
                key: key.to_string(),
                reason: "cannot store a value at the namespace root",
            });
        }
        self.inner.put(&self.outer_key(key), value).await
    }

    async fn delete(&self, key: &Key) -> Result<(), DatastoreError> {
        if key.is_root() {
            return Ok(());
        }
        self.inner.delete(&self.outer_key(key)).await
    }

    async fn query_keys(&self, prefix: &Key) -> Result<Vec<Key>, DatastoreError> {
        let keys = self.inner.query_keys(&self.outer_key(prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&self.prefix))
            .collect())
    }

    async fn sync(&self) -> Result<(), DatastoreError> {
        self.inner.sync().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalization() {
        assert_eq!(Key::new("storagemarket//abc/").unwrap().as_str(), "/storagemarket/abc");
        assert_eq!(Key::new("").unwrap(), Key::root());
        assert_eq!(Key::new("/a/b").unwrap().name(), Some("b"));
        assert_eq!(Key::root().name(), None);
    }

    #[test]
    fn test_key_rejects_traversal() {
        assert!(Key::new("/a/../b").is_err());
        assert!(Key::new("/.hidden").is_err());
        assert!(Key::new("/a b").is_err());
        assert!(Key::root().child("").is_err());
    }

    #[test]
    fn test_key_descendants() {
        let prefix = Key::new("/storagemarket").unwrap();
        let key = Key::new("/storagemarket/Qm123").unwrap();
        let sibling = Key::new("/storagemarketx/Qm123").unwrap();

        assert!(key.is_descendant_of(&prefix));
        assert!(!sibling.is_descendant_of(&prefix));
        assert!(!prefix.is_descendant_of(&prefix));
        assert!(key.is_descendant_of(&Key::root()));
        assert_eq!(key.strip_prefix(&prefix), Some(Key::new("/Qm123").unwrap()));
        assert_eq!(sibling.strip_prefix(&prefix), None);
    }

    #[test]
    fn test_key_join() {
        let a = Key::new("/a").unwrap();
        let b = Key::new("/b/c").unwrap();

        assert_eq!(a.join(&b).as_str(), "/a/b/c");
        assert_eq!(Key::root().join(&b), b);
        assert_eq!(a.join(&Key::root()), a);
    }

    #[tokio::test]
    async fn test_namespaced_isolation() {
        let shared = Arc::new(MemoryDatastore::new());
        let market = Namespaced::new(shared.clone(), Key::new("/storagemarket").unwrap());
        let other = Namespaced::new(shared.clone(), Key::new("/deals").unwrap());
        let key = Key::new("/Qm123").unwrap();

        market.put(&key, b"piece".to_vec()).await.unwrap();
        other.put(&key, b"deal".to_vec()).await.unwrap();

        assert_eq!(market.get(&key).await.unwrap(), Some(b"piece".to_vec()));
        assert_eq!(other.get(&key).await.unwrap(), Some(b"deal".to_vec()));
        assert!(shared.has(&Key::new("/storagemarket/Qm123").unwrap()).await.unwrap());

        let keys = market.query_keys(&Key::root()).await.unwrap();
        assert_eq!(keys, vec![key.clone()]);

        market.delete(&key).await.unwrap();
        assert!(!market.has(&key).await.unwrap());
        assert!(other.has(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_namespaced_rejects_root_put() {
        let market = Namespaced::new(MemoryDatastore::new(), Key::new("/ns").unwrap());
        let result = market.put(&Key::root(), b"x".to_vec()).await;
        assert!(matches!(result, Err(DatastoreError::InvalidKey { .. })));
    }
}
