use bytes::Bytes;
use chunkdrive_core::store::{StoreError, StoreResult};
use dashmap::DashMap;

/// In-memory blob store for tests and experiments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: DashMap<String, Bytes>,
}

impl MemoryStore {
    /// Creates a new, empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Replaces the stored bytes under `name`, for tamper tests.
    pub fn corrupt(&self, name: &str, mutate: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.files.get(name) {
            Some(entry) => {
                let mut bytes = entry.value().to_vec();
                drop(entry);
                mutate(&mut bytes);
                self.files.insert(name.to_string(), bytes.into());
                true
            }
            None => false,
        }
    }

    /// All stored blob names.
    pub fn names(&self) -> Vec<String> {
        self.files.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait::async_trait]
impl chunkdrive_core::store::BlobStore for MemoryStore {
    /// Stores a blob under the given name.
    async fn put(&self, name: &str, bytes: Bytes) -> StoreResult<()> {
        self.files.insert(name.to_string(), bytes);
        Ok(())
    }

    /// Returns the blob stored under the given name.
    async fn get(&self, name: &str) -> StoreResult<Bytes> {
        let file = self.files.get(name).ok_or(StoreError::NotFound)?;
        Ok(file.clone())
    }

    /// Checks whether a blob exists under the given name.
    async fn exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.files.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkdrive_core::store::{BlobStore, is_not_found};

    #[tokio::test]
    async fn round_trip_and_not_found() {
        let store = MemoryStore::new();
        store.put("abc", Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(store.get("abc").await.unwrap().as_ref(), b"data");
        assert!(store.exists("abc").await.unwrap());

        let err = store.get("missing").await.unwrap_err();
        assert!(is_not_found(&err));
    }

    #[tokio::test]
    async fn corrupt_flips_stored_bytes() {
        let store = MemoryStore::new();
        store.put("abc", Bytes::from_static(b"data")).await.unwrap();
        assert!(store.corrupt("abc", |b| b[0] ^= 0xFF));
        assert_ne!(store.get("abc").await.unwrap().as_ref(), b"data");
        assert!(!store.corrupt("missing", |_| {}));
    }
}
