use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub type StoreResult<T, E = anyhow::Error> = std::result::Result<T, E>;

/// Distinguishable store failures. Anything else travels as a plain
/// `anyhow::Error`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob not found")]
    NotFound,
    #[error("store is read-only")]
    ReadOnly,
}

/// A flat namespace of immutable blobs keyed by 64-hex chunk names.
///
/// `get` may follow redirects internally and must fail with
/// [`StoreError::NotFound`] when the name is absent. `put` must
/// publish atomically: a name either resolves to complete bytes or
/// does not resolve at all.
#[async_trait]
pub trait BlobStore: std::fmt::Debug + Send + Sync + 'static {
    async fn put(&self, name: &str, bytes: Bytes) -> StoreResult<()>;

    async fn get(&self, name: &str) -> StoreResult<Bytes>;

    async fn exists(&self, name: &str) -> StoreResult<bool>;
}

/// Returns true if `err` carries the not-found signal.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::NotFound))
}
