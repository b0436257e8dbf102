use bytes::Bytes;
use chunkdrive_core::store::{StoreError, StoreResult};
use tracing::debug;

/// Read-only chunk store behind any static HTTP(S) endpoint.
///
/// Chunk names resolve by appending `/<name>` to the base URL.
/// Redirects are followed; a 404 surfaces as the store's not-found
/// signal. Writing goes through some other channel (rsync, an S3
/// upload, a plain web server's document root) — `put` is rejected.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base: String,
}

impl HttpStore {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.base, name)
    }
}

#[async_trait::async_trait]
impl chunkdrive_core::store::BlobStore for HttpStore {
    async fn put(&self, _name: &str, _bytes: Bytes) -> StoreResult<()> {
        Err(StoreError::ReadOnly.into())
    }

    async fn get(&self, name: &str) -> StoreResult<Bytes> {
        let url = self.url_for(name);
        debug!(%url, "fetching chunk");
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound.into());
        }
        let response = response.error_for_status()?;
        Ok(response.bytes().await?)
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        let response = self.client.head(self.url_for(name)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response.error_for_status()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_join_strips_trailing_slashes() {
        let store = HttpStore::new("https://cdn.example/images/");
        assert_eq!(
            store.url_for("abcd"),
            "https://cdn.example/images/abcd"
        );
    }
}
