use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chunkdrive_core::{BlobStore, ChunkError, IntroUrl, TreeReader};
use chunkdrive_store_http::HttpStore;
use chunkdrive_store_local::LocalStore;
use tracing::info;

pub async fn run_connect(device: PathBuf, url: String, cache_size: usize) -> Result<()> {
    let intro: IntroUrl = url.parse()?;

    let unlock_key = match intro.unlock_key {
        Some(key) => key,
        None if std::io::stdin().is_terminal() => {
            rpassword::prompt_password("unlock key: ")?.into_bytes()
        }
        None => {
            return Err(ChunkError::BadArgument(
                "intro URL carries no unlock key and standard input is not a terminal".into(),
            )
            .into());
        }
    };

    let store: Arc<dyn BlobStore> =
        if intro.base.starts_with("http://") || intro.base.starts_with("https://") {
            Arc::new(HttpStore::new(&intro.base))
        } else if let Some(path) = intro.base.strip_prefix("file://") {
            Arc::new(LocalStore::open(path))
        } else {
            Arc::new(LocalStore::open(&intro.base))
        };

    let reader = Arc::new(TreeReader::open(store, intro.address, &unlock_key, cache_size).await?);
    info!(
        total_size = reader.total_size(),
        block_size = reader.block_size(),
        "device opened"
    );

    chunkdrive_nbd::serve(&device, reader).await
}
