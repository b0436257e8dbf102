use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chunkdrive_core::{BlobStore, ImportOptions, ImportReceipt, SectionReader, import};
use chunkdrive_store_local::LocalStore;
use tracing::info;

pub struct ImportArgs {
    pub input: String,
    pub unlock_key: String,
    pub repo_key: String,
    pub target_dir: PathBuf,
    pub chunk_size: u8,
    pub block_size: u32,
    pub uncompressed: bool,
}

/// Progress is reported at most once per this many logical bytes.
const PROGRESS_INTERVAL: u64 = 256 << 20;

pub async fn run_import(args: ImportArgs) -> Result<()> {
    let store: Arc<dyn BlobStore> = Arc::new(LocalStore::open(&args.target_dir));
    let options = ImportOptions {
        chunk_size: args.chunk_size,
        block_size: args.block_size,
        compress: !args.uncompressed,
    };

    let last_reported = Cell::new(0u64);
    let on_progress = |position: u64| {
        if position - last_reported.get() >= PROGRESS_INTERVAL {
            last_reported.set(position);
            info!(bytes = position, "importing");
        }
    };

    let receipt: ImportReceipt = if args.input == "-" {
        let stdin = std::io::stdin().lock();
        import(
            store,
            args.repo_key.as_bytes(),
            args.unlock_key.as_bytes(),
            options,
            SectionReader::new(stdin),
            on_progress,
        )
        .await?
    } else {
        let file = std::fs::File::open(&args.input)
            .with_context(|| format!("failed to open input '{}'", args.input))?;
        import(
            store,
            args.repo_key.as_bytes(),
            args.unlock_key.as_bytes(),
            options,
            SectionReader::new(file),
            on_progress,
        )
        .await?
    };

    info!(
        total_size = receipt.total_size,
        unique_chunks = receipt.stats.unique_chunks,
        unique_bytes = receipt.stats.unique_bytes,
        reused_chunks = receipt.stats.reused_chunks,
        reuse_bytes = receipt.stats.reuse_bytes,
        "import complete"
    );

    // The one line of stdout output: everything a reader needs.
    println!("{}", receipt.intro_line(&args.unlock_key));
    Ok(())
}
