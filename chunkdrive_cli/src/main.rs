use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;

mod cmd;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a byte device into a chunk directory
    Import {
        /// Input file, or '-' for standard input
        input: String,

        /// Unlock key; encrypts only the intro chunk
        unlock_key: String,

        /// Repository key; its derivative encrypts all other chunks
        repo_key: String,

        /// Directory the chunk files are published into
        target_dir: PathBuf,

        /// Chunk size exponent: leaves cover 2^N bytes
        #[arg(long, value_name = "N", default_value_t = 18)]
        chunk_size: u8,

        /// Block size advertised to the kernel, in bytes
        #[arg(long, value_name = "BYTES", default_value_t = 4096)]
        block_size: u32,

        /// Store chunk bodies uncompressed
        #[arg(long)]
        uncompressed: bool,
    },
    /// Attach an imported device to an NBD device node and serve reads
    Connect {
        /// NBD device path, e.g. /dev/nbd0
        device: PathBuf,

        /// Intro URL: <base>/<64-hex-address>#<percent-encoded-key>
        url: String,

        /// Chunk cache capacity in entries
        #[arg(long, value_name = "COUNT", default_value_t = 32)]
        cache_size: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .with_writer(std::io::stderr)
        .init();

    match cli.cmd {
        Commands::Import {
            input,
            unlock_key,
            repo_key,
            target_dir,
            chunk_size,
            block_size,
            uncompressed,
        } => {
            cmd::run_import(cmd::ImportArgs {
                input,
                unlock_key,
                repo_key,
                target_dir,
                chunk_size,
                block_size,
                uncompressed,
            })
            .await
        }
        Commands::Connect {
            device,
            url,
            cache_size,
        } => cmd::run_connect(device, url, cache_size).await,
    }
}
