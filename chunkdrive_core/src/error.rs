use std::sync::Arc;

use thiserror::Error;

use crate::address::Address;

/// Errors that can occur while importing or reading a chunk tree.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk {} not found in store", .0.fmt_short())]
    NotFound(Address),
    #[error("chunk {} corrupted: {reason}", .address.fmt_short())]
    CorruptedChunk { address: Address, reason: String },
    #[error("read of {length} bytes at offset {offset} outside device of {total_size} bytes")]
    OutOfRange {
        offset: u64,
        length: u64,
        total_size: u64,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("store: {0:#}")]
    Store(anyhow::Error),
    /// Result of a coalesced fetch whose leader failed; the original
    /// error is shared between all waiters.
    #[error(transparent)]
    Shared(Arc<ChunkError>),
}

impl ChunkError {
    pub fn corrupted(address: Address, reason: impl Into<String>) -> Self {
        ChunkError::CorruptedChunk {
            address,
            reason: reason.into(),
        }
    }

    /// Maps a blob store failure for `address`, preserving the
    /// distinguishable not-found signal.
    pub fn from_store(address: Address, err: anyhow::Error) -> Self {
        if crate::store::is_not_found(&err) {
            ChunkError::NotFound(address)
        } else {
            ChunkError::Store(err)
        }
    }
}

pub type ChunkResult<T> = Result<T, ChunkError>;
