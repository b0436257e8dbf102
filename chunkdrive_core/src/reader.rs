//! The tree reader: opens an intro chunk and serves random-access
//! reads by navigating interior chunks down to the required leaves.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::{
    address::Address,
    cache::ChunkCache,
    envelope::{self, ChildRef, ChunkKey, ChunkKind, Envelope},
    error::{ChunkError, ChunkResult},
    geometry::Geometry,
    intro::IntroRecord,
    store::BlobStore,
};

/// Read-only view of an imported device.
pub struct TreeReader {
    cache: ChunkCache,
    geometry: Geometry,
    record: IntroRecord,
}

enum Resolved {
    /// The position falls inside an unmaterialized all-zero subtree
    /// ending at `span_end`.
    Zero { span_end: u64 },
    /// The leaf covering the position, starting at `leaf_start`.
    Leaf {
        address: Address,
        envelope: Arc<Envelope>,
        leaf_start: u64,
    },
}

impl TreeReader {
    /// Fetches and decrypts the intro chunk, recovering the tree
    /// metadata and the derived repository secret.
    pub async fn open(
        store: Arc<dyn BlobStore>,
        intro_address: Address,
        unlock_key: &[u8],
        cache_capacity: usize,
    ) -> ChunkResult<Self> {
        let bytes = store
            .get(&intro_address.to_hex())
            .await
            .map_err(|e| ChunkError::from_store(intro_address, e))?;
        let intro = envelope::open(intro_address, &bytes, ChunkKey::Intro(unlock_key))?;
        if intro.kind != ChunkKind::Intro {
            return Err(ChunkError::corrupted(intro_address, "not an intro chunk"));
        }
        let record = IntroRecord::from_bytes(&intro.payload)
            .ok_or_else(|| ChunkError::corrupted(intro_address, "malformed intro record"))?;
        let geometry = Geometry::new(record.chunk_size)?;
        if u64::from(record.fan_out) != geometry.fan_out() {
            return Err(ChunkError::corrupted(
                intro_address,
                "fan-out does not match the chunk size",
            ));
        }
        if record.layers != geometry.layers_for(record.total_size) {
            return Err(ChunkError::corrupted(
                intro_address,
                "layer count does not match the device size",
            ));
        }
        if !record.block_size.is_power_of_two() || record.block_size < 512 {
            return Err(ChunkError::corrupted(intro_address, "invalid block size"));
        }
        debug!(
            total_size = record.total_size,
            layers = record.layers,
            chunk_size = record.chunk_size,
            "opened device"
        );
        Ok(Self {
            cache: ChunkCache::new(store, record.repo_secret, cache_capacity),
            geometry,
            record,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.record.total_size
    }

    pub fn block_size(&self) -> u32 {
        self.record.block_size
    }

    /// Reads `length` bytes starting at `offset`. The whole range
    /// must lie inside `[0, total_size]`.
    pub async fn read_at(&self, offset: u64, length: u64) -> ChunkResult<Bytes> {
        let end = offset
            .checked_add(length)
            .filter(|&e| e <= self.record.total_size);
        let Some(end) = end else {
            return Err(ChunkError::OutOfRange {
                offset,
                length,
                total_size: self.record.total_size,
            });
        };

        let mut out = vec![0u8; length as usize];
        let mut pos = offset;
        while pos < end {
            match self.resolve(pos).await? {
                Resolved::Zero { span_end } => {
                    // The output buffer starts zeroed; just skip.
                    pos = span_end.min(end);
                }
                Resolved::Leaf {
                    address,
                    envelope,
                    leaf_start,
                } => {
                    let in_leaf = (pos - leaf_start) as usize;
                    let want = (end - pos) as usize;
                    let available = envelope.payload.len().saturating_sub(in_leaf);
                    let take = available.min(want);
                    if take == 0 {
                        return Err(ChunkError::corrupted(
                            address,
                            "leaf shorter than the device size requires",
                        ));
                    }
                    let start = (pos - offset) as usize;
                    out[start..start + take]
                        .copy_from_slice(&envelope.payload[in_leaf..in_leaf + take]);
                    pos += take as u64;
                }
            }
        }
        Ok(out.into())
    }

    /// Walks from the top chunk down to whatever covers `pos`.
    async fn resolve(&self, pos: u64) -> ChunkResult<Resolved> {
        let mut layer = self.record.layers as usize;
        let mut address = self.record.top_address;
        loop {
            let envelope = self.cache.get(address).await?;
            if layer == 0 {
                if envelope.kind != ChunkKind::Leaf {
                    return Err(ChunkError::corrupted(address, "expected a leaf chunk"));
                }
                let leaf_span = self.geometry.leaf_span();
                return Ok(Resolved::Leaf {
                    address,
                    envelope,
                    leaf_start: pos - pos % leaf_span,
                });
            }
            if envelope.kind != ChunkKind::Interior {
                return Err(ChunkError::corrupted(address, "expected an interior chunk"));
            }
            let span = self.geometry.span(layer);
            let child_span = self.geometry.span(layer - 1);
            let index = ((pos % span) / child_span) as usize;
            match envelope.child_ref(index) {
                None => {
                    return Err(ChunkError::corrupted(
                        address,
                        format!("child reference {index} missing or malformed"),
                    ));
                }
                Some(ChildRef::Zero) => {
                    let subtree_start = pos - pos % child_span;
                    return Ok(Resolved::Zero {
                        span_end: subtree_start + child_span,
                    });
                }
                Some(ChildRef::Chunk(child)) => {
                    address = child;
                    layer -= 1;
                }
            }
        }
    }
}

impl std::fmt::Debug for TreeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeReader")
            .field("total_size", &self.record.total_size)
            .field("layers", &self.record.layers)
            .finish_non_exhaustive()
    }
}
