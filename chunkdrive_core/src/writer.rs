//! The tree writer: streams bytes and zero runs into a chunk tree,
//! persisting finished chunks as it advances, and finally emits the
//! intro chunk.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    address::Address,
    crypto,
    envelope::{self, ChildRef, ChunkKey, ChunkKind, SealedChunk},
    error::{ChunkError, ChunkResult},
    geometry::Geometry,
    intro::{INTRO_FLAG_COMPRESSED, IntroRecord, intro_line},
    sparse::Section,
    store::BlobStore,
};

#[derive(Clone, Copy, Debug)]
pub struct ImportOptions {
    /// Leaf span exponent; leaves cover `2^chunk_size` bytes.
    pub chunk_size: u8,
    /// Block size recorded for the NBD device.
    pub block_size: u32,
    /// Whether chunk bodies may be zlib-compressed.
    pub compress: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            chunk_size: 18,
            block_size: 4096,
            compress: true,
        }
    }
}

impl ImportOptions {
    fn validate(&self) -> ChunkResult<Geometry> {
        let geometry = Geometry::new(self.chunk_size)?;
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return Err(ChunkError::BadArgument(format!(
                "block size {} is not a power of two >= 512",
                self.block_size
            )));
        }
        Ok(geometry)
    }
}

/// Per-import accounting. A persisted chunk whose address was already
/// present counts as reuse; sizes are ciphertext sizes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImportStats {
    pub unique_bytes: u64,
    pub reuse_bytes: u64,
    pub unique_chunks: u64,
    pub reused_chunks: u64,
}

/// Result of a finished import.
#[derive(Clone, Debug)]
pub struct ImportReceipt {
    pub intro_address: Address,
    pub total_size: u64,
    pub stats: ImportStats,
}

impl ImportReceipt {
    /// The single line printed to stdout on success.
    pub fn intro_line(&self, unlock_key: &str) -> String {
        intro_line(self.intro_address, unlock_key)
    }
}

/// Streams a byte device into a chunk tree.
///
/// Layer 0 is the active leaf buffer; `levels[k]` holds the pending
/// layer-`k` child references of the interior chunk being built at
/// layer `k + 1`. Zero runs are accumulated and settled lazily so the
/// emitted tree depends only on the logical byte content, never on
/// how the source was sectioned.
pub struct TreeWriter {
    store: Arc<dyn BlobStore>,
    geometry: Geometry,
    block_size: u32,
    compress: bool,
    repo_secret: [u8; 32],
    leaf_buf: Vec<u8>,
    levels: Vec<Vec<ChildRef>>,
    pending_zeros: u64,
    offset: u64,
    stats: ImportStats,
}

impl TreeWriter {
    pub fn new(
        store: Arc<dyn BlobStore>,
        repo_key: &[u8],
        options: ImportOptions,
    ) -> ChunkResult<Self> {
        let geometry = options.validate()?;
        Ok(Self {
            store,
            geometry,
            block_size: options.block_size,
            compress: options.compress,
            repo_secret: crypto::derive_repo_secret(repo_key),
            leaf_buf: Vec::new(),
            levels: Vec::new(),
            pending_zeros: 0,
            offset: 0,
            stats: ImportStats::default(),
        })
    }

    /// Logical bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.offset + self.pending_zeros
    }

    pub async fn push_section(&mut self, section: Section) -> ChunkResult<()> {
        match section {
            Section::Zeros(n) => {
                self.push_zeros(n);
                Ok(())
            }
            Section::Data(bytes) => self.push_bytes(&bytes).await,
        }
    }

    /// Advances the logical offset by `n` zero bytes without
    /// materializing them. Settled lazily.
    pub fn push_zeros(&mut self, n: u64) {
        self.pending_zeros += n;
    }

    /// Appends literal bytes. Zero runs inside the data are stripped
    /// out and routed through the zero-run path.
    pub async fn push_bytes(&mut self, data: &[u8]) -> ChunkResult<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let zeros = rest.iter().take_while(|&&b| b == 0).count();
            if zeros > 0 {
                self.push_zeros(zeros as u64);
                rest = &rest[zeros..];
                continue;
            }
            let run = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            self.settle_zeros().await?;
            self.append_raw(&rest[..run]).await?;
            rest = &rest[run..];
        }
        Ok(())
    }

    /// Closes all pending structures and persists the intro chunk.
    pub async fn finish(mut self, unlock_key: &[u8]) -> ChunkResult<ImportReceipt> {
        self.settle_zeros().await?;
        let total_size = self.offset;

        if !self.leaf_buf.is_empty() || (total_size == 0 && self.levels.is_empty()) {
            self.flush_leaf().await?;
        }

        // Ascend: flush each pending level as a (possibly short)
        // interior chunk until a single reference remains at the top.
        let mut layer = 0usize;
        let (top_ref, top_layer) = loop {
            let refs = std::mem::take(&mut self.levels[layer]);
            if refs.is_empty() {
                layer += 1;
                continue;
            }
            let higher = self.levels[layer + 1..].iter().any(|l| !l.is_empty());
            if !higher && refs.len() == 1 {
                break (refs[0], layer);
            }
            let sealed = self.seal_interior(&refs);
            self.persist(&sealed).await?;
            if self.levels.len() <= layer + 1 {
                self.levels.resize(layer + 2, Vec::new());
            }
            self.levels[layer + 1].push(ChildRef::Chunk(sealed.address));
            layer += 1;
        };

        let (top_address, layers) = match top_ref {
            ChildRef::Chunk(address) => (address, top_layer as u8),
            // A lone zero reference at the top (all-zero device of
            // exactly S0 * F^k bytes) has no stored chunk behind it,
            // but the intro needs a real top address: materialize the
            // chunk the reference stands for.
            ChildRef::Zero => {
                let sealed = if top_layer == 0 {
                    let payload = vec![0u8; self.geometry.leaf_span() as usize];
                    envelope::seal(
                        ChunkKind::Leaf,
                        &payload,
                        ChunkKey::Repo(&self.repo_secret),
                        self.compress,
                    )
                } else {
                    let refs = vec![ChildRef::Zero; self.geometry.fan_out() as usize];
                    self.seal_interior(&refs)
                };
                self.persist(&sealed).await?;
                (sealed.address, top_layer as u8)
            }
        };

        let record = IntroRecord {
            total_size,
            chunk_size: self.geometry.chunk_size(),
            block_size: self.block_size,
            layers,
            fan_out: self.geometry.fan_out() as u32,
            repo_secret: self.repo_secret,
            top_address,
            codec_flags: if self.compress {
                INTRO_FLAG_COMPRESSED
            } else {
                0
            },
        };
        let sealed = envelope::seal(
            ChunkKind::Intro,
            &record.to_bytes(),
            ChunkKey::Intro(unlock_key),
            self.compress,
        );
        self.persist(&sealed).await?;

        debug!(
            intro = %sealed.address.fmt_short(),
            total_size,
            layers,
            unique_bytes = self.stats.unique_bytes,
            reuse_bytes = self.stats.reuse_bytes,
            "import finished"
        );
        Ok(ImportReceipt {
            intro_address: sealed.address,
            total_size,
            stats: self.stats,
        })
    }

    fn span(&self, layer: usize) -> u64 {
        self.geometry.span(layer)
    }

    async fn append_raw(&mut self, mut data: &[u8]) -> ChunkResult<()> {
        let leaf_span = self.geometry.leaf_span() as usize;
        while !data.is_empty() {
            let take = (leaf_span - self.leaf_buf.len()).min(data.len());
            self.leaf_buf.extend_from_slice(&data[..take]);
            self.offset += take as u64;
            data = &data[take..];
            if self.leaf_buf.len() == leaf_span {
                self.flush_leaf().await?;
            }
        }
        Ok(())
    }

    /// Consumes the accumulated zero run: align the leaf with literal
    /// zeros, then step over whole spans by reference, always taking
    /// the largest aligned layer first.
    async fn settle_zeros(&mut self) -> ChunkResult<()> {
        while self.pending_zeros > 0 {
            let n = self.pending_zeros;
            if !self.leaf_buf.is_empty() {
                let cap = self.geometry.leaf_span() as usize - self.leaf_buf.len();
                let take = n.min(cap as u64) as usize;
                self.leaf_buf.extend(std::iter::repeat_n(0u8, take));
                self.offset += take as u64;
                self.pending_zeros -= take as u64;
                if self.leaf_buf.len() == self.geometry.leaf_span() as usize {
                    self.flush_leaf().await?;
                }
                continue;
            }
            // The offset is leaf-aligned here.
            if n < self.span(0) {
                self.leaf_buf.extend(std::iter::repeat_n(0u8, n as usize));
                self.offset += n;
                self.pending_zeros = 0;
                continue;
            }
            let mut layer = 0usize;
            while self.span(layer + 1) <= n && self.offset % self.span(layer + 1) == 0 {
                layer += 1;
            }
            let span = self.span(layer);
            trace!(layer, span, "zero reference");
            self.append_ref(layer, ChildRef::Zero).await?;
            self.offset += span;
            self.pending_zeros -= span;
        }
        Ok(())
    }

    async fn flush_leaf(&mut self) -> ChunkResult<()> {
        let payload = std::mem::take(&mut self.leaf_buf);
        let sealed = envelope::seal(
            ChunkKind::Leaf,
            &payload,
            ChunkKey::Repo(&self.repo_secret),
            self.compress,
        );
        self.persist(&sealed).await?;
        self.append_ref(0, ChildRef::Chunk(sealed.address)).await
    }

    /// Appends a layer-`layer` child, sealing and propagating full
    /// interior chunks upward.
    async fn append_ref(&mut self, mut layer: usize, mut child: ChildRef) -> ChunkResult<()> {
        loop {
            if self.levels.len() <= layer {
                self.levels.resize(layer + 1, Vec::new());
            }
            self.levels[layer].push(child);
            if (self.levels[layer].len() as u64) < self.geometry.fan_out() {
                return Ok(());
            }
            let refs = std::mem::take(&mut self.levels[layer]);
            let sealed = self.seal_interior(&refs);
            self.persist(&sealed).await?;
            child = ChildRef::Chunk(sealed.address);
            layer += 1;
        }
    }

    fn seal_interior(&self, refs: &[ChildRef]) -> SealedChunk {
        envelope::seal(
            ChunkKind::Interior,
            &envelope::encode_child_refs(refs),
            ChunkKey::Repo(&self.repo_secret),
            self.compress,
        )
    }

    async fn persist(&mut self, sealed: &SealedChunk) -> ChunkResult<()> {
        let name = sealed.address.to_hex();
        let size = sealed.bytes.len() as u64;
        let exists = self
            .store
            .exists(&name)
            .await
            .map_err(ChunkError::Store)?;
        if exists {
            self.stats.reuse_bytes += size;
            self.stats.reused_chunks += 1;
            trace!(chunk = %sealed.address.fmt_short(), size, "chunk reused");
        } else {
            self.store
                .put(&name, sealed.bytes.clone())
                .await
                .map_err(ChunkError::Store)?;
            self.stats.unique_bytes += size;
            self.stats.unique_chunks += 1;
            trace!(chunk = %sealed.address.fmt_short(), size, "chunk written");
        }
        Ok(())
    }
}

/// Drives a section stream through a [`TreeWriter`].
///
/// `on_progress` is called with the logical position after each
/// section.
pub async fn import<I>(
    store: Arc<dyn BlobStore>,
    repo_key: &[u8],
    unlock_key: &[u8],
    options: ImportOptions,
    sections: I,
    on_progress: impl Fn(u64),
) -> ChunkResult<ImportReceipt>
where
    I: IntoIterator<Item = std::io::Result<Section>>,
{
    let mut writer = TreeWriter::new(store, repo_key, options)?;
    for section in sections {
        writer.push_section(section?).await?;
        on_progress(writer.position());
    }
    writer.finish(unlock_key).await
}
