//! Tree geometry derived from the chunk-size exponent.

use crate::envelope::CHILD_REF_LEN;
use crate::error::{ChunkError, ChunkResult};

/// Smallest supported exponent; below this the fan-out degenerates.
pub const MIN_CHUNK_SIZE: u8 = 7;
/// Largest supported exponent (256 MiB leaves).
pub const MAX_CHUNK_SIZE: u8 = 28;

#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    chunk_size: u8,
}

impl Geometry {
    pub fn new(chunk_size: u8) -> ChunkResult<Self> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(ChunkError::BadArgument(format!(
                "chunk size exponent {chunk_size} outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}"
            )));
        }
        Ok(Geometry { chunk_size })
    }

    pub fn chunk_size(&self) -> u8 {
        self.chunk_size
    }

    /// `S0`: bytes covered by one leaf.
    pub fn leaf_span(&self) -> u64 {
        1u64 << self.chunk_size
    }

    /// `F`: child references per interior chunk, the most 33-byte
    /// entries that fit in a leaf-sized payload.
    pub fn fan_out(&self) -> u64 {
        self.leaf_span() / CHILD_REF_LEN as u64
    }

    /// `S_layer = S0 * F^layer`: bytes covered by a chunk at `layer`.
    /// Saturates instead of overflowing; a saturated span can never
    /// be stepped over or subdivided incorrectly because it exceeds
    /// any representable device size.
    pub fn span(&self, layer: usize) -> u64 {
        let mut span = self.leaf_span();
        for _ in 0..layer {
            span = span.saturating_mul(self.fan_out());
        }
        span
    }

    /// Smallest layer count whose top span covers `total_size`.
    pub fn layers_for(&self, total_size: u64) -> u8 {
        let mut layer = 0usize;
        while self.span(layer) < total_size {
            layer += 1;
        }
        layer as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry() {
        let g = Geometry::new(18).unwrap();
        assert_eq!(g.leaf_span(), 256 * 1024);
        assert_eq!(g.fan_out(), 7943);
        assert_eq!(g.span(0), 256 * 1024);
        assert_eq!(g.span(1), 256 * 1024 * 7943);
    }

    #[test]
    fn rejects_out_of_range_exponents() {
        assert!(Geometry::new(6).is_err());
        assert!(Geometry::new(29).is_err());
        assert!(Geometry::new(7).is_ok());
    }

    #[test]
    fn layer_count_is_minimal() {
        let g = Geometry::new(18).unwrap();
        assert_eq!(g.layers_for(0), 0);
        assert_eq!(g.layers_for(g.leaf_span()), 0);
        assert_eq!(g.layers_for(g.leaf_span() + 1), 1);
        assert_eq!(g.layers_for(g.span(1)), 1);
        assert_eq!(g.layers_for(g.span(1) + 1), 2);
    }

    #[test]
    fn deep_spans_saturate() {
        let g = Geometry::new(18).unwrap();
        assert_eq!(g.span(64), u64::MAX);
    }
}
