//! The intro record and the intro URL.
//!
//! The intro chunk is an ordinary content-addressed chunk, but keyed
//! with the unlock key instead of the repository secret. Its payload
//! is the fixed record below; its ciphertext SHA-256 is the address
//! printed to the user.

use std::str::FromStr;

use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use crate::{
    address::Address,
    error::{ChunkError, ChunkResult},
};

/// Serialized length of an intro record.
pub const INTRO_RECORD_LEN: usize = 83;

/// Intro codec flag: chunks of this import were written with
/// compression enabled.
pub const INTRO_FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Metadata carried by the intro chunk. All fields little-endian on
/// the wire, in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntroRecord {
    /// Logical device size in bytes.
    pub total_size: u64,
    /// Leaf span exponent: leaves cover `2^chunk_size` bytes.
    pub chunk_size: u8,
    /// Block size advertised to the kernel.
    pub block_size: u32,
    /// Number of tree layers above the leaves; 0 means the top chunk
    /// is itself the only leaf.
    pub layers: u8,
    /// Child references per interior chunk.
    pub fan_out: u32,
    /// Derived repository secret `R'`.
    pub repo_secret: [u8; 32],
    /// Address of the top chunk.
    pub top_address: Address,
    /// Codec flags recorded at import time.
    pub codec_flags: u8,
}

impl IntroRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INTRO_RECORD_LEN);
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.push(self.chunk_size);
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.push(self.layers);
        out.extend_from_slice(&self.fan_out.to_le_bytes());
        out.extend_from_slice(&self.repo_secret);
        out.extend_from_slice(self.top_address.as_bytes());
        out.push(self.codec_flags);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != INTRO_RECORD_LEN {
            return None;
        }
        let total_size = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let chunk_size = bytes[8];
        let block_size = u32::from_le_bytes(bytes[9..13].try_into().unwrap());
        let layers = bytes[13];
        let fan_out = u32::from_le_bytes(bytes[14..18].try_into().unwrap());
        let mut repo_secret = [0u8; 32];
        repo_secret.copy_from_slice(&bytes[18..50]);
        let mut top = [0u8; 32];
        top.copy_from_slice(&bytes[50..82]);
        let codec_flags = bytes[82];
        Some(IntroRecord {
            total_size,
            chunk_size,
            block_size,
            layers,
            fan_out,
            repo_secret,
            top_address: Address::from_bytes(top),
            codec_flags,
        })
    }
}

/// The line the importer prints: `hex(intro_address)#url-encode(U)`.
pub fn intro_line(address: Address, unlock_key: &str) -> String {
    format!(
        "{}#{}",
        address.to_hex(),
        utf8_percent_encode(unlock_key, NON_ALPHANUMERIC)
    )
}

/// A parsed intro URL: `<base>/<64-hex-address>#<percent-encoded-U>`.
///
/// `base` is the store location; referenced chunks resolve by
/// appending `/<chunk-hex>` to it. The fragment is optional — the
/// server may prompt for the unlock key instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntroUrl {
    pub base: String,
    pub address: Address,
    pub unlock_key: Option<Vec<u8>>,
}

impl FromStr for IntroUrl {
    type Err = ChunkError;

    fn from_str(s: &str) -> ChunkResult<Self> {
        let (location, fragment) = match s.split_once('#') {
            Some((location, fragment)) => (location, Some(fragment)),
            None => (s, None),
        };
        let (base, address) = location.rsplit_once('/').ok_or_else(|| {
            ChunkError::BadArgument(format!(
                "intro URL '{s}' has no store location before the chunk address"
            ))
        })?;
        if base.is_empty() {
            return Err(ChunkError::BadArgument(format!(
                "intro URL '{s}' has an empty store location"
            )));
        }
        let address = address.parse()?;
        let unlock_key = match fragment {
            Some(f) if !f.is_empty() => Some(percent_decode_str(f).collect()),
            _ => None,
        };
        Ok(IntroUrl {
            base: base.to_string(),
            address,
            unlock_key,
        })
    }
}
