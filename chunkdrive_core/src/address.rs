//! The chunk address type (SHA-256, 32 bytes)

use std::{borrow::Borrow, fmt, str::FromStr};

use sha2::{Digest, Sha256};

use crate::error::ChunkError;

/// Address of a stored chunk: the SHA-256 of its file bytes.
///
/// Chunks are published under the lowercase 64-hex encoding of this
/// value, so `Display` renders exactly the store name.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Address([u8; 32]);

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address").field(&self.to_hex()).finish()
    }
}

impl Address {
    /// Calculate the address of the provided bytes.
    pub fn of(buf: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(buf.as_ref());
        Address(digest.into())
    }

    /// Bytes of the address.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create an `Address` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Convert the address to its 64-hex lowercase store name.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First five bytes as hex, for friendly log output.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8; 32]> for Address {
    fn borrow(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Address {
    fn from(value: [u8; 32]) -> Self {
        Address(value)
    }
}

impl From<Address> for [u8; 32] {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl FromStr for Address {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ChunkError::BadArgument(format!(
                "'{s}' is not a 64-hex lowercase chunk address"
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| ChunkError::BadArgument(format!("invalid chunk address: {e}")))?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Address(arr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
