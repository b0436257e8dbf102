//! The chunk envelope codec.
//!
//! Write path: optionally zlib-compress the payload (keeping the
//! shorter of compressed vs raw), prepend the envelope header, hash
//! the plaintext, derive the key and nonce from that hash, encrypt,
//! and address the result by the SHA-256 of the stored bytes.
//!
//! Stored chunk file layout:
//!
//! ```text
//! plaintext_hash (32 bytes) || ChaCha20-Poly1305 ciphertext
//! ```
//!
//! The plaintext hash must ride along: the reader derives the
//! per-chunk key `KDF(R', plaintext_hash)` and the nonce from it
//! before it can decrypt. The address covers the whole file, so the
//! `filename == hex(sha256(file_bytes))` invariant is unaffected.
//!
//! Envelope plaintext layout (all fixed, little-endian):
//!
//! ```text
//! len: u32      length of everything after this field
//! version: u8   currently 1
//! flags: u8     bit 0 = zlib-compressed body, bits 1-2 = kind
//! reserved: u16 zero
//! body          leaf bytes | child references | intro record
//! ```

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};

use crate::{
    address::Address,
    crypto,
    error::{ChunkError, ChunkResult},
};

pub const ENVELOPE_VERSION: u8 = 1;
/// Length of one serialized child reference: tag byte + 32-byte value.
pub const CHILD_REF_LEN: usize = 33;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const KIND_MASK: u8 = 0b0000_0110;
const HEADER_LEN: usize = 4;
const LEN_PREFIX: usize = 4;

/// Zlib level pinned for determinism: identical payloads must produce
/// identical chunk files across imports.
const ZLIB_LEVEL: u32 = 6;

/// Upper bound on a decompressed envelope body, limiting what a
/// hostile chunk can expand to.
const MAX_BODY_LEN: u64 = 1 << 28;

const TAG_ZERO: u8 = 0x00;
const TAG_CHUNK: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    Leaf,
    Interior,
    Intro,
}

impl ChunkKind {
    fn to_flags(self) -> u8 {
        let bits: u8 = match self {
            ChunkKind::Leaf => 0,
            ChunkKind::Interior => 1,
            ChunkKind::Intro => 2,
        };
        bits << 1
    }

    fn from_flags(flags: u8) -> Option<Self> {
        match (flags & KIND_MASK) >> 1 {
            0 => Some(ChunkKind::Leaf),
            1 => Some(ChunkKind::Interior),
            2 => Some(ChunkKind::Intro),
            _ => None,
        }
    }
}

/// One 33-byte entry in an interior chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildRef {
    /// The child subtree is entirely zero and was never materialized.
    Zero,
    /// Normal reference to a stored chunk.
    Chunk(Address),
}

impl ChildRef {
    pub fn encode(&self) -> [u8; CHILD_REF_LEN] {
        let mut out = [0u8; CHILD_REF_LEN];
        match self {
            ChildRef::Zero => {}
            ChildRef::Chunk(addr) => {
                out[0] = TAG_CHUNK;
                out[1..].copy_from_slice(addr.as_bytes());
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != CHILD_REF_LEN {
            return None;
        }
        match bytes[0] {
            TAG_ZERO if bytes[1..].iter().all(|&b| b == 0) => Some(ChildRef::Zero),
            TAG_CHUNK => {
                let mut addr = [0u8; 32];
                addr.copy_from_slice(&bytes[1..]);
                Some(ChildRef::Chunk(Address::from_bytes(addr)))
            }
            _ => None,
        }
    }
}

/// Serializes an interior chunk body.
pub fn encode_child_refs(refs: &[ChildRef]) -> Vec<u8> {
    let mut out = Vec::with_capacity(refs.len() * CHILD_REF_LEN);
    for r in refs {
        out.extend_from_slice(&r.encode());
    }
    out
}

/// Keying for one codec operation.
#[derive(Clone, Copy)]
pub enum ChunkKey<'a> {
    /// Leaf/interior chunks: the derived repository secret `R'`; the
    /// actual key is derived per chunk from the plaintext hash.
    Repo(&'a [u8; 32]),
    /// The intro chunk: the user's unlock key `U`.
    Intro(&'a [u8]),
}

impl ChunkKey<'_> {
    fn material(&self, plaintext_hash: &[u8; 32]) -> [u8; 32] {
        match self {
            ChunkKey::Repo(repo_secret) => crypto::derive_chunk_key(repo_secret, plaintext_hash),
            ChunkKey::Intro(unlock_key) => crypto::derive_intro_key(unlock_key),
        }
    }
}

/// A decrypted, decompressed chunk as held in memory.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub kind: ChunkKind,
    pub payload: Bytes,
}

impl Envelope {
    /// Number of child references in an interior payload.
    pub fn child_count(&self) -> usize {
        self.payload.len() / CHILD_REF_LEN
    }

    /// Child reference at `index`; `None` past the end or for a
    /// malformed entry.
    pub fn child_ref(&self, index: usize) -> Option<ChildRef> {
        let start = index.checked_mul(CHILD_REF_LEN)?;
        let end = start.checked_add(CHILD_REF_LEN)?;
        ChildRef::decode(self.payload.get(start..end)?)
    }
}

/// A finished chunk, ready for the blob store.
#[derive(Clone, Debug)]
pub struct SealedChunk {
    pub address: Address,
    pub bytes: Bytes,
}

/// Builds the stored file for `(kind, payload)`. Deterministic in the
/// plaintext and key material.
pub fn seal(kind: ChunkKind, payload: &[u8], key: ChunkKey<'_>, compress: bool) -> SealedChunk {
    let mut flags = kind.to_flags();
    let compressed;
    let body: &[u8] = if compress {
        compressed = zlib_compress(payload);
        if compressed.len() < payload.len() {
            flags |= FLAG_COMPRESSED;
            &compressed
        } else {
            payload
        }
    } else {
        payload
    };

    let mut plain = Vec::with_capacity(LEN_PREFIX + HEADER_LEN + body.len());
    plain.extend_from_slice(&((HEADER_LEN + body.len()) as u32).to_le_bytes());
    plain.push(ENVELOPE_VERSION);
    plain.push(flags);
    plain.extend_from_slice(&[0u8; 2]);
    plain.extend_from_slice(body);

    let plaintext_hash = crypto::sha256(&plain);
    let chunk_key = key.material(&plaintext_hash);
    let ciphertext = crypto::encrypt(&chunk_key, &plaintext_hash, &plain);

    let mut file = Vec::with_capacity(32 + ciphertext.len());
    file.extend_from_slice(&plaintext_hash);
    file.extend_from_slice(&ciphertext);
    let address = Address::of(&file);

    SealedChunk {
        address,
        bytes: file.into(),
    }
}

/// Verifies, decrypts, and parses a fetched chunk file.
///
/// Fails with [`ChunkError::CorruptedChunk`] on digest mismatch,
/// decryption failure, envelope parse failure, or an unsupported
/// version.
pub fn open(address: Address, file: &[u8], key: ChunkKey<'_>) -> ChunkResult<Envelope> {
    if Address::of(file) != address {
        return Err(ChunkError::corrupted(
            address,
            "content digest does not match address",
        ));
    }
    if file.len() < 32 + 16 {
        return Err(ChunkError::corrupted(address, "chunk file too short"));
    }
    let mut plaintext_hash = [0u8; 32];
    plaintext_hash.copy_from_slice(&file[..32]);

    let chunk_key = key.material(&plaintext_hash);
    let plain = crypto::decrypt(&chunk_key, &plaintext_hash, &file[32..])
        .map_err(|e| ChunkError::corrupted(address, e.to_string()))?;

    if crypto::sha256(&plain) != plaintext_hash {
        return Err(ChunkError::corrupted(address, "plaintext hash mismatch"));
    }
    if plain.len() < LEN_PREFIX + HEADER_LEN {
        return Err(ChunkError::corrupted(address, "envelope too short"));
    }
    let len = u32::from_le_bytes(plain[..4].try_into().unwrap()) as usize;
    if len != plain.len() - LEN_PREFIX {
        return Err(ChunkError::corrupted(
            address,
            "envelope length prefix mismatch",
        ));
    }
    let version = plain[4];
    if version != ENVELOPE_VERSION {
        return Err(ChunkError::corrupted(
            address,
            format!("unsupported envelope version {version}"),
        ));
    }
    let flags = plain[5];
    let kind = ChunkKind::from_flags(flags)
        .ok_or_else(|| ChunkError::corrupted(address, "unknown chunk kind"))?;

    let body = &plain[LEN_PREFIX + HEADER_LEN..];
    let payload: Vec<u8> = if flags & FLAG_COMPRESSED != 0 {
        zlib_decompress(body)
            .map_err(|_| ChunkError::corrupted(address, "invalid compressed body"))?
    } else {
        body.to_vec()
    };

    if kind == ChunkKind::Interior && payload.len() % CHILD_REF_LEN != 0 {
        return Err(ChunkError::corrupted(
            address,
            "interior body is not a whole number of child references",
        ));
    }

    Ok(Envelope {
        kind,
        payload: payload.into(),
    })
}

fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2),
        Compression::new(ZLIB_LEVEL),
    );
    encoder
        .write_all(data)
        .expect("writing to an in-memory encoder cannot fail");
    encoder
        .finish()
        .expect("finishing an in-memory encoder cannot fail")
}

fn zlib_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = ZlibDecoder::new(data).take(MAX_BODY_LEN + 1);
    decoder.read_to_end(&mut out)?;
    if out.len() as u64 > MAX_BODY_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "envelope body exceeds maximum size",
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPO_SECRET: [u8; 32] = [0x42; 32];

    #[test]
    fn seal_open_round_trip() {
        let payload = b"leaf data".repeat(100);
        let sealed = seal(
            ChunkKind::Leaf,
            &payload,
            ChunkKey::Repo(&REPO_SECRET),
            true,
        );
        let envelope = open(sealed.address, &sealed.bytes, ChunkKey::Repo(&REPO_SECRET)).unwrap();
        assert_eq!(envelope.kind, ChunkKind::Leaf);
        assert_eq!(envelope.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn compression_keeps_the_shorter_form() {
        // Repetitive payload compresses; the round trip must still work.
        let compressible = vec![0xAAu8; 4096];
        let sealed = seal(
            ChunkKind::Leaf,
            &compressible,
            ChunkKey::Repo(&REPO_SECRET),
            true,
        );
        assert!(sealed.bytes.len() < compressible.len());

        // High-entropy payload does not: the raw form is stored.
        let incompressible: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 24) as u8)
            .collect();
        let sealed_raw = seal(
            ChunkKind::Leaf,
            &incompressible,
            ChunkKey::Repo(&REPO_SECRET),
            true,
        );
        let envelope = open(
            sealed_raw.address,
            &sealed_raw.bytes,
            ChunkKey::Repo(&REPO_SECRET),
        )
        .unwrap();
        assert_eq!(envelope.payload.as_ref(), incompressible.as_slice());
    }

    #[test]
    fn sealing_is_deterministic() {
        let payload = b"same bytes";
        let a = seal(ChunkKind::Leaf, payload, ChunkKey::Repo(&REPO_SECRET), true);
        let b = seal(ChunkKind::Leaf, payload, ChunkKey::Repo(&REPO_SECRET), true);
        assert_eq!(a.address, b.address);
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn tamper_is_detected() {
        let sealed = seal(
            ChunkKind::Leaf,
            b"sensitive",
            ChunkKey::Repo(&REPO_SECRET),
            true,
        );
        for position in [0, 31, 40, sealed.bytes.len() - 1] {
            let mut tampered = sealed.bytes.to_vec();
            tampered[position] ^= 0x01;
            let err = open(sealed.address, &tampered, ChunkKey::Repo(&REPO_SECRET)).unwrap_err();
            assert!(matches!(err, ChunkError::CorruptedChunk { .. }));
        }
    }

    #[test]
    fn wrong_repo_secret_is_rejected() {
        let sealed = seal(
            ChunkKind::Leaf,
            b"keyed data",
            ChunkKey::Repo(&REPO_SECRET),
            true,
        );
        let wrong = [0x43u8; 32];
        let err = open(sealed.address, &sealed.bytes, ChunkKey::Repo(&wrong)).unwrap_err();
        assert!(matches!(err, ChunkError::CorruptedChunk { .. }));
    }

    #[test]
    fn intro_key_isolation() {
        let sealed = seal(
            ChunkKind::Intro,
            b"intro record",
            ChunkKey::Intro(b"unlock"),
            true,
        );
        assert!(open(sealed.address, &sealed.bytes, ChunkKey::Intro(b"unlock")).is_ok());
        assert!(open(sealed.address, &sealed.bytes, ChunkKey::Intro(b"other")).is_err());
    }

    #[test]
    fn child_ref_codec() {
        let addr = Address::of(b"child");
        let encoded = ChildRef::Chunk(addr).encode();
        assert_eq!(encoded[0], 0x01);
        assert_eq!(ChildRef::decode(&encoded), Some(ChildRef::Chunk(addr)));

        let zero = ChildRef::Zero.encode();
        assert_eq!(zero, [0u8; CHILD_REF_LEN]);
        assert_eq!(ChildRef::decode(&zero), Some(ChildRef::Zero));

        // A zero tag with a non-zero value is malformed.
        let mut bad = zero;
        bad[5] = 1;
        assert_eq!(ChildRef::decode(&bad), None);
    }

    #[test]
    fn truncated_envelope_fails_parsing() {
        let sealed = seal(
            ChunkKind::Leaf,
            b"whole envelope",
            ChunkKey::Repo(&REPO_SECRET),
            false,
        );
        let truncated = &sealed.bytes[..sealed.bytes.len() - 4];
        let err = open(
            Address::of(truncated),
            truncated,
            ChunkKey::Repo(&REPO_SECRET),
        )
        .unwrap_err();
        assert!(matches!(err, ChunkError::CorruptedChunk { .. }));
    }
}
