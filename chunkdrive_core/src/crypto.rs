//! Cryptographic primitives: HMAC-SHA-256 key derivation and
//! ChaCha20-Poly1305 with a content-derived nonce.
//!
//! Every derivation here is pinned for envelope version 1 and must
//! never change for repositories already written with it.

use chacha20poly1305::{
    ChaCha20Poly1305,
    aead::{Aead, KeyInit},
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,
}

const REPO_CONTEXT: &[u8] = b"repo";
const INTRO_CONTEXT: &[u8] = b"intro";

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// `KDF(secret, context)`: HMAC-SHA-256 keyed by `secret` over
/// `context`, truncating nothing.
pub fn kdf(secret: &[u8], context: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(context);
    mac.finalize().into_bytes().into()
}

/// `R' = KDF(R, "repo")` — the derived repository secret embedded in
/// the intro chunk.
pub fn derive_repo_secret(repo_key: &[u8]) -> [u8; 32] {
    kdf(repo_key, REPO_CONTEXT)
}

/// `k_i = KDF(U, "intro")` — the key for the intro chunk only.
pub fn derive_intro_key(unlock_key: &[u8]) -> [u8; 32] {
    kdf(unlock_key, INTRO_CONTEXT)
}

/// `k_c = KDF(R', plaintext_hash)` — the per-chunk key. Keying by the
/// plaintext hash makes identical plaintexts encrypt identically,
/// which is what preserves deduplication across imports.
pub fn derive_chunk_key(repo_secret: &[u8; 32], plaintext_hash: &[u8; 32]) -> [u8; 32] {
    kdf(repo_secret, plaintext_hash)
}

fn nonce_from_hash(plaintext_hash: &[u8; 32]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&plaintext_hash[..12]);
    nonce
}

/// Encrypt `plaintext` under `key` with the nonce derived from its
/// own hash. Deterministic: a pure function of `(key, plaintext)`.
pub fn encrypt(key: &[u8; 32], plaintext_hash: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = nonce_from_hash(plaintext_hash);
    cipher
        .encrypt(&nonce.into(), plaintext)
        .expect("chacha20poly1305 encryption is infallible for in-memory buffers")
}

/// Decrypt `ciphertext`; fails on a wrong key or any tag mismatch.
pub fn decrypt(
    key: &[u8; 32],
    plaintext_hash: &[u8; 32],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = nonce_from_hash(plaintext_hash);
    cipher
        .decrypt(&nonce.into(), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}
