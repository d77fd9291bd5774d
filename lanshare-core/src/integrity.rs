//! Integrity: per-chunk SHA-256 digest carried in the chunk header.

use sha2::{Digest, Sha256};

/// Hash a chunk payload. Returns 32-byte digest.
pub fn hash_chunk(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Lowercase hex form of [`hash_chunk`], as written into headers.
pub fn hash_chunk_hex(payload: &[u8]) -> String {
    hex::encode(hash_chunk(payload))
}

/// Verify chunk payload against a hex digest (case-insensitive). A digest that is
/// not 32 bytes of hex never matches.
pub fn verify_chunk_hex(payload: &[u8], expected_hex: &str) -> bool {
    match hex::decode(expected_hex) {
        Ok(expected) => expected.as_slice() == hash_chunk(payload).as_slice(),
        Err(_) => false,
    }
}
