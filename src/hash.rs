use sha2::{Digest, Sha256};

/// Hex SHA-256 of a string. Used for repository ids, chunk text hashes and
/// embedding content hashes.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Truncated hex digest for identity derivation.
pub fn short_hash(input: &str, len: usize) -> String {
    let mut digest = sha256_hex(input);
    digest.truncate(len);
    digest
}
