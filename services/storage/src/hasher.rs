//! Content hashing used for upload deduplication and mirror keys.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 digest of a whole buffer.
///
/// Returns a 64-character lowercase hex string. Every upload path uses this
/// function, so the same bytes always map to the same record and mirror key.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// True when `value` looks like a digest produced by [`hash_bytes`]
pub fn is_content_hash(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_bytes_known_vector() {
        assert_eq!(
            hash_bytes(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_hash_bytes_stable() {
        let data = vec![7u8; 4096];
        assert_eq!(hash_bytes(&data), hash_bytes(&data.clone()));
        assert_ne!(hash_bytes(b"a"), hash_bytes(b"b"));
    }

    #[test]
    fn test_is_content_hash() {
        assert!(is_content_hash(&hash_bytes(b"")));
        assert!(!is_content_hash("../../etc/passwd"));
        assert!(!is_content_hash(&hash_bytes(b"x").to_uppercase()));
    }
}
