//! # Content Digests
//!
//! Digest computation over the discriminating fields of a source or a
//! decryption key set. The digest is the lowercase hex SHA-256 of the
//! canonical JSON encoding of the value tuple, so any change to any
//! discriminating field changes the digest.

use serde::Serialize;
use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Compute the digest of an ordered tuple of discriminating values.
///
/// Serialization of the tuple is deterministic: struct fields keep their
/// declaration order and maps must be ordered (`BTreeMap`) by the caller.
pub fn calculate_digest<T: Serialize>(values: &T) -> String {
    // serde_json only fails on non-string map keys or failing Serialize
    // impls; none of the digested tuples contain either.
    let raw = serde_json::to_vec(values).expect("digest input must serialize to JSON");
    sha256_hex(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_digest_is_stable() {
        let a = ("http://example.com/a.tgz", "abc123", "v1.2.3");
        assert_eq!(calculate_digest(&a), calculate_digest(&a));
    }

    #[test]
    fn test_digest_is_lowercase_hex_sha256() {
        let digest = calculate_digest(&("x",));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_digest_changes_with_any_field() {
        let base = ("http://example.com/a.tgz", "abc123", "v1.2.3");
        let other_url = ("http://example.com/b.tgz", "abc123", "v1.2.3");
        let other_digest = ("http://example.com/a.tgz", "abc124", "v1.2.3");
        let other_revision = ("http://example.com/a.tgz", "abc123", "v1.2.4");
        assert_ne!(calculate_digest(&base), calculate_digest(&other_url));
        assert_ne!(calculate_digest(&base), calculate_digest(&other_digest));
        assert_ne!(calculate_digest(&base), calculate_digest(&other_revision));
    }

    #[test]
    fn test_digest_sensitive_to_annotations() {
        let annotations_a = BTreeMap::from([("touched".to_string(), "1".to_string())]);
        let annotations_b = BTreeMap::from([("touched".to_string(), "2".to_string())]);
        let a = ("uid", 3i64, &annotations_a, "url", "digest", "rev");
        let b = ("uid", 3i64, &annotations_b, "url", "digest", "rev");
        assert_ne!(calculate_digest(&a), calculate_digest(&b));
    }

    #[test]
    fn test_sha256_hex_known_value() {
        // sha256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
