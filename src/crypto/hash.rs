//! Email hashing
//!
//! Addresses are normalized (trimmed, lowercased) before SHA-256 so the same
//! mailbox always maps to the same key regardless of how it was typed.

use sha2::{Digest, Sha256};

/// 32-byte SHA-256 hash
pub type Hash256 = [u8; 32];

/// Normalize an email address for hashing
pub fn normalize_email(address: &str) -> String {
    address.trim().to_lowercase()
}

/// SHA-256 of the normalized address
pub fn email_digest(address: &str) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(normalize_email(address).as_bytes());
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of the normalized address
pub fn hash_email(address: &str) -> String {
    hex::encode(email_digest(address))
}

/// Whether a value looks like a hashed email (64 lowercase hex chars)
pub fn is_hashed_email(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_email_known_vector() {
        // sha256("test@example.com")
        assert_eq!(
            hash_email("test@example.com"),
            "973dfe463ec85785f5f95af5ba3906eedb2d931c24e69824a89ea65dba4e813b"
        );
    }

    #[test]
    fn test_hash_email_normalizes() {
        assert_eq!(hash_email("  Test@Example.COM\n"), hash_email("test@example.com"));
        assert_ne!(hash_email("a@example.com"), hash_email("b@example.com"));
    }

    #[test]
    fn test_is_hashed_email() {
        assert!(is_hashed_email(&hash_email("x@y.z")));
        assert!(!is_hashed_email("x@y.z"));
        assert!(!is_hashed_email(&hash_email("x@y.z").to_uppercase()));
    }
}
