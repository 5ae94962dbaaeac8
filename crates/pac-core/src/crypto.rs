//! Cryptographic utilities for webhook verification and generated names.

use hmac::{Hmac, Mac};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Maximum webhook payload size (10MB).
pub const MAX_WEBHOOK_SIZE: usize = 10 * 1024 * 1024;

/// Computes SHA-256 hash of data and returns as hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::Digest;
    let hash = sha2::Sha256::digest(data);
    hex::encode(hash)
}

/// Computes HMAC-SHA256 of data with the given key and returns as hex string.
pub fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> String {
    // HMAC accepts keys of any length, the error branch is unreachable.
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        return String::new();
    };
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a `sha256=<hex>` signature header (GitHub, Bitbucket Data Center).
pub fn verify_prefixed_signature(secret: &str, signature: &str, body: &[u8]) -> bool {
    match signature.strip_prefix("sha256=") {
        Some(provided) => verify_hex_signature(secret, provided, body),
        None => false,
    }
}

/// Verifies a bare hex HMAC-SHA256 signature (Gitea).
pub fn verify_hex_signature(secret: &str, signature: &str, body: &[u8]) -> bool {
    if secret.is_empty() {
        return false;
    }
    let computed = hmac_sha256_hex(secret.as_bytes(), body);
    constant_time_eq(signature.trim().to_lowercase().as_bytes(), computed.as_bytes())
}

/// Compares a plain shared secret (GitLab token header, incoming webhook secret).
pub fn verify_plain_secret(expected: &str, provided: &str) -> bool {
    !expected.is_empty() && constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

/// Constant-time equality comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Random lowercase alphanumeric suffix used for generated resource names.
pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_signature_verification() {
        let secret = "test-secret";
        let body = b"test body";
        let signature = format!("sha256={}", hmac_sha256_hex(secret.as_bytes(), body));

        assert!(verify_prefixed_signature(secret, &signature, body));
        assert!(!verify_prefixed_signature(secret, "sha256=invalid", body));
        assert!(!verify_prefixed_signature("wrong-secret", &signature, body));
        assert!(!verify_prefixed_signature(
            secret,
            &hmac_sha256_hex(secret.as_bytes(), body),
            body
        ));
    }

    #[test]
    fn test_hex_signature_verification() {
        let signature = hmac_sha256_hex(b"gitea", b"{}");
        assert!(verify_hex_signature("gitea", &signature, b"{}"));
        assert!(verify_hex_signature("gitea", &signature.to_uppercase(), b"{}"));
        assert!(!verify_hex_signature("", &signature, b"{}"));
    }

    #[test]
    fn test_plain_secret() {
        assert!(verify_plain_secret("token", "token"));
        assert!(!verify_plain_secret("token", "tokem"));
        assert!(!verify_plain_secret("", ""));
    }

    #[test]
    fn test_random_suffix_charset() {
        let suffix = random_suffix(6);
        assert_eq!(suffix.len(), 6);
        assert!(
            suffix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }
}
