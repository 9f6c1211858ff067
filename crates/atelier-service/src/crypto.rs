//! Shared-secret checks for webhooks and service keys.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 over `message` and return it hex-encoded.
///
/// HMAC accepts keys of any length, so the `None` branch is unreachable in
/// practice; it exists to keep the signature free of panics.
#[must_use]
pub fn hmac_sha256_hex(secret: &str, message: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Check a hex-encoded HMAC-SHA256 signature of `body`.
///
/// Case of the hex digits is ignored.
#[must_use]
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    hmac_sha256_hex(secret, body)
        .is_some_and(|expected| constant_time_eq(&expected, &signature.trim().to_ascii_lowercase()))
}

/// Constant-time string comparison.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_matches_known_vector() {
        // Widely published test vector.
        let sig = hmac_sha256_hex("key", b"The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(
            sig,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn verify_accepts_uppercase_hex() {
        let body = br#"{"data":{}}"#;
        let sig = hmac_sha256_hex("whsec", body).unwrap().to_ascii_uppercase();
        assert!(verify_signature("whsec", body, &sig));
    }

    #[test]
    fn verify_rejects_other_secret() {
        let body = br#"{"data":{}}"#;
        let sig = hmac_sha256_hex("whsec", body).unwrap();
        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("whsec", body, "deadbeef"));
    }

    #[test]
    fn constant_time_eq_compares_length_and_content() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(constant_time_eq("", ""));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
