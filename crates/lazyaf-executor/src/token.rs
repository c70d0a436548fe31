//! Step token generation. Tokens are single-use per step execution; only
//! the SHA-256 digest is stored.

use rand::Rng;
use sha2::{Digest, Sha256};

const TOKEN_LEN: usize = 48;

/// Generate a fresh alphanumeric step token.
pub fn generate() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Hex digest stored in the execution row and checked on every control call.
pub fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_sized() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), TOKEN_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn digest_is_stable_hex() {
        let token = "abc123";
        let d1 = digest(token);
        let d2 = digest(token);
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 64);
        assert!(d1.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
