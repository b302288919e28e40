//! Token generation and hashing for runners and tasks.
//!
//! Plaintext tokens are only ever returned to their holder once. Storage keeps
//! a random salt and `hex(HMAC-SHA256(salt, token))`.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A freshly generated token with its stored form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub salt: String,
    pub hash: String,
}

impl IssuedToken {
    pub fn generate() -> Self {
        let token = random_hex(20);
        let salt = random_hex(16);
        let hash = hash_token(&token, &salt);
        Self { token, salt, hash }
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub(crate) fn mac(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC can take any size key")
}

pub fn hash_token(token: &str, salt: &str) -> String {
    let mut mac = mac(salt.as_bytes());
    mac.update(token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of `token` against a stored salt and hash.
pub fn verify_token(token: &str, salt: &str, hash: &str) -> bool {
    let Ok(expected) = hex::decode(hash) else {
        return false;
    };
    let mut mac = mac(salt.as_bytes());
    mac.update(token.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_token_shape() {
        let issued = IssuedToken::generate();
        assert_eq!(issued.token.len(), 40);
        assert_eq!(issued.salt.len(), 32);
        assert_eq!(issued.hash.len(), 64);
        assert_ne!(IssuedToken::generate().token, issued.token);
    }

    #[test]
    fn test_verify_token() {
        let issued = IssuedToken::generate();
        assert!(verify_token(&issued.token, &issued.salt, &issued.hash));
        assert!(!verify_token("wrong", &issued.salt, &issued.hash));
        assert!(!verify_token(&issued.token, "other-salt", &issued.hash));
        assert!(!verify_token(&issued.token, &issued.salt, "not-hex"));
    }
}
