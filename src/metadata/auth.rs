//! Credential hashing for cluster users
//!
//! Hashes are computed once by the proposing node and replicated as opaque
//! PHC strings, so every replica stores identical bytes.

use crate::common::{Error, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

/// Hash a clear-text password into an argon2id PHC string
pub fn hash_password(password: &str) -> Result<String> {
    if password.is_empty() {
        return Err(Error::InvalidRequest("password cannot be empty".into()));
    }
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::Internal(format!("password hashing failed: {}", e)))
}

/// Check a clear-text password against a stored hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// `hash_password` on the blocking pool
pub async fn hash_password_blocking(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_password(&password)).await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("s3cret").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("secret", &hash));
    }

    #[test]
    fn test_salts_differ() {
        let a = hash_password("root").unwrap();
        let b = hash_password("root").unwrap();
        assert_ne!(a, b);
        assert!(verify_password("root", &a));
        assert!(verify_password("root", &b));
    }

    #[test]
    fn test_garbage_hash_never_verifies() {
        assert!(!verify_password("root", "not-a-phc-string"));
        assert!(hash_password("").is_err());
    }
}
