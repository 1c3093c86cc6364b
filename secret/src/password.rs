use std::fmt;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{self, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use serde::{Deserialize, Serialize};

use crate::Secret;

/// Errors from creating or parsing a password hash.
#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    /// The hasher rejected the input or parameters.
    #[error("hashing password: {0}")]
    Hash(String),

    /// A stored value is not a PHC-format hash string.
    #[error("malformed password hash: {0}")]
    Malformed(String),
}

/// A salted argon2id hash in PHC string format.
///
/// Only the hash is ever stored. Plaintext secrets are checked with
/// [PasswordHash::verify], which compares in constant time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PasswordHash(String);

impl PasswordHash {
    /// Hash a plaintext password with a fresh random salt.
    pub fn new(password: &Secret) -> Result<Self, PasswordError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| PasswordError::Hash(err.to_string()))?;
        Ok(Self(hash.to_string()))
    }

    /// Wrap a PHC string loaded from storage.
    pub fn from_phc(value: impl Into<String>) -> Result<Self, PasswordError> {
        let value = value.into();
        password_hash::PasswordHash::new(&value)
            .map_err(|err| PasswordError::Malformed(err.to_string()))?;
        Ok(Self(value))
    }

    /// Check a plaintext password against this hash.
    pub fn verify(&self, password: &Secret) -> bool {
        // Values that bypassed `from_phc` (e.g. deserialized) may not parse.
        let Ok(parsed) = password_hash::PasswordHash::new(&self.0) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    /// The PHC string, for persistence.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordHash(****)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_original_password() {
        let hash = PasswordHash::new(&Secret::from("s3cr3t")).unwrap();
        assert!(hash.verify(&Secret::from("s3cr3t")));
        assert!(!hash.verify(&Secret::from("wrong")));
    }

    #[test]
    fn hash_is_salted_and_irreversible() {
        let a = PasswordHash::new(&Secret::from("s3cr3t")).unwrap();
        let b = PasswordHash::new(&Secret::from("s3cr3t")).unwrap();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("$argon2id$"));
        assert!(!a.as_str().contains("s3cr3t"));
    }

    #[test]
    fn from_phc_round_trips_stored_value() {
        let hash = PasswordHash::new(&Secret::from("pw")).unwrap();
        let loaded = PasswordHash::from_phc(hash.as_str()).unwrap();
        assert!(loaded.verify(&Secret::from("pw")));
    }

    #[test]
    fn from_phc_rejects_plaintext() {
        assert!(PasswordHash::from_phc("plaintext").is_err());
    }

    #[test]
    fn garbage_hash_never_verifies() {
        let hash: PasswordHash = serde_json::from_str("\"not-a-hash\"").unwrap();
        assert!(!hash.verify(&Secret::from("not-a-hash")));
    }

    #[test]
    fn debug_is_redacted() {
        let hash = PasswordHash::new(&Secret::from("pw")).unwrap();
        assert_eq!(format!("{hash:?}"), "PasswordHash(****)");
    }
}
