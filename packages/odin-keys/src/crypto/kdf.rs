//! # Password-Based Key Derivation
//!
//! PBKDF2-HMAC-SHA256 is the only intentionally slow step in the core. It
//! turns a password into the values the login protocol exchanges:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      PASSWORD DERIVATION CHAIN                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  password ──PBKDF2(saltPassword)──► hashedPassword (16 bytes)           │
//! │                                          │                              │
//! │                                          └──PBKDF2(nonce)──►            │
//! │                                             nonceHashedPassword         │
//! │                                                                         │
//! │  password ──PBKDF2(saltKek)───────► KeK (16 bytes)                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use hmac::Hmac;
use pbkdf2::pbkdf2;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::secret::{random_array, SecretKey};
use crate::config::SECRET_LEN;
use crate::error::{Error, Result};

/// Derive `output_len` bytes from a password and salt
///
/// Deterministic for identical inputs; independent outputs for different
/// salts.
pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    if iterations == 0 {
        return Err(Error::InvalidConfig("PBKDF2 iterations must be non-zero".into()));
    }
    let mut out = Zeroizing::new(vec![0u8; output_len]);
    pbkdf2::<Hmac<Sha256>>(password, salt, iterations, &mut out)
        .map_err(|e| Error::Internal(format!("PBKDF2 failed: {}", e)))?;
    Ok(out)
}

/// Derive a 16-byte secret
pub fn derive_secret(password: &[u8], salt: &[u8], iterations: u32) -> Result<SecretKey> {
    let out = derive_key(password, salt, iterations, SECRET_LEN)?;
    SecretKey::from_slice(&out)
}

/// A salted password hash
///
/// Never compared directly; [`SaltedHash::verify`] re-derives and compares
/// in constant time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaltedHash {
    /// Random salt
    pub salt: [u8; SECRET_LEN],
    /// PBKDF2 output
    pub hash: [u8; SECRET_LEN],
}

impl SaltedHash {
    /// Hash a password under a fresh random salt
    pub fn new(password: &[u8], iterations: u32) -> Result<Self> {
        Self::with_salt(password, random_array(), iterations)
    }

    /// Hash a password under the given salt
    pub fn with_salt(password: &[u8], salt: [u8; SECRET_LEN], iterations: u32) -> Result<Self> {
        let hash = derive_secret(password, &salt, iterations)?;
        Ok(Self {
            salt,
            hash: *hash.as_bytes(),
        })
    }

    /// Check a password against this hash in constant time
    pub fn verify(&self, password: &[u8], iterations: u32) -> Result<bool> {
        let candidate = derive_secret(password, &self.salt, iterations)?;
        Ok(candidate.as_bytes().ct_eq(&self.hash).into())
    }
}

impl std::fmt::Debug for SaltedHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaltedHash")
            .field("salt", &hex::encode(self.salt))
            .field("hash", &"[REDACTED]")
            .finish()
    }
}
