//! Fixed-length secret buffers.
//!
//! Every KeK, DeK, AppKeK, shared secret and half-key is a [`SecretKey`]:
//! 16 bytes, zeroed on drop, redacted in `Debug`, compared in constant time.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::SECRET_LEN;
use crate::error::{Error, Result};

/// A 16-byte symmetric secret
///
/// Zeroized when dropped. Serializable only so it can live inside records
/// that are themselves encrypted at rest.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct SecretKey([u8; SECRET_LEN]);

impl SecretKey {
    /// Generate a random secret from the OS CSPRNG
    pub fn generate() -> Self {
        Self(random_array())
    }

    /// Wrap existing bytes
    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Copy from a slice, failing unless it is exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(to_array(bytes)?))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    /// XOR-join with another secret
    ///
    /// Self-inverse: `a.xor(&b).xor(&b) == a`. This never validates either
    /// operand; a wrong input silently yields a wrong output.
    pub fn xor(&self, other: &SecretKey) -> SecretKey {
        let mut out = [0u8; SECRET_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        SecretKey(out)
    }

    /// Constant-time equality
    pub fn ct_eq(&self, other: &SecretKey) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// Fill a fresh 16-byte array from the OS CSPRNG
pub fn random_array() -> [u8; SECRET_LEN] {
    let mut bytes = [0u8; SECRET_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Convert a slice into a 16-byte array, rejecting any other length
pub fn to_array(bytes: &[u8]) -> Result<[u8; SECRET_LEN]> {
    bytes.try_into().map_err(|_| Error::LengthMismatch {
        expected: SECRET_LEN,
        actual: bytes.len(),
    })
}
