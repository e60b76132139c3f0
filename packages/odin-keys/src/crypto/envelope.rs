//! # Symmetric Envelope
//!
//! XOR split/join and AES-128-CBC, the two primitives every layer of the
//! key hierarchy is built from.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         ENVELOPE PRIMITIVES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  XOR split                                                              │
//! │  ─────────                                                              │
//! │  secret ⊕ half = other_half        other_half ⊕ half = secret           │
//! │  Used where a key must be unrecoverable from either half alone          │
//! │  (DeK ⊕ KeK in the login record, AppKeK ⊕ client cookie).               │
//! │                                                                         │
//! │  AES-128-CBC (PKCS7)                                                    │
//! │  ───────────────────                                                    │
//! │  (iv, ciphertext) = encrypt(plaintext, key)    iv is fresh per call     │
//! │  Used where a key must be recoverable only by a specific holder         │
//! │  (AppKeK under LoginKeK, shard under a dealer wrap key).                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Decryption failures are collapsed into a single [`Error::DecryptionFailed`]
//! so a padding error is indistinguishable from any other failure.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::secret::{random_array, SecretKey};
use crate::config::SECRET_LEN;
use crate::error::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Byte-wise XOR of two equal-length buffers
///
/// Self-inverse: `xor_join(&xor_join(a, b)?, b)? == a`.
pub fn xor_join(a: &[u8], b: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if a.len() != b.len() {
        return Err(Error::LengthMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(Zeroizing::new(
        a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect(),
    ))
}

/// An IV and the CBC ciphertext it was used for
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesSealed {
    /// Random per-encryption IV
    pub iv: [u8; SECRET_LEN],
    /// PKCS7-padded ciphertext
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for AesSealed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesSealed")
            .field("iv", &hex::encode(self.iv))
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

impl AesSealed {
    /// Decrypt with the key this was sealed under
    pub fn open(&self, key: &SecretKey) -> Result<Zeroizing<Vec<u8>>> {
        aes_decrypt(&self.ciphertext, key, &self.iv)
    }

    /// Decrypt into a 16-byte secret, for sealed keys
    pub fn open_key(&self, key: &SecretKey) -> Result<SecretKey> {
        let plain = self.open(key)?;
        // A wrong key that happens to unpad cleanly still lands here.
        SecretKey::from_slice(&plain).map_err(|_| Error::DecryptionFailed)
    }
}

/// Encrypt with a fresh random IV
pub fn aes_encrypt(plaintext: &[u8], key: &SecretKey) -> Result<AesSealed> {
    let iv = random_array();
    let ciphertext = aes_encrypt_with_iv(plaintext, key, &iv)?;
    Ok(AesSealed { iv, ciphertext })
}

/// Encrypt with a caller-chosen IV
///
/// Only for keys that are used exactly once (transit session keys), where
/// the IV travels alongside the key in the unlock header.
pub fn aes_encrypt_with_iv(
    plaintext: &[u8],
    key: &SecretKey,
    iv: &[u8; SECRET_LEN],
) -> Result<Vec<u8>> {
    let cipher = Aes128CbcEnc::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {}", e)))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt a CBC ciphertext
///
/// Any failure (wrong key, wrong IV, truncated or corrupted data, bad
/// padding) is reported as [`Error::DecryptionFailed`] with no detail.
pub fn aes_decrypt(
    ciphertext: &[u8],
    key: &SecretKey,
    iv: &[u8; SECRET_LEN],
) -> Result<Zeroizing<Vec<u8>>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::DecryptionFailed);
    }
    let cipher =
        Aes128CbcDec::new_from_slices(key.as_bytes(), iv).map_err(|_| Error::DecryptionFailed)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| Error::DecryptionFailed)
}
