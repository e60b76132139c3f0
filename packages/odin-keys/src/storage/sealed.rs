//! Encryption at rest for any [`KeyValueStore`].
//!
//! Each value is AES-256-GCM encrypted with a random 96-bit nonce and the
//! record key as associated data, so a blob copied to another key fails
//! authentication.
//!
//! ```text
//! stored value = nonce (12 bytes) || ciphertext || tag (16 bytes)
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce as AesNonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

use super::KeyValueStore;
use crate::error::{Error, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
const NONCE_SIZE: usize = 12;

/// Size of the storage key in bytes (256 bits)
pub const STORAGE_KEY_SIZE: usize = 32;

/// A store wrapper that encrypts every value
pub struct SealedStore<S> {
    inner: S,
    key: Zeroizing<[u8; STORAGE_KEY_SIZE]>,
}

impl<S: KeyValueStore> SealedStore<S> {
    /// Wrap `inner`, sealing values under `key`
    pub fn new(inner: S, key: [u8; STORAGE_KEY_SIZE]) -> Self {
        Self {
            inner,
            key: Zeroizing::new(key),
        }
    }

    /// The wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn seal(&self, key: &str, value: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&*self.key)
            .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {}", e)))?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(
                AesNonce::from_slice(&nonce),
                Payload {
                    msg: value,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|e| Error::EncryptionFailed(format!("Encryption failed: {}", e)))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn open(&self, key: &str, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(Error::StorageReadError("Stored data too short".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new_from_slice(&*self.key).map_err(|_| Error::DecryptionFailed)?;
        cipher
            .decrypt(
                AesNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| Error::DecryptionFailed)
    }
}

impl<S: KeyValueStore> KeyValueStore for SealedStore<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.inner.get(key)? {
            Some(data) => Ok(Some(self.open(key, &data)?)),
            None => Ok(None),
        }
    }

    fn upsert(&self, key: &str, value: &[u8]) -> Result<()> {
        let sealed = self.seal(key, value)?;
        self.inner.upsert(key, &sealed)
    }

    /// Opens the value before removing it, so a blob that fails to open
    /// stays in the inner store
    fn delete(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(current) = self.inner.get(key)? else {
            return Ok(None);
        };
        let opened = self.open(key, &current)?;

        // The inner delete still decides which caller wins the record.
        match self.inner.delete(key)? {
            Some(removed) if removed == current => Ok(Some(opened)),
            Some(removed) => Ok(Some(self.open(key, &removed)?)),
            None => Ok(None),
        }
    }
}
