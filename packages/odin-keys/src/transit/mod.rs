//! # Transit Envelope
//!
//! Hybrid RSA + AES packets for host-to-host transfer.
//!
//! ## Layouts
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          TRANSIT PACKET                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Unlock header (32 bytes, never sent in the clear):                     │
//! │  ┌──────────────────────┬──────────────────────┐                        │
//! │  │  session key (16)    │  session IV (16)     │                        │
//! │  └──────────────────────┴──────────────────────┘                        │
//! │                                                                         │
//! │  RSA header:                                                            │
//! │  ┌────────────────┬──────────────────────────────────┐                  │
//! │  │  crc32 LE (4)  │  RSA-OAEP(unlock header) ≤ 1024  │                  │
//! │  └────────────────┴──────────────────────────────────┘                  │
//! │                                                                         │
//! │  AES re-seal header:                                                    │
//! │  ┌────────────────┬──────────────────────────────────┐                  │
//! │  │  IV (16)       │  AES-CBC(unlock header)          │                  │
//! │  └────────────────┴──────────────────────────────────┘                  │
//! │                                                                         │
//! │  Packet bytes: header length u16 LE || header || payload ciphertext     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Re-sealing
//!
//! A recipient can hand decryption to a third party by re-wrapping only the
//! unlock header under a symmetric key the third party holds. The payload
//! ciphertext is carried over untouched.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::config::SECRET_LEN;
use crate::crypto::{
    aes_decrypt, aes_encrypt, aes_encrypt_with_iv, random_array, AesSealed, PublicKeyInfo,
    RsaKeyPair, SecretKey, MAX_RSA_SEALED_LEN,
};
use crate::error::{Error, Result};
use crate::keyring::RsaKeyRing;

/// Size of the plaintext unlock header
pub const UNLOCK_HEADER_LEN: usize = 2 * SECRET_LEN;

const FINGERPRINT_LEN: usize = 4;

/// Session key and IV for one payload
pub struct UnlockHeader {
    /// Payload key
    pub key: SecretKey,
    /// Payload IV
    pub iv: [u8; SECRET_LEN],
}

impl UnlockHeader {
    /// A fresh random key and IV
    pub fn generate() -> Self {
        Self {
            key: SecretKey::generate(),
            iv: random_array(),
        }
    }

    /// `key || iv`
    pub fn to_bytes(&self) -> Zeroizing<[u8; UNLOCK_HEADER_LEN]> {
        let mut out = Zeroizing::new([0u8; UNLOCK_HEADER_LEN]);
        out[..SECRET_LEN].copy_from_slice(self.key.as_bytes());
        out[SECRET_LEN..].copy_from_slice(&self.iv);
        out
    }

    /// Parse `key || iv`, rejecting any other length
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != UNLOCK_HEADER_LEN {
            return Err(Error::LengthMismatch {
                expected: UNLOCK_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let mut iv = [0u8; SECRET_LEN];
        iv.copy_from_slice(&bytes[SECRET_LEN..]);
        Ok(Self {
            key: SecretKey::from_slice(&bytes[..SECRET_LEN])?,
            iv,
        })
    }

    fn encrypt_payload(&self, payload: &[u8]) -> Result<Vec<u8>> {
        aes_encrypt_with_iv(payload, &self.key, &self.iv)
    }

    fn decrypt_payload(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        aes_decrypt(ciphertext, &self.key, &self.iv)
    }
}

/// Unlock header sealed to an RSA key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaHeader {
    /// Fingerprint of the recipient key
    pub fingerprint: u32,
    /// RSA-OAEP ciphertext of the unlock header
    pub sealed: Vec<u8>,
}

impl RsaHeader {
    /// `crc32 LE || sealed`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FINGERPRINT_LEN + self.sealed.len());
        out.extend_from_slice(&self.fingerprint.to_le_bytes());
        out.extend_from_slice(&self.sealed);
        out
    }

    /// Parse `crc32 LE || sealed`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= FINGERPRINT_LEN {
            return Err(Error::MalformedPayload("RSA header is truncated".into()));
        }
        let sealed = &bytes[FINGERPRINT_LEN..];
        if sealed.len() > MAX_RSA_SEALED_LEN {
            return Err(Error::MalformedPayload(format!(
                "RSA header is {} bytes, limit {}",
                sealed.len(),
                MAX_RSA_SEALED_LEN
            )));
        }
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        fingerprint.copy_from_slice(&bytes[..FINGERPRINT_LEN]);
        Ok(Self {
            fingerprint: u32::from_le_bytes(fingerprint),
            sealed: sealed.to_vec(),
        })
    }
}

/// Unlock header sealed under a symmetric key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesHeader(pub AesSealed);

impl AesHeader {
    /// `iv || sealed`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SECRET_LEN + self.0.ciphertext.len());
        out.extend_from_slice(&self.0.iv);
        out.extend_from_slice(&self.0.ciphertext);
        out
    }

    /// Parse `iv || sealed`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= SECRET_LEN {
            return Err(Error::MalformedPayload("AES header is truncated".into()));
        }
        let mut iv = [0u8; SECRET_LEN];
        iv.copy_from_slice(&bytes[..SECRET_LEN]);
        Ok(Self(AesSealed {
            iv,
            ciphertext: bytes[SECRET_LEN..].to_vec(),
        }))
    }
}

/// A payload addressed to an RSA key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitPacket {
    /// Sealed unlock header
    pub header: RsaHeader,
    /// AES-CBC payload ciphertext
    pub ciphertext: Vec<u8>,
}

impl TransitPacket {
    /// Encrypt `payload` for `recipient`
    pub fn seal(payload: &[u8], recipient: &PublicKeyInfo) -> Result<Self> {
        let unlock = UnlockHeader::generate();
        let ciphertext = unlock.encrypt_payload(payload)?;
        let sealed = recipient.encrypt(&unlock.to_bytes()[..])?;
        tracing::debug!(
            "Sealed {} byte payload for key {:08x}",
            payload.len(),
            recipient.fingerprint
        );
        Ok(Self {
            header: RsaHeader {
                fingerprint: recipient.fingerprint,
                sealed,
            },
            ciphertext,
        })
    }

    /// Decrypt with the recipient's key pair
    pub fn open(&self, recipient: &RsaKeyPair) -> Result<Zeroizing<Vec<u8>>> {
        let unlock = self.unlock(recipient)?;
        unlock.decrypt_payload(&self.ciphertext)
    }

    /// Decrypt with whichever ring key the header names
    pub fn open_with_ring(&self, ring: &RsaKeyRing) -> Result<Zeroizing<Vec<u8>>> {
        let pair = ring
            .private_key(self.header.fingerprint)
            .ok_or(Error::UnknownKey(self.header.fingerprint))?;
        self.open(&pair)
    }

    /// Re-wrap the unlock header under `new_key`
    ///
    /// The payload ciphertext is reused as is.
    pub fn reseal(&self, recipient: &RsaKeyPair, new_key: &SecretKey) -> Result<ResealedPacket> {
        let unlock = self.unlock(recipient)?;
        let header = AesHeader(aes_encrypt(&unlock.to_bytes()[..], new_key)?);
        tracing::debug!("Resealed packet for key {:08x}", self.header.fingerprint);
        Ok(ResealedPacket {
            header,
            ciphertext: self.ciphertext.clone(),
        })
    }

    /// `header len u16 LE || RSA header || ciphertext`
    ///
    /// Fails with [`Error::LengthMismatch`] for a header too long to frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        frame(&self.header.to_bytes(), &self.ciphertext)
    }

    /// Parse packet bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (header, ciphertext) = unframe(bytes)?;
        Ok(Self {
            header: RsaHeader::from_bytes(header)?,
            ciphertext: ciphertext.to_vec(),
        })
    }

    fn unlock(&self, recipient: &RsaKeyPair) -> Result<UnlockHeader> {
        if recipient.fingerprint() != self.header.fingerprint {
            return Err(Error::KeyMismatch {
                expected: self.header.fingerprint,
                actual: recipient.fingerprint(),
            });
        }
        let plain = recipient.decrypt(&self.header.sealed)?;
        UnlockHeader::from_bytes(&plain)
    }
}

/// A packet whose unlock header is sealed under a symmetric key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResealedPacket {
    /// Sealed unlock header
    pub header: AesHeader,
    /// The original payload ciphertext
    pub ciphertext: Vec<u8>,
}

impl ResealedPacket {
    /// Decrypt with the key the header was resealed under
    pub fn open(&self, key: &SecretKey) -> Result<Zeroizing<Vec<u8>>> {
        let plain = self.header.0.open(key)?;
        // A wrong key that unpads cleanly leaves a header of the wrong size.
        let unlock = UnlockHeader::from_bytes(&plain).map_err(|_| Error::DecryptionFailed)?;
        unlock.decrypt_payload(&self.ciphertext)
    }

    /// `header len u16 LE || AES header || ciphertext`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        frame(&self.header.to_bytes(), &self.ciphertext)
    }

    /// Parse packet bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (header, ciphertext) = unframe(bytes)?;
        Ok(Self {
            header: AesHeader::from_bytes(header)?,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

fn frame(header: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(header.len()).map_err(|_| Error::LengthMismatch {
        expected: usize::from(u16::MAX),
        actual: header.len(),
    })?;
    let mut out = Vec::with_capacity(2 + header.len() + ciphertext.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(header);
    out.extend_from_slice(ciphertext);
    Ok(out)
}

fn unframe(bytes: &[u8]) -> Result<(&[u8], &[u8])> {
    if bytes.len() < 2 {
        return Err(Error::MalformedPayload("Packet is truncated".into()));
    }
    let len = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    let rest = &bytes[2..];
    if rest.len() < len {
        return Err(Error::MalformedPayload("Packet header is truncated".into()));
    }
    Ok(rest.split_at(len))
}
