//! # RSA Key Pairs
//!
//! RSA-OAEP (SHA-256) key pairs for the login reply channel and transit
//! headers, identified by a CRC32 fingerprint of the public key.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         RSA KEY PAIR LIFETIME                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  created ───────── lifetime ─────────► expiration ── grace ──► dead     │
//! │                                                                         │
//! │  live:     hand out the public key, decrypt                             │
//! │  expired:  stop handing out the public key, still decrypt               │
//! │  dead:     eligible for purge (grace = min(lifetime, 24h))              │
//! │                                                                         │
//! │  fingerprint = crc32(PKCS#1 DER of public key)                          │
//! │  Identification only. Never a security boundary.                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey,
};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::envelope::{aes_encrypt, AesSealed};
use super::secret::SecretKey;
use crate::error::{Error, Result};
use crate::time::{now_timestamp, SECS_PER_HOUR};

/// Largest RSA-sealed blob accepted in a header (an 8192-bit modulus)
pub const MAX_RSA_SEALED_LEN: usize = 1024;

/// Longest grace period between expiration and death
const MAX_DEATH_GRACE_SECS: i64 = 24 * SECS_PER_HOUR;

/// CRC32 fingerprint of a canonical public key encoding
pub fn fingerprint(public_der: &[u8]) -> u32 {
    crc32fast::hash(public_der)
}

/// An RSA public key as handed to a remote party
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    /// PKCS#1 DER encoding
    pub der: Vec<u8>,
    /// CRC32 of `der`
    pub fingerprint: u32,
    /// Unix timestamp after which this key should no longer be used
    pub expiration: i64,
}

impl PublicKeyInfo {
    /// Parse a received public key and recompute its fingerprint
    pub fn from_der(der: Vec<u8>, expiration: i64) -> Result<Self> {
        RsaPublicKey::from_pkcs1_der(&der)
            .map_err(|e| Error::InvalidKey(format!("Bad RSA public key: {}", e)))?;
        Ok(Self {
            fingerprint: fingerprint(&der),
            der,
            expiration,
        })
    }

    /// RSA-OAEP encrypt to this key
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = RsaPublicKey::from_pkcs1_der(&self.der)
            .map_err(|e| Error::InvalidKey(format!("Bad RSA public key: {}", e)))?;
        key.encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| Error::EncryptionFailed(format!("RSA encryption failed: {}", e)))
    }
}

impl std::fmt::Debug for PublicKeyInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKeyInfo")
            .field("fingerprint", &format_args!("{:08x}", self.fingerprint))
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// An RSA key pair with its lifetime metadata
#[derive(Clone)]
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: PublicKeyInfo,
    created: i64,
}

impl RsaKeyPair {
    /// Generate a key pair that expires `lifetime_hours` from now
    pub fn generate(bits: usize, lifetime_hours: u32) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
            .map_err(|e| Error::KeyGenerationFailed(e.to_string()))?;
        let created = now_timestamp();
        let expiration = created + i64::from(lifetime_hours) * SECS_PER_HOUR;
        Self::from_private(private, created, expiration)
    }

    fn from_private(private: RsaPrivateKey, created: i64, expiration: i64) -> Result<Self> {
        let der = private
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|e| Error::InvalidKey(format!("Cannot encode public key: {}", e)))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            private,
            public: PublicKeyInfo {
                fingerprint: fingerprint(&der),
                der,
                expiration,
            },
            created,
        })
    }

    /// The public half, for handing to clients and peers
    pub fn public_info(&self) -> &PublicKeyInfo {
        &self.public
    }

    /// CRC32 fingerprint of the public key
    pub fn fingerprint(&self) -> u32 {
        self.public.fingerprint
    }

    /// Creation timestamp
    pub fn created(&self) -> i64 {
        self.created
    }

    /// Expiration timestamp
    pub fn expiration(&self) -> i64 {
        self.public.expiration
    }

    /// Past its expiration at `now`
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.public.expiration
    }

    /// Past expiration plus grace at `now`
    ///
    /// Grace is the key's own lifetime, capped at 24 hours.
    pub fn is_dead_at(&self, now: i64) -> bool {
        let lifetime = (self.public.expiration - self.created).max(0);
        now > self.public.expiration + lifetime.min(MAX_DEATH_GRACE_SECS)
    }

    /// RSA-OAEP encrypt to this pair's public key
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.private
            .to_public_key()
            .encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| Error::EncryptionFailed(format!("RSA encryption failed: {}", e)))
    }

    /// RSA-OAEP decrypt
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| Error::DecryptionFailed)
    }

    /// Wrap the private key under `key` for storage
    pub fn seal(&self, key: &SecretKey) -> Result<StoredRsaKey> {
        let private_der = self
            .private
            .to_pkcs1_der()
            .map_err(|e| Error::InvalidKey(format!("Cannot encode private key: {}", e)))?;
        Ok(StoredRsaKey {
            public_der: self.public.der.clone(),
            fingerprint: self.public.fingerprint,
            wrapped_private: aes_encrypt(private_der.as_bytes(), key)?,
            created: self.created,
            expiration: self.public.expiration,
        })
    }

    /// Unwrap a stored key pair
    pub fn unseal(stored: &StoredRsaKey, key: &SecretKey) -> Result<Self> {
        let private_der = stored.wrapped_private.open(key)?;
        let private =
            RsaPrivateKey::from_pkcs1_der(&private_der).map_err(|_| Error::DecryptionFailed)?;
        let pair = Self::from_private(private, stored.created, stored.expiration)?;
        if pair.public.der != stored.public_der || pair.public.fingerprint != stored.fingerprint {
            return Err(Error::StorageCorrupted(
                "RSA public key does not match wrapped private key".into(),
            ));
        }
        Ok(pair)
    }
}

impl std::fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("fingerprint", &format_args!("{:08x}", self.public.fingerprint))
            .field("created", &self.created)
            .field("expiration", &self.public.expiration)
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// The at-rest form of an [`RsaKeyPair`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRsaKey {
    /// PKCS#1 DER public key
    pub public_der: Vec<u8>,
    /// CRC32 of `public_der`
    pub fingerprint: u32,
    /// PKCS#1 DER private key, AES-wrapped
    pub wrapped_private: AesSealed,
    /// Creation timestamp
    pub created: i64,
    /// Expiration timestamp
    pub expiration: i64,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let pair = test_keys::primary();
        let sealed = pair.public_info().encrypt(b"unlock header").unwrap();
        assert_eq!(&*pair.decrypt(&sealed).unwrap(), b"unlock header");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = test_keys::primary().encrypt(b"secret").unwrap();
        assert!(matches!(
            test_keys::secondary().decrypt(&sealed),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_fingerprint_stable() {
        let pair = test_keys::primary();
        let info = PublicKeyInfo::from_der(pair.public_info().der.clone(), 0).unwrap();
        assert_eq!(info.fingerprint, pair.fingerprint());
        assert_ne!(pair.fingerprint(), test_keys::secondary().fingerprint());
    }

    #[test]
    fn test_bad_public_der_rejected() {
        assert!(matches!(
            PublicKeyInfo::from_der(vec![1, 2, 3], 0),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn test_expiry_and_death() {
        let pair = test_keys::primary();
        let created = pair.created();
        let expiration = pair.expiration();
        assert_eq!(expiration - created, 48 * SECS_PER_HOUR);

        assert!(!pair.is_expired_at(created));
        assert!(pair.is_expired_at(expiration + 1));
        assert!(!pair.is_dead_at(expiration + 1));
        // 48h lifetime caps the grace at 24h
        assert!(!pair.is_dead_at(expiration + 24 * SECS_PER_HOUR));
        assert!(pair.is_dead_at(expiration + 24 * SECS_PER_HOUR + 1));
    }

    #[test]
    fn test_seal_unseal() {
        let pair = test_keys::primary();
        let wrap = SecretKey::generate();
        let stored = pair.seal(&wrap).unwrap();

        let restored = RsaKeyPair::unseal(&stored, &wrap).unwrap();
        assert_eq!(restored.fingerprint(), pair.fingerprint());
        assert_eq!(restored.expiration(), pair.expiration());

        let sealed = pair.encrypt(b"still works").unwrap();
        assert_eq!(&*restored.decrypt(&sealed).unwrap(), b"still works");
    }

    #[test]
    fn test_unseal_wrong_key() {
        let stored = test_keys::primary().seal(&SecretKey::generate()).unwrap();
        assert!(matches!(
            RsaKeyPair::unseal(&stored, &SecretKey::generate()),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_debug_redacts_private() {
        let shown = format!("{:?}", test_keys::primary());
        assert!(shown.contains("[REDACTED]"));
    }
}
