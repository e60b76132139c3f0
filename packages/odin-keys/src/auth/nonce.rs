//! # Nonce Challenge
//!
//! One-time login challenges and the password proofs that answer them.
//!
//! ## Protocol
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       CHALLENGE / RESPONSE LOGIN                        │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  SERVER                                  CLIENT                         │
//! │  ──────                                  ──────                         │
//! │  issue()                                                                │
//! │    nonce, saltPassword, saltKek ───────► hashedPassword =               │
//! │    (pairwise distinct, TTL)                PBKDF2(pw, saltPassword)     │
//! │    + RSA key fingerprint                 kek = PBKDF2(pw, saltKek)      │
//! │                                          nonceHashedPassword =          │
//! │                                            PBKDF2(hashedPassword, nonce)│
//! │                                                                         │
//! │                                ◄──────── nonce, nonceHashedPassword,    │
//! │                                          RSA(fp, {hashedPassword,       │
//! │                                               kek, sharedSecret})       │
//! │  verify()                                                               │
//! │    1. consume pending package (exactly once, pass or fail)              │
//! │    2. RSA-decrypt payload with key `fp`                                 │
//! │    3. parse three 16-byte fields                                        │
//! │    4. PBKDF2(hash, nonce) == nonceHashedPassword (constant time)        │
//! │    → kek, sharedSecret                                                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The KeK and shared secret only ever cross the wire inside the RSA
//! payload. The package is deleted before any check runs, so a second
//! attempt with the same nonce always fails with [`Error::NonceNotFound`].

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::login_keys::LoginKeyRecord;
use crate::config::{KeychainConfig, SECRET_LEN};
use crate::crypto::{derive_secret, random_array, to_array, PublicKeyInfo, SecretKey};
use crate::error::{Error, Result};
use crate::keyring::RsaKeyRing;
use crate::storage::{keys, save_record, take_record, KeyValueStore};
use crate::time::{expires_in, now_timestamp};

/// A login challenge
///
/// The id is the nonce itself read as a UUID, so the reply's nonce is enough
/// to find the pending package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoncePackage {
    /// Lookup id (the nonce bytes as a UUID)
    pub id: Uuid,
    /// Random challenge
    pub nonce: [u8; SECRET_LEN],
    /// Salt for the password hash
    pub salt_password: [u8; SECRET_LEN],
    /// Salt for the KeK
    pub salt_kek: [u8; SECRET_LEN],
    /// Fingerprint of the RSA key the reply should be encrypted to
    pub public_key_fingerprint: u32,
    /// Unix timestamp after which the package is refused
    pub expiration: i64,
}

/// A client's answer to a [`NoncePackage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordReply {
    /// The nonce being answered
    pub nonce: [u8; SECRET_LEN],
    /// PBKDF2(hashedPassword, nonce)
    pub nonce_hashed_password: [u8; SECRET_LEN],
    /// Fingerprint of the RSA key the payload is encrypted to
    pub rsa_fingerprint: u32,
    /// RSA-OAEP encrypted JSON `{hashedPassword, kek, sharedSecret}`
    pub rsa_encrypted_payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyPayload {
    hashed_password: String,
    kek: String,
    shared_secret: String,
}

impl Drop for ReplyPayload {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.hashed_password.zeroize();
        self.kek.zeroize();
        self.shared_secret.zeroize();
    }
}

impl PasswordReply {
    /// Compute a reply on the client side
    ///
    /// Derives the password hash and KeK under the package's salts, proves
    /// knowledge of the hash against the nonce, and seals the hash, KeK and
    /// `shared_secret` to `server_key`.
    pub fn compute(
        password: &[u8],
        package: &NoncePackage,
        server_key: &PublicKeyInfo,
        shared_secret: &SecretKey,
        iterations: u32,
    ) -> Result<Self> {
        let hashed_password = derive_secret(password, &package.salt_password, iterations)?;
        let kek = derive_secret(password, &package.salt_kek, iterations)?;
        let nonce_hashed_password =
            derive_secret(hashed_password.as_bytes(), &package.nonce, iterations)?;

        let payload = ReplyPayload {
            hashed_password: STANDARD.encode(hashed_password.as_bytes()),
            kek: STANDARD.encode(kek.as_bytes()),
            shared_secret: STANDARD.encode(shared_secret.as_bytes()),
        };
        let json = Zeroizing::new(serde_json::to_vec(&payload)?);

        Ok(Self {
            nonce: package.nonce,
            nonce_hashed_password: *nonce_hashed_password.as_bytes(),
            rsa_fingerprint: server_key.fingerprint,
            rsa_encrypted_payload: server_key.encrypt(&json)?,
        })
    }
}

/// The secrets recovered from a verified reply
pub struct VerifiedReply {
    /// The consumed challenge
    pub package: NoncePackage,
    /// PBKDF2(password, saltPassword)
    pub hashed_password: SecretKey,
    /// PBKDF2(password, saltKek)
    pub kek: SecretKey,
    /// Client-chosen shared secret for the session
    pub shared_secret: SecretKey,
}

impl std::fmt::Debug for VerifiedReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifiedReply")
            .field("nonce_id", &self.package.id)
            .finish_non_exhaustive()
    }
}

/// Issues and verifies login challenges
pub struct NonceChallenge {
    store: Arc<dyn KeyValueStore>,
    ring: Arc<RsaKeyRing>,
    config: KeychainConfig,
}

impl NonceChallenge {
    /// Create a challenge service over a store and key ring
    pub fn new(store: Arc<dyn KeyValueStore>, ring: Arc<RsaKeyRing>, config: KeychainConfig) -> Self {
        Self {
            store,
            ring,
            config,
        }
    }

    /// Issue a challenge with fresh salts
    ///
    /// Used when the owner sets a password for the first time or chooses a
    /// new one.
    pub fn issue(&self) -> Result<NoncePackage> {
        self.issue_with_salts(None)
    }

    /// Issue a challenge for an existing owner, reusing the record's salts
    pub fn issue_for(&self, record: &LoginKeyRecord) -> Result<NoncePackage> {
        self.issue_with_salts(Some((record.salt_password, record.salt_kek)))
    }

    fn issue_with_salts(
        &self,
        salts: Option<([u8; SECRET_LEN], [u8; SECRET_LEN])>,
    ) -> Result<NoncePackage> {
        let public = self.ring.current_public()?;
        let (nonce, salt_password, salt_kek) = distinct_triple(salts)?;

        let package = NoncePackage {
            id: Uuid::from_bytes(nonce),
            nonce,
            salt_password,
            salt_kek,
            public_key_fingerprint: public.fingerprint,
            expiration: expires_in(self.config.nonce_ttl_secs),
        };
        save_record(&*self.store, &keys::nonce_package(&package.id), &package)?;
        tracing::debug!("Nonce {} issued", package.id);
        Ok(package)
    }

    /// Verify a first-time reply
    ///
    /// The proof is checked against the hash carried in the payload itself;
    /// this establishes the password rather than checking it.
    pub fn verify(&self, reply: &PasswordReply) -> Result<VerifiedReply> {
        self.verify_at(reply, None, now_timestamp())
    }

    /// Verify a login reply against the stored owner record
    pub fn verify_login(&self, reply: &PasswordReply, record: &LoginKeyRecord) -> Result<VerifiedReply> {
        self.verify_at(reply, Some(record), now_timestamp())
    }

    /// Verify at an explicit time
    pub fn verify_at(
        &self,
        reply: &PasswordReply,
        record: Option<&LoginKeyRecord>,
        now: i64,
    ) -> Result<VerifiedReply> {
        let package = self.consume(&reply.nonce)?;
        if now > package.expiration {
            tracing::debug!("Nonce {} expired", package.id);
            return Err(Error::NonceExpired);
        }

        let result = self.check_reply(reply, package, record);
        if let Err(e) = &result {
            tracing::warn!("Password reply rejected: {}", e);
        }
        result
    }

    fn consume(&self, nonce: &[u8; SECRET_LEN]) -> Result<NoncePackage> {
        let id = Uuid::from_bytes(*nonce);
        let package: Option<NoncePackage> = take_record(&*self.store, &keys::nonce_package(&id))?;
        package.ok_or_else(|| {
            tracing::warn!("Reply for unknown or consumed nonce {}", id);
            Error::NonceNotFound
        })
    }

    fn check_reply(
        &self,
        reply: &PasswordReply,
        package: NoncePackage,
        record: Option<&LoginKeyRecord>,
    ) -> Result<VerifiedReply> {
        let plain = self
            .ring
            .decrypt(reply.rsa_fingerprint, &reply.rsa_encrypted_payload)?;
        let (hashed_password, kek, shared_secret) = parse_payload(&plain)?;

        let basis = match record {
            Some(record) => {
                let stored = SecretKey::from_bytes(record.hash_password);
                if !stored.ct_eq(&hashed_password) {
                    return Err(Error::PasswordMismatch);
                }
                stored
            }
            None => hashed_password.clone(),
        };

        let expected = derive_secret(basis.as_bytes(), &package.nonce, self.config.pbkdf2_iterations)?;
        if !expected.ct_eq(&SecretKey::from_bytes(reply.nonce_hashed_password)) {
            return Err(Error::PasswordMismatch);
        }

        tracing::debug!("Nonce {} verified", package.id);
        Ok(VerifiedReply {
            package,
            hashed_password,
            kek,
            shared_secret,
        })
    }
}

fn parse_payload(plain: &[u8]) -> Result<(SecretKey, SecretKey, SecretKey)> {
    let payload: ReplyPayload = serde_json::from_slice(plain)
        .map_err(|e| Error::MalformedPayload(format!("Unparseable reply: {}", e)))?;
    Ok((
        decode_field("hashedPassword", &payload.hashed_password)?,
        decode_field("kek", &payload.kek)?,
        decode_field("sharedSecret", &payload.shared_secret)?,
    ))
}

fn decode_field(name: &str, encoded: &str) -> Result<SecretKey> {
    let bytes = Zeroizing::new(
        STANDARD
            .decode(encoded)
            .map_err(|_| Error::MalformedPayload(format!("{} is not base64", name)))?,
    );
    let array = to_array(&bytes)
        .map_err(|_| Error::MalformedPayload(format!("{} must be {} bytes", name, SECRET_LEN)))?;
    Ok(SecretKey::from_bytes(array))
}

/// Draw a nonce (and salts, unless supplied) until all three differ
fn distinct_triple(
    salts: Option<([u8; SECRET_LEN], [u8; SECRET_LEN])>,
) -> Result<([u8; SECRET_LEN], [u8; SECRET_LEN], [u8; SECRET_LEN])> {
    if let Some((salt_password, salt_kek)) = salts {
        if salt_password == salt_kek {
            return Err(Error::StorageCorrupted("Stored salts are identical".into()));
        }
    }
    loop {
        let nonce = random_array();
        let (salt_password, salt_kek) = salts.unwrap_or_else(|| (random_array(), random_array()));
        if nonce != salt_password && nonce != salt_kek && salt_password != salt_kek {
            return Ok((nonce, salt_password, salt_kek));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;
    use crate::storage::MemoryStore;

    const ITERATIONS: u32 = 1_000;

    fn setup() -> (NonceChallenge, Arc<RsaKeyRing>, Arc<MemoryStore>) {
        let config = KeychainConfig {
            pbkdf2_iterations: ITERATIONS,
            ..Default::default()
        };
        let ring = Arc::new(RsaKeyRing::new(&config));
        ring.install(test_keys::primary()).unwrap();
        let store = Arc::new(MemoryStore::new());
        let challenge = NonceChallenge::new(store.clone(), ring.clone(), config);
        (challenge, ring, store)
    }

    fn reply_for(ring: &RsaKeyRing, package: &NoncePackage, password: &[u8]) -> PasswordReply {
        let public = ring.public_key(package.public_key_fingerprint).unwrap();
        PasswordReply::compute(password, package, &public, &SecretKey::generate(), ITERATIONS)
            .unwrap()
    }

    #[test]
    fn test_issue_distinct_values() {
        let (challenge, ring, store) = setup();
        let package = challenge.issue().unwrap();

        assert_ne!(package.nonce, package.salt_password);
        assert_ne!(package.nonce, package.salt_kek);
        assert_ne!(package.salt_password, package.salt_kek);
        assert_eq!(package.id, Uuid::from_bytes(package.nonce));
        assert_eq!(package.public_key_fingerprint, ring.fingerprints()[0]);
        assert!(store.exists(&keys::nonce_package(&package.id)));
    }

    #[test]
    fn test_issue_requires_key() {
        let config = KeychainConfig::default();
        let challenge = NonceChallenge::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RsaKeyRing::new(&config)),
            config,
        );
        assert!(matches!(challenge.issue(), Err(Error::NoCurrentKey)));
    }

    #[test]
    fn test_verify_returns_secrets() {
        let (challenge, ring, _) = setup();
        let package = challenge.issue().unwrap();

        let shared = SecretKey::generate();
        let public = ring.current_public().unwrap();
        let reply =
            PasswordReply::compute(b"correct-horse", &package, &public, &shared, ITERATIONS)
                .unwrap();

        let verified = challenge.verify(&reply).unwrap();
        assert!(verified.shared_secret.ct_eq(&shared));

        let expected_kek = derive_secret(b"correct-horse", &package.salt_kek, ITERATIONS).unwrap();
        assert!(verified.kek.ct_eq(&expected_kek));
        assert_eq!(verified.package, package);
    }

    #[test]
    fn test_nonce_single_use() {
        let (challenge, ring, _) = setup();
        let package = challenge.issue().unwrap();
        let reply = reply_for(&ring, &package, b"correct-horse");

        assert!(challenge.verify(&reply).is_ok());
        let second = challenge.verify(&reply);
        assert!(matches!(second, Err(Error::NonceNotFound)));
        assert!(second.unwrap_err().is_attack_signal());
    }

    #[test]
    fn test_failed_verify_still_consumes() {
        let (challenge, ring, _) = setup();
        let package = challenge.issue().unwrap();
        let mut reply = reply_for(&ring, &package, b"correct-horse");
        reply.nonce_hashed_password[0] ^= 0xFF;

        assert!(matches!(challenge.verify(&reply), Err(Error::PasswordMismatch)));

        reply.nonce_hashed_password[0] ^= 0xFF;
        assert!(matches!(challenge.verify(&reply), Err(Error::NonceNotFound)));
    }

    #[test]
    fn test_unknown_key() {
        let (challenge, ring, _) = setup();
        let package = challenge.issue().unwrap();
        let mut reply = reply_for(&ring, &package, b"correct-horse");
        reply.rsa_fingerprint = reply.rsa_fingerprint.wrapping_add(1);

        assert!(matches!(challenge.verify(&reply), Err(Error::UnknownKey(_))));
    }

    #[test]
    fn test_corrupted_payload() {
        let (challenge, ring, _) = setup();
        let package = challenge.issue().unwrap();
        let mut reply = reply_for(&ring, &package, b"correct-horse");
        reply.rsa_encrypted_payload[10] ^= 0x01;

        assert!(matches!(challenge.verify(&reply), Err(Error::DecryptionFailed)));
    }

    #[test]
    fn test_malformed_payload() {
        let (challenge, ring, _) = setup();
        let public = ring.current_public().unwrap();

        let cases: [&[u8]; 3] = [
            b"not json",
            br#"{"hashedPassword":"AAAAAAAAAAAAAAAAAAAAAA==","kek":"AAAAAAAAAAAAAAAAAAAAAA=="}"#,
            br#"{"hashedPassword":"AAAA","kek":"AAAAAAAAAAAAAAAAAAAAAA==","sharedSecret":"AAAAAAAAAAAAAAAAAAAAAA=="}"#,
        ];
        for payload in cases {
            let package = challenge.issue().unwrap();
            let reply = PasswordReply {
                nonce: package.nonce,
                nonce_hashed_password: [0u8; 16],
                rsa_fingerprint: public.fingerprint,
                rsa_encrypted_payload: public.encrypt(payload).unwrap(),
            };
            assert!(matches!(
                challenge.verify(&reply),
                Err(Error::MalformedPayload(_))
            ));
        }
    }

    #[test]
    fn test_expired_nonce() {
        let (challenge, ring, _) = setup();
        let package = challenge.issue().unwrap();
        let reply = reply_for(&ring, &package, b"correct-horse");

        let result = challenge.verify_at(&reply, None, package.expiration + 1);
        assert!(matches!(result, Err(Error::NonceExpired)));
        assert!(matches!(challenge.verify(&reply), Err(Error::NonceNotFound)));
    }

    #[test]
    fn test_verify_login_against_record() {
        let (challenge, ring, _) = setup();
        let setup_package = challenge.issue().unwrap();
        let verified = challenge
            .verify(&reply_for(&ring, &setup_package, b"correct-horse"))
            .unwrap();
        let record = LoginKeyRecord::create(&verified);

        let package = challenge.issue_for(&record).unwrap();
        assert_eq!(package.salt_password, record.salt_password);
        assert_eq!(package.salt_kek, record.salt_kek);

        let good = reply_for(&ring, &package, b"correct-horse");
        let login = challenge.verify_login(&good, &record).unwrap();
        assert!(login.kek.ct_eq(&verified.kek));

        let package = challenge.issue_for(&record).unwrap();
        let bad = reply_for(&ring, &package, b"battery-staple");
        assert!(matches!(
            challenge.verify_login(&bad, &record),
            Err(Error::PasswordMismatch)
        ));
    }

    #[test]
    fn test_reply_after_rotation_uses_previous() {
        let (challenge, ring, _) = setup();
        let package = challenge.issue().unwrap();
        let reply = reply_for(&ring, &package, b"correct-horse");

        ring.install(test_keys::secondary()).unwrap();
        assert!(challenge.verify(&reply).is_ok());
    }

    #[test]
    fn test_concurrent_verify_single_winner() {
        let (challenge, ring, _) = setup();
        let challenge = Arc::new(challenge);
        let package = challenge.issue().unwrap();
        let reply = Arc::new(reply_for(&ring, &package, b"correct-horse"));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let challenge = Arc::clone(&challenge);
                let reply = Arc::clone(&reply);
                std::thread::spawn(move || challenge.verify(&reply).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_identical_stored_salts_rejected() {
        let salt = [3u8; 16];
        assert!(matches!(
            distinct_triple(Some((salt, salt))),
            Err(Error::StorageCorrupted(_))
        ));
    }
}
