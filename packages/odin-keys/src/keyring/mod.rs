//! # RSA Key Ring
//!
//! Holds the identity's `current` RSA key and at most one `previous` key, so
//! anything encrypted under a key that was just rotated out stays readable
//! until that key is retired.
//!
//! ## States
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY RING STATES                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   NoKey ──generate──► HasCurrent ──generate──► HasCurrentAndPrevious    │
//! │                          ▲                           │       │          │
//! │                          └──────retire_previous──────┘       │          │
//! │                                                              │          │
//! │                           generate (policy check on previous)┘          │
//! │                                                                         │
//! │  A rotation discards the old `previous`. The rotation policy is asked   │
//! │  first and can refuse with RotationBlocked.                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rotation swaps both slots under one write lock. Readers see the ring
//! either before or after a rotation, never half-way.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{KeychainConfig, MIN_RSA_LIFETIME_HOURS};
use crate::crypto::{PublicKeyInfo, RsaKeyPair, SecretKey, StoredRsaKey};
use crate::error::{Error, Result};
use crate::storage::{keys, load_record, save_record, KeyValueStore};
use crate::time::now_timestamp;

/// Decides whether the key about to be discarded can go
///
/// Typically backed by a count of queued messages still encrypted to it.
pub trait RotationPolicy: Send + Sync {
    /// `false` if `outgoing` still has dependents
    fn can_rotate(&self, outgoing: &RsaKeyPair) -> bool;
}

/// Rotation policy that never blocks
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRotate;

impl RotationPolicy for AlwaysRotate {
    fn can_rotate(&self, _outgoing: &RsaKeyPair) -> bool {
        true
    }
}

impl<F> RotationPolicy for F
where
    F: Fn(&RsaKeyPair) -> bool + Send + Sync,
{
    fn can_rotate(&self, outgoing: &RsaKeyPair) -> bool {
        self(outgoing)
    }
}

#[derive(Default, Clone)]
struct Slots {
    current: Option<RsaKeyPair>,
    previous: Option<RsaKeyPair>,
}

#[derive(Serialize, Deserialize)]
struct StoredRing {
    current: Option<StoredRsaKey>,
    previous: Option<StoredRsaKey>,
}

/// The identity's current and previous RSA key pairs
pub struct RsaKeyRing {
    slots: RwLock<Slots>,
    policy: Arc<dyn RotationPolicy>,
    key_bits: usize,
}

impl RsaKeyRing {
    /// Create an empty ring
    pub fn new(config: &KeychainConfig) -> Self {
        Self::with_policy(config, Arc::new(AlwaysRotate))
    }

    /// Create an empty ring with a rotation policy
    pub fn with_policy(config: &KeychainConfig, policy: Arc<dyn RotationPolicy>) -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            policy,
            key_bits: config.rsa_key_bits,
        }
    }

    /// Generate a new current key, demoting the existing one to previous
    ///
    /// Fails with [`Error::LifetimeTooShort`] under 24 hours and with
    /// [`Error::RotationBlocked`] if the policy refuses to discard the
    /// existing previous key.
    pub fn generate(&self, min_lifetime_hours: u32) -> Result<u32> {
        if min_lifetime_hours < MIN_RSA_LIFETIME_HOURS {
            return Err(Error::LifetimeTooShort {
                minimum: MIN_RSA_LIFETIME_HOURS,
                requested: min_lifetime_hours,
            });
        }
        // Refuse before paying for key generation.
        self.check_rotation(&self.slots.read())?;

        let pair = RsaKeyPair::generate(self.key_bits, min_lifetime_hours)?;
        self.install(pair)
    }

    /// Install an externally generated key as current
    pub fn install(&self, pair: RsaKeyPair) -> Result<u32> {
        let fingerprint = pair.fingerprint();
        let mut slots = self.slots.write();
        // Checked again under the write lock; a rotation may have raced us.
        self.check_rotation(&slots)?;

        let demoted = slots.current.take();
        if let Some(old) = &demoted {
            tracing::info!(
                "RSA key {:08x} demoted to previous, {:08x} is current",
                old.fingerprint(),
                fingerprint
            );
        } else {
            tracing::info!("RSA key {:08x} installed", fingerprint);
        }
        slots.previous = demoted;
        slots.current = Some(pair);
        Ok(fingerprint)
    }

    fn check_rotation(&self, slots: &Slots) -> Result<()> {
        if slots.current.is_some() {
            if let Some(outgoing) = &slots.previous {
                if !self.policy.can_rotate(outgoing) {
                    tracing::warn!(
                        "Rotation blocked: RSA key {:08x} still has dependents",
                        outgoing.fingerprint()
                    );
                    return Err(Error::RotationBlocked);
                }
            }
        }
        Ok(())
    }

    /// Drop the previous key
    ///
    /// Returns the retired fingerprint, if there was one.
    pub fn retire_previous(&self) -> Option<u32> {
        let retired = self.slots.write().previous.take();
        retired.map(|pair| {
            tracing::info!("RSA key {:08x} retired", pair.fingerprint());
            pair.fingerprint()
        })
    }

    /// Retire the previous key if it is dead at `now` and the policy agrees
    pub fn purge_dead_previous_at(&self, now: i64) -> Option<u32> {
        let mut slots = self.slots.write();
        let purge = match &slots.previous {
            Some(pair) => pair.is_dead_at(now) && self.policy.can_rotate(pair),
            None => false,
        };
        if !purge {
            return None;
        }
        slots.previous.take().map(|pair| {
            tracing::info!("Dead RSA key {:08x} purged", pair.fingerprint());
            pair.fingerprint()
        })
    }

    /// [`Self::purge_dead_previous_at`] with the current time
    pub fn purge_dead_previous(&self) -> Option<u32> {
        self.purge_dead_previous_at(now_timestamp())
    }

    /// The current key's public half
    pub fn current_public(&self) -> Result<PublicKeyInfo> {
        self.slots
            .read()
            .current
            .as_ref()
            .map(|pair| pair.public_info().clone())
            .ok_or(Error::NoCurrentKey)
    }

    /// The current key pair
    pub fn current(&self) -> Option<RsaKeyPair> {
        self.slots.read().current.clone()
    }

    /// The current key, generating one if the ring is empty
    pub fn ensure_current(&self, min_lifetime_hours: u32) -> Result<PublicKeyInfo> {
        if let Ok(public) = self.current_public() {
            return Ok(public);
        }
        self.generate(min_lifetime_hours)?;
        self.current_public()
    }

    /// Look up a public key by fingerprint across current and previous
    ///
    /// `None` means a stale key; the client should fetch the current one.
    pub fn public_key(&self, fingerprint: u32) -> Option<PublicKeyInfo> {
        self.private_key(fingerprint)
            .map(|pair| pair.public_info().clone())
    }

    /// Look up a key pair by fingerprint across current and previous
    pub fn private_key(&self, fingerprint: u32) -> Option<RsaKeyPair> {
        let slots = self.slots.read();
        let found = [slots.current.as_ref(), slots.previous.as_ref()]
            .into_iter()
            .flatten()
            .find(|pair| pair.fingerprint() == fingerprint)
            .cloned();
        found
    }

    /// RSA-decrypt with the key matching `fingerprint`
    pub fn decrypt(&self, fingerprint: u32, ciphertext: &[u8]) -> Result<zeroize::Zeroizing<Vec<u8>>> {
        let pair = self
            .private_key(fingerprint)
            .ok_or(Error::UnknownKey(fingerprint))?;
        pair.decrypt(ciphertext)
    }

    /// Fingerprints held, current first
    pub fn fingerprints(&self) -> Vec<u32> {
        let slots = self.slots.read();
        [slots.current.as_ref(), slots.previous.as_ref()]
            .into_iter()
            .flatten()
            .map(RsaKeyPair::fingerprint)
            .collect()
    }

    /// Persist both slots, private keys wrapped under `wrap_key`
    pub fn save(&self, store: &dyn KeyValueStore, wrap_key: &SecretKey) -> Result<()> {
        let slots = self.slots.read().clone();
        let stored = StoredRing {
            current: slots.current.as_ref().map(|p| p.seal(wrap_key)).transpose()?,
            previous: slots.previous.as_ref().map(|p| p.seal(wrap_key)).transpose()?,
        };
        save_record(store, keys::RSA_KEY_RING, &stored)
    }

    /// Replace both slots with the persisted ring
    ///
    /// Returns `false` if nothing was stored.
    pub fn load(&self, store: &dyn KeyValueStore, wrap_key: &SecretKey) -> Result<bool> {
        let stored: StoredRing = match load_record(store, keys::RSA_KEY_RING)? {
            Some(stored) => stored,
            None => return Ok(false),
        };
        let loaded = Slots {
            current: stored
                .current
                .as_ref()
                .map(|s| RsaKeyPair::unseal(s, wrap_key))
                .transpose()?,
            previous: stored
                .previous
                .as_ref()
                .map(|s| RsaKeyPair::unseal(s, wrap_key))
                .transpose()?,
        };
        *self.slots.write() = loaded;
        Ok(true)
    }
}

impl std::fmt::Debug for RsaKeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.read();
        f.debug_struct("RsaKeyRing")
            .field("current", &slots.current)
            .field("previous", &slots.previous)
            .field("key_bits", &self.key_bits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ring() -> RsaKeyRing {
        RsaKeyRing::new(&KeychainConfig::default())
    }

    #[test]
    fn test_lifetime_too_short() {
        let result = ring().generate(23);
        assert!(matches!(
            result,
            Err(Error::LifetimeTooShort { minimum: 24, requested: 23 })
        ));
    }

    #[test]
    fn test_empty_ring() {
        let ring = ring();
        assert!(matches!(ring.current_public(), Err(Error::NoCurrentKey)));
        assert!(ring.fingerprints().is_empty());
        assert!(matches!(
            ring.decrypt(42, b"x"),
            Err(Error::UnknownKey(42))
        ));
    }

    #[test]
    fn test_rotation_keeps_previous_readable() {
        let ring = ring();
        let first = ring.install(test_keys::primary()).unwrap();
        let sealed = ring.current_public().unwrap().encrypt(b"in flight").unwrap();

        let second = ring.install(test_keys::secondary()).unwrap();
        assert_eq!(ring.fingerprints(), vec![second, first]);
        assert_eq!(ring.current_public().unwrap().fingerprint, second);
        assert_eq!(ring.private_key(first).unwrap().fingerprint(), first);
        assert_eq!(ring.private_key(second).unwrap().fingerprint(), second);
        let unknown = (1u32..).find(|f| *f != first && *f != second).unwrap();
        assert!(ring.private_key(unknown).is_none());

        // Still decryptable through previous
        assert_eq!(&*ring.decrypt(first, &sealed).unwrap(), b"in flight");
        assert!(ring.public_key(first).is_some());

        assert_eq!(ring.retire_previous(), Some(first));
        assert!(ring.public_key(first).is_none());
        assert!(matches!(
            ring.decrypt(first, &sealed),
            Err(Error::UnknownKey(f)) if f == first
        ));
        assert_eq!(ring.retire_previous(), None);
    }

    #[test]
    fn test_third_rotation_discards_oldest() {
        let ring = ring();
        let first = ring.install(test_keys::primary()).unwrap();
        let second = ring.install(test_keys::secondary()).unwrap();
        let third = ring.install(test_keys::tertiary()).unwrap();

        assert_eq!(ring.fingerprints(), vec![third, second]);
        assert!(ring.private_key(first).is_none());
    }

    #[test]
    fn test_rotation_blocked_by_policy() {
        let busy = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&busy);
        let ring = RsaKeyRing::with_policy(
            &KeychainConfig::default(),
            Arc::new(move |_: &RsaKeyPair| !flag.load(Ordering::SeqCst)),
        );

        let first = ring.install(test_keys::primary()).unwrap();
        // No previous yet: nothing to discard, so nothing to block
        let second = ring.install(test_keys::secondary()).unwrap();

        assert!(matches!(
            ring.install(test_keys::tertiary()),
            Err(Error::RotationBlocked)
        ));
        assert!(matches!(ring.generate(24), Err(Error::RotationBlocked)));
        assert_eq!(ring.fingerprints(), vec![second, first]);

        busy.store(false, Ordering::SeqCst);
        let third = ring.install(test_keys::tertiary()).unwrap();
        assert_eq!(ring.fingerprints(), vec![third, second]);
    }

    #[test]
    fn test_purge_dead_previous() {
        let ring = ring();
        let first = ring.install(test_keys::primary()).unwrap();
        ring.install(test_keys::secondary()).unwrap();

        let previous = ring.private_key(first).unwrap();
        assert_eq!(ring.purge_dead_previous_at(previous.expiration()), None);
        let dead_at = previous.expiration() + 24 * 3600 + 1;
        assert_eq!(ring.purge_dead_previous_at(dead_at), Some(first));
        assert_eq!(ring.fingerprints().len(), 1);
    }

    #[test]
    fn test_save_load() {
        let store = MemoryStore::new();
        let wrap = SecretKey::generate();

        let ring = ring();
        let first = ring.install(test_keys::primary()).unwrap();
        let second = ring.install(test_keys::secondary()).unwrap();
        ring.save(&store, &wrap).unwrap();

        let restored = self::ring();
        assert!(restored.load(&store, &wrap).unwrap());
        assert_eq!(restored.fingerprints(), vec![second, first]);

        let empty = MemoryStore::new();
        assert!(!self::ring().load(&empty, &wrap).unwrap());
    }

    #[test]
    fn test_ensure_current_reuses_key() {
        let ring = ring();
        let installed = ring.install(test_keys::primary()).unwrap();
        assert_eq!(ring.ensure_current(24).unwrap().fingerprint, installed);
        assert_eq!(ring.fingerprints().len(), 1);
    }
}
