//! # Login Key Hierarchy
//!
//! The owner's DeK, stored only as `DeK ⊕ KeK`.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          LOGIN KEY RECORD                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  password ──PBKDF2(saltKek)──► KeK ─┐                                   │
//! │                                     ├─ XOR ─► DeK                       │
//! │  stored xorEncryptedDek ────────────┘                                   │
//! │                                                                         │
//! │  stored:  saltPassword, saltKek, hashPassword, DeK ⊕ KeK                │
//! │  never:   KeK, DeK, password                                            │
//! │                                                                         │
//! │  change_password() re-seals every application's AppKeK under the new    │
//! │  KeK before the record is replaced.                                     │
//! │                                                                         │
//! │  unlock() does NOT check the KeK. A wrong KeK gives a wrong DeK,        │
//! │  which only shows up when something sealed under the DeK fails to       │
//! │  decrypt. There is no oracle for "is this KeK right".                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::app_tokens::rewrap_applications;
use super::nonce::VerifiedReply;
use crate::config::SECRET_LEN;
use crate::crypto::SecretKey;
use crate::error::{Error, Result};
use crate::storage::{keys, load_record, save_record, KeyValueStore};

/// The durable owner record
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginKeyRecord {
    /// Salt for the password hash
    pub salt_password: [u8; SECRET_LEN],
    /// Salt for the KeK
    pub salt_kek: [u8; SECRET_LEN],
    /// PBKDF2(password, saltPassword)
    pub hash_password: [u8; SECRET_LEN],
    /// DeK ⊕ KeK
    pub xor_encrypted_dek: [u8; SECRET_LEN],
}

impl std::fmt::Debug for LoginKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginKeyRecord").finish_non_exhaustive()
    }
}

impl LoginKeyRecord {
    /// Build a record around a fresh random DeK
    pub fn create(reply: &VerifiedReply) -> Self {
        Self::wrap(reply, &SecretKey::generate())
    }

    /// Build a record that wraps an existing DeK under the reply's KeK
    fn wrap(reply: &VerifiedReply, dek: &SecretKey) -> Self {
        Self {
            salt_password: reply.package.salt_password,
            salt_kek: reply.package.salt_kek,
            hash_password: *reply.hashed_password.as_bytes(),
            xor_encrypted_dek: *dek.xor(&reply.kek).as_bytes(),
        }
    }

    /// Recover the DeK
    ///
    /// Never fails and never validates `kek`.
    pub fn unlock(&self, kek: &SecretKey) -> SecretKey {
        SecretKey::from_bytes(self.xor_encrypted_dek).xor(kek)
    }

    /// Re-wrap the DeK under a new KeK, keeping salts and hash
    ///
    /// Returns a new record; `self` is untouched so the caller can swap it in
    /// whole or not at all.
    pub fn change_kek(&self, old_kek: &SecretKey, new_kek: &SecretKey) -> Self {
        let dek = self.unlock(old_kek);
        Self {
            xor_encrypted_dek: *dek.xor(new_kek).as_bytes(),
            ..self.clone()
        }
    }

    /// Re-wrap the DeK for a new password
    ///
    /// Takes the new salts, hash and KeK from a reply verified against a
    /// fresh challenge.
    pub fn rekey(&self, old_kek: &SecretKey, reply: &VerifiedReply) -> Self {
        let dek = self.unlock(old_kek);
        Self::wrap(reply, &dek)
    }
}

/// Stored owner key record
pub struct LoginKeyHierarchy {
    store: Arc<dyn KeyValueStore>,
    writes: Arc<Mutex<()>>,
}

impl LoginKeyHierarchy {
    /// Create over a store
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_write_lock(store, Arc::new(Mutex::new(())))
    }

    /// Create over a store, serializing record writes with `writes`
    pub(crate) fn with_write_lock(store: Arc<dyn KeyValueStore>, writes: Arc<Mutex<()>>) -> Self {
        Self { store, writes }
    }

    /// Whether the owner record exists
    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.store.get(keys::LOGIN_KEYS)?.is_some())
    }

    /// Create and persist the owner record from a first verified reply
    pub fn initialize(&self, reply: &VerifiedReply) -> Result<LoginKeyRecord> {
        let _guard = self.writes.lock();
        if self.is_initialized()? {
            return Err(Error::AlreadyInitialized);
        }
        let record = LoginKeyRecord::create(reply);
        save_record(&*self.store, keys::LOGIN_KEYS, &record)?;
        tracing::info!("Login keys initialized");
        Ok(record)
    }

    /// The stored owner record
    pub fn record(&self) -> Result<LoginKeyRecord> {
        load_record(&*self.store, keys::LOGIN_KEYS)?.ok_or(Error::NotInitialized)
    }

    /// Recover the DeK from the stored record
    pub fn unlock(&self, kek: &SecretKey) -> Result<SecretKey> {
        Ok(self.record()?.unlock(kek))
    }

    /// Replace the stored record for a new password
    ///
    /// `old_kek` must come from a login verified against the current record,
    /// `reply` from a challenge issued with fresh salts.
    ///
    /// Registered applications are re-sealed under the new KeK. If any of
    /// them does not open with `old_kek`, nothing is written.
    pub fn change_password(&self, old_kek: &SecretKey, reply: &VerifiedReply) -> Result<LoginKeyRecord> {
        let _guard = self.writes.lock();
        let updated = self.record()?.rekey(old_kek, reply);
        let apps = rewrap_applications(&*self.store, old_kek, &reply.kek)?;

        for app in &apps {
            save_record(&*self.store, &keys::application(&app.app_id), app)?;
        }
        save_record(&*self.store, keys::LOGIN_KEYS, &updated)?;
        tracing::info!("Login password changed, {} applications re-sealed", apps.len());
        Ok(updated)
    }
}
