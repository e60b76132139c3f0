//! # Growing Nonce Tables
//!
//! Anti-replay for messages on an established channel. Each table holds the
//! last accepted nonce and the secret that keys the per-nonce checksum.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          NONCE TABLE CHECK                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  nonce <= last_nonce          → ReplayDetected (warn)                   │
//! │  checksum != HMAC(secret, n)  → ChecksumMismatch (warn)                 │
//! │  otherwise                    → last_nonce = nonce, accept              │
//! │                                                                         │
//! │  checksum = HMAC-SHA256(shared_secret, nonce as u64 LE)[..16]           │
//! │                                                                         │
//! │  Out-of-order delivery is not tolerated.                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::SECRET_LEN;
use crate::crypto::SecretKey;
use crate::error::{Error, Result};
use crate::storage::{keys, load_record, save_record, take_record, KeyValueStore};

type HmacSha256 = Hmac<Sha256>;

/// Stored state of one growing-nonce channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceTable {
    /// Table id
    pub id: Uuid,
    /// Highest nonce accepted so far (0 before the first message)
    pub last_nonce: u64,
    /// Key for the nonce checksum
    pub shared_secret: SecretKey,
}

/// Checksum a sender attaches to `nonce`
pub fn nonce_checksum(shared_secret: &SecretKey, nonce: u64) -> Result<[u8; SECRET_LEN]> {
    let mut mac = HmacSha256::new_from_slice(shared_secret.as_bytes())
        .map_err(|e| Error::Internal(format!("HMAC key rejected: {}", e)))?;
    mac.update(&nonce.to_le_bytes());
    let digest = mac.finalize().into_bytes();

    let mut out = [0u8; SECRET_LEN];
    out.copy_from_slice(&digest[..SECRET_LEN]);
    Ok(out)
}

impl NonceTable {
    /// Start a table at zero
    pub fn new(shared_secret: SecretKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            last_nonce: 0,
            shared_secret,
        }
    }

    /// Check and accept `nonce`, advancing `last_nonce`
    ///
    /// The table is left unchanged on any failure.
    pub fn accept(&mut self, nonce: u64, checksum: &[u8]) -> Result<()> {
        if nonce <= self.last_nonce {
            tracing::warn!(
                "Replay on nonce table {}: nonce {} <= last {}",
                self.id,
                nonce,
                self.last_nonce
            );
            return Err(Error::ReplayDetected {
                nonce,
                last_nonce: self.last_nonce,
            });
        }

        let expected = nonce_checksum(&self.shared_secret, nonce)?;
        if !bool::from(expected.ct_eq(checksum)) {
            tracing::warn!("Bad checksum on nonce table {} for nonce {}", self.id, nonce);
            return Err(Error::ChecksumMismatch);
        }

        self.last_nonce = nonce;
        Ok(())
    }
}

/// Persisted nonce tables with serialized validation
///
/// Load, check and save run under one lock so two messages racing on the
/// same table cannot both be accepted.
pub struct NonceGrowingManager {
    store: Arc<dyn KeyValueStore>,
    lock: Mutex<()>,
}

impl NonceGrowingManager {
    /// Create a manager over a store
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Create and persist a fresh table
    pub fn create_table(&self, shared_secret: SecretKey) -> Result<Uuid> {
        let table = NonceTable::new(shared_secret);
        save_record(&*self.store, &keys::nonce_table(&table.id), &table)?;
        tracing::debug!("Nonce table {} created", table.id);
        Ok(table.id)
    }

    /// Validate `nonce` against table `id`, recording it on success
    pub fn validate(&self, id: &Uuid, nonce: u64, checksum: &[u8]) -> Result<()> {
        let key = keys::nonce_table(id);
        let _guard = self.lock.lock();

        let mut table: NonceTable = load_record(&*self.store, &key)?.ok_or(Error::NonceNotFound)?;
        table.accept(nonce, checksum)?;
        save_record(&*self.store, &key, &table)
    }

    /// The last accepted nonce of a table
    pub fn last_nonce(&self, id: &Uuid) -> Result<u64> {
        let table: NonceTable =
            load_record(&*self.store, &keys::nonce_table(id))?.ok_or(Error::NonceNotFound)?;
        Ok(table.last_nonce)
    }

    /// Drop a table; returns whether it existed
    pub fn remove_table(&self, id: &Uuid) -> Result<bool> {
        let _guard = self.lock.lock();
        let removed: Option<NonceTable> = take_record(&*self.store, &keys::nonce_table(id))?;
        Ok(removed.is_some())
    }
}
