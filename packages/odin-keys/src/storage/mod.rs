//! # Storage Module
//!
//! The key core persists records through a minimal key/value contract. The
//! host supplies the engine; this crate ships an in-memory store for tests
//! and embedding, and an encrypting wrapper for any store.
//!
//! ## What Gets Stored
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           STORED RECORDS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  odin.login.keys            LoginKeyRecord (DeK ⊕ KeK, salts, hash)     │
//! │  odin.rsa.ring              current + previous RSA keys (wrapped)       │
//! │  odin.nonce.<id>            pending NoncePackage (consumed once)        │
//! │  odin.nonce-table.<id>      growing-nonce table                         │
//! │  odin.app.<app id>          ApplicationRecord (AppDeK ⊕ AppKeK, ...)    │
//! │  odin.app-index             registered application ids                  │
//! │  odin.token.<id>            ServerTokenRecord (half key, expiry)        │
//! │  odin.shamir.dealer.<id>    sealed dealer package                       │
//! │  odin.shamir.player.<id>    player shard (double wrapped)               │
//! │                                                                         │
//! │  No record ever holds a bare KeK, DeK, AppKeK or AppDeK.                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Records are bincode-encoded. The store sees opaque bytes.

mod memory;
mod sealed;

pub use memory::MemoryStore;
pub use sealed::SealedStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Key/value persistence contract
///
/// `delete` returns the value it removed. Implementations must make that
/// read-and-remove atomic per key: when two callers race to delete the same
/// key, exactly one of them sees `Some`. Nonce packages rely on this to be
/// consumed exactly once.
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace a value
    fn upsert(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a value, returning what was there
    fn delete(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for &T {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn upsert(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).upsert(key, value)
    }

    fn delete(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).delete(key)
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn upsert(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).upsert(key, value)
    }

    fn delete(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).delete(key)
    }
}

/// Key names for stored records
pub mod keys {
    use uuid::Uuid;

    /// The owner's login key record
    pub const LOGIN_KEYS: &str = "odin.login.keys";

    /// The RSA key ring
    pub const RSA_KEY_RING: &str = "odin.rsa.ring";

    /// Ids of registered applications
    pub const APPLICATION_INDEX: &str = "odin.app-index";

    /// A pending login nonce package
    pub fn nonce_package(id: &Uuid) -> String {
        format!("odin.nonce.{}", id)
    }

    /// A growing-nonce table
    pub fn nonce_table(id: &Uuid) -> String {
        format!("odin.nonce-table.{}", id)
    }

    /// An application registration
    pub fn application(app_id: &str) -> String {
        format!("odin.app.{}", app_id)
    }

    /// A server-side session token
    pub fn token(id: &Uuid) -> String {
        format!("odin.token.{}", id)
    }

    /// A dealer's sealed shard package
    pub fn dealer_package(dealer_id: &str) -> String {
        format!("odin.shamir.dealer.{}", dealer_id)
    }

    /// A player's stored shard for one dealer
    pub fn player_shard(dealer_id: &str) -> String {
        format!("odin.shamir.player.{}", dealer_id)
    }
}

/// Read and decode a record
pub fn load_record<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a record
pub fn save_record<T: Serialize>(store: &dyn KeyValueStore, key: &str, record: &T) -> Result<()> {
    let bytes =
        bincode::serialize(record).map_err(|e| Error::SerializationError(e.to_string()))?;
    store.upsert(key, &bytes)
}

/// Remove a record, decoding what was there
pub fn take_record<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.delete(key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::StorageCorrupted(e.to_string()))
}
