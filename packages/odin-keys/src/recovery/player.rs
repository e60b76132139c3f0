//! The player side of recovery: hold a shard, release it only when allowed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::dealer::{PlayerKind, ShardPlayerWrapper};
use crate::crypto::{aes_encrypt, AesSealed, SecretKey};
use crate::error::{Error, Result};
use crate::storage::{keys, load_record, save_record, take_record, KeyValueStore};

/// Answers whether a dealer is in an authorized recovery mode
///
/// The decision belongs to the dealer's out-of-band recovery workflow.
/// Players only consult it.
pub trait RecoveryGate: Send + Sync {
    /// Whether `dealer_id` may have its shards released
    fn is_in_recovery(&self, dealer_id: &str) -> bool;
}

impl<F> RecoveryGate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_in_recovery(&self, dealer_id: &str) -> bool {
        self(dealer_id)
    }
}

/// Plaintext under the player's local key
///
/// Release kind and approval live inside the seal so editing storage cannot
/// skip a delegate's approval. `approved` comes last: altering it in the
/// ciphertext garbles the shard bytes before it.
#[derive(Serialize, Deserialize)]
struct HeldShard {
    wrapper: ShardPlayerWrapper,
    approved: bool,
}

/// Holds shards for dealers, double wrapped under a local key
pub struct ShamirPlayer {
    store: Arc<dyn KeyValueStore>,
    local_key: SecretKey,
    gate: Arc<dyn RecoveryGate>,
}

impl ShamirPlayer {
    /// Create a player over its own store
    pub fn new(store: Arc<dyn KeyValueStore>, local_key: SecretKey, gate: Arc<dyn RecoveryGate>) -> Self {
        Self {
            store,
            local_key,
            gate,
        }
    }

    /// Store a shard received from a dealer
    ///
    /// Replaces any shard already held for the same dealer.
    pub fn accept(&self, wrapper: &ShardPlayerWrapper) -> Result<()> {
        let held = HeldShard {
            wrapper: wrapper.clone(),
            approved: false,
        };
        self.save(&wrapper.dealer_id, &held)?;
        tracing::debug!(
            "Holding shard {} for dealer {}",
            wrapper.shard_id,
            wrapper.dealer_id
        );
        Ok(())
    }

    /// Whether a readable shard is held for `dealer_id`
    ///
    /// Opens the local wrap to check it, but releases nothing.
    pub fn has_shard(&self, dealer_id: &str) -> Result<bool> {
        match self.load(dealer_id)? {
            Some(sealed) => Ok(self.open(&sealed, dealer_id).is_ok()),
            None => Ok(false),
        }
    }

    /// Record a delegate's approval to release
    pub fn approve(&self, dealer_id: &str) -> Result<()> {
        let sealed = self.load(dealer_id)?.ok_or(Error::ShardNotFound)?;
        let mut held = self.open(&sealed, dealer_id)?;
        held.approved = true;
        self.save(dealer_id, &held)?;
        tracing::info!("Shard release approved for dealer {}", dealer_id);
        Ok(())
    }

    /// Hand the dealer-encrypted shard back
    ///
    /// Fails closed unless the gate reports the dealer in recovery. Delegate
    /// shards additionally need [`approve`](Self::approve) first.
    pub fn release(&self, dealer_id: &str) -> Result<ShardPlayerWrapper> {
        if !self.gate.is_in_recovery(dealer_id) {
            tracing::warn!("Shard release refused: dealer {} is not in recovery", dealer_id);
            return Err(Error::RecoveryNotAuthorized);
        }

        let sealed = self.load(dealer_id)?.ok_or(Error::ShardNotFound)?;
        let HeldShard { wrapper, approved } = self.open(&sealed, dealer_id)?;
        if wrapper.kind == PlayerKind::Delegate && !approved {
            tracing::debug!("Shard for dealer {} awaits delegate approval", dealer_id);
            return Err(Error::AwaitingApproval);
        }

        tracing::info!("Released shard {} to dealer {}", wrapper.shard_id, dealer_id);
        Ok(wrapper)
    }

    /// Drop the shard held for `dealer_id`; returns whether one existed
    pub fn remove(&self, dealer_id: &str) -> Result<bool> {
        let removed: Option<AesSealed> = take_record(&*self.store, &keys::player_shard(dealer_id))?;
        Ok(removed.is_some())
    }

    fn load(&self, dealer_id: &str) -> Result<Option<AesSealed>> {
        load_record(&*self.store, &keys::player_shard(dealer_id))
    }

    fn save(&self, dealer_id: &str, held: &HeldShard) -> Result<()> {
        let plain = Zeroizing::new(
            bincode::serialize(held).map_err(|e| Error::SerializationError(e.to_string()))?,
        );
        let sealed = aes_encrypt(&plain, &self.local_key)?;
        save_record(&*self.store, &keys::player_shard(dealer_id), &sealed)
    }

    fn open(&self, sealed: &AesSealed, dealer_id: &str) -> Result<HeldShard> {
        let plain = sealed.open(&self.local_key)?;
        let held: HeldShard = bincode::deserialize(&plain).map_err(|_| Error::DecryptionFailed)?;
        if held.wrapper.dealer_id != dealer_id {
            return Err(Error::StorageCorrupted(format!(
                "Shard stored for {} names dealer {}",
                dealer_id, held.wrapper.dealer_id
            )));
        }
        Ok(held)
    }
}
