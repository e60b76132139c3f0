//! The dealer side of recovery: split, wrap, distribute, reconstruct.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::shamir::{reconstruct, split, ShamirShard};
use crate::config::{validate_threshold, MIN_SHAMIR_PLAYERS, SECRET_LEN};
use crate::crypto::{aes_decrypt, aes_encrypt, AesSealed, SecretKey};
use crate::error::{Error, Result};
use crate::storage::{keys, load_record, save_record, take_record, KeyValueStore};
use crate::time::now_timestamp;

/// How a player releases its shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerKind {
    /// A server that releases as soon as the dealer is in recovery
    Automatic,
    /// A person who must approve each release
    Delegate,
}

/// A shard holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Player identity
    pub id: String,
    /// Release behaviour
    pub kind: PlayerKind,
}

impl Player {
    /// An automatic player
    pub fn automatic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PlayerKind::Automatic,
        }
    }

    /// A delegate player
    pub fn delegate(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PlayerKind::Delegate,
        }
    }
}

/// What the dealer keeps for one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDealerWrapper {
    /// Shard id, shared with the player
    pub shard_id: Uuid,
    /// Who holds the shard
    pub player: Player,
    /// Key the shard was encrypted under
    pub wrap_key: SecretKey,
    /// IV the shard was encrypted with
    pub iv: [u8; SECRET_LEN],
    /// SHA-256 of the shard, checked when it comes back
    pub shard_digest: [u8; 32],
}

/// What a player receives, and hands back during recovery
///
/// The IV and key stay with the dealer, so the player cannot read the shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlayerWrapper {
    /// Shard id
    pub shard_id: Uuid,
    /// Dealer identity
    pub dealer_id: String,
    /// Release behaviour the dealer assigned
    pub kind: PlayerKind,
    /// Shard encrypted under the dealer's wrap key
    pub dealer_encrypted_shard: Vec<u8>,
}

/// The dealer's full recovery configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct DealerPackage {
    /// Dealer identity
    pub dealer_id: String,
    /// Shards needed (k)
    pub threshold: usize,
    /// One wrapper per player
    pub wrappers: Vec<ShardDealerWrapper>,
    /// The protected secret, encrypted under the split distribution key
    pub encrypted_secret: AesSealed,
    /// Unix timestamp of configuration
    pub created: i64,
}

impl DealerPackage {
    /// Players and their shard ids, without keys
    pub fn players(&self) -> Vec<(Uuid, Player)> {
        self.wrappers
            .iter()
            .map(|w| (w.shard_id, w.player.clone()))
            .collect()
    }
}

/// Splits a secret across players and rebuilds it from released shards
///
/// The package at rest is encrypted under `package_key`, which must differ
/// from every per-shard wrap key (each of those is freshly generated).
pub struct ShamirDealer {
    dealer_id: String,
    store: Arc<dyn KeyValueStore>,
    package_key: SecretKey,
}

impl ShamirDealer {
    /// Create a dealer over its own store
    pub fn new(dealer_id: impl Into<String>, store: Arc<dyn KeyValueStore>, package_key: SecretKey) -> Self {
        Self {
            dealer_id: dealer_id.into(),
            store,
            package_key,
        }
    }

    /// Dealer identity
    pub fn dealer_id(&self) -> &str {
        &self.dealer_id
    }

    /// Split `secret` for `players`, returning what to send to each
    ///
    /// A fresh distribution key is split rather than the secret itself; the
    /// secret is stored encrypted under it. Replaces any earlier package.
    pub fn configure(
        &self,
        secret: &[u8],
        players: &[Player],
        threshold: usize,
    ) -> Result<Vec<ShardPlayerWrapper>> {
        validate_players(players)?;
        validate_threshold(players.len(), threshold)?;

        let distribution_key = SecretKey::generate();
        let shards = split(distribution_key.as_bytes(), players.len(), threshold)?;

        let mut wrappers = Vec::with_capacity(players.len());
        let mut outgoing = Vec::with_capacity(players.len());
        for (shard, player) in shards.iter().zip(players) {
            let wrap_key = SecretKey::generate();
            let sealed = aes_encrypt(&shard.to_bytes(), &wrap_key)?;
            let shard_id = Uuid::new_v4();

            outgoing.push(ShardPlayerWrapper {
                shard_id,
                dealer_id: self.dealer_id.clone(),
                kind: player.kind,
                dealer_encrypted_shard: sealed.ciphertext,
            });
            wrappers.push(ShardDealerWrapper {
                shard_id,
                player: player.clone(),
                wrap_key,
                iv: sealed.iv,
                shard_digest: Sha256::digest(&shard.to_bytes()[..]).into(),
            });
        }

        let package = DealerPackage {
            dealer_id: self.dealer_id.clone(),
            threshold,
            wrappers,
            encrypted_secret: aes_encrypt(secret, &distribution_key)?,
            created: now_timestamp(),
        };
        self.save_package(&package)?;

        tracing::info!(
            "Dealer {} split recovery secret {} of {}",
            self.dealer_id,
            threshold,
            players.len()
        );
        Ok(outgoing)
    }

    /// Whether a package is configured
    pub fn is_configured(&self) -> Result<bool> {
        Ok(self.store.get(&keys::dealer_package(&self.dealer_id))?.is_some())
    }

    /// Load and decrypt the package
    pub fn package(&self) -> Result<DealerPackage> {
        let sealed: AesSealed = load_record(&*self.store, &keys::dealer_package(&self.dealer_id))?
            .ok_or(Error::ShardNotFound)?;
        let plain = sealed.open(&self.package_key)?;
        bincode::deserialize(&plain).map_err(|e| Error::StorageCorrupted(e.to_string()))
    }

    /// Unwrap one shard a player handed back
    pub fn unwrap_shard(&self, package: &DealerPackage, released: &ShardPlayerWrapper) -> Result<ShamirShard> {
        let wrapper = package
            .wrappers
            .iter()
            .find(|w| w.shard_id == released.shard_id)
            .ok_or(Error::ShardNotFound)?;
        let plain = aes_decrypt(&released.dealer_encrypted_shard, &wrapper.wrap_key, &wrapper.iv)?;
        let digest: [u8; 32] = Sha256::digest(&plain[..]).into();
        // CBC garbles a tampered block but can still unpad cleanly.
        if !bool::from(digest[..].ct_eq(&wrapper.shard_digest[..])) {
            return Err(Error::DecryptionFailed);
        }
        ShamirShard::from_bytes(&plain).map_err(|_| Error::DecryptionFailed)
    }

    /// Rebuild the secret from released shards and clear the package
    ///
    /// Shards that are unknown, stale or fail to unwrap are skipped. The
    /// call fails with [`Error::InsufficientShards`] only when fewer than
    /// the threshold remain.
    pub fn recover(&self, released: &[ShardPlayerWrapper]) -> Result<Zeroizing<Vec<u8>>> {
        let package = self.package()?;
        let mut seen = HashSet::new();
        let shards: Vec<ShamirShard> = released
            .iter()
            .filter(|r| r.dealer_id == self.dealer_id && seen.insert(r.shard_id))
            .filter_map(|r| match self.unwrap_shard(&package, r) {
                Ok(shard) => Some(shard),
                Err(e) => {
                    tracing::warn!(
                        "Dealer {} skipped released shard {}: {}",
                        self.dealer_id,
                        r.shard_id,
                        e
                    );
                    None
                }
            })
            .collect();

        let key_bytes = reconstruct(&shards, package.threshold)?;
        let distribution_key = SecretKey::from_slice(&key_bytes)?;
        let secret = package
            .encrypted_secret
            .open(&distribution_key)
            .map_err(|e| {
                tracing::warn!("Dealer {} reconstructed a wrong key", self.dealer_id);
                e
            })?;

        self.clear()?;
        tracing::info!(
            "Dealer {} recovered secret from {} shards",
            self.dealer_id,
            shards.len()
        );
        Ok(secret)
    }

    /// Drop the package; returns whether one existed
    pub fn clear(&self) -> Result<bool> {
        let removed: Option<AesSealed> =
            take_record(&*self.store, &keys::dealer_package(&self.dealer_id))?;
        Ok(removed.is_some())
    }

    fn save_package(&self, package: &DealerPackage) -> Result<()> {
        let plain = Zeroizing::new(
            bincode::serialize(package).map_err(|e| Error::SerializationError(e.to_string()))?,
        );
        let sealed = aes_encrypt(&plain, &self.package_key)?;
        save_record(&*self.store, &keys::dealer_package(&self.dealer_id), &sealed)
    }
}

fn validate_players(players: &[Player]) -> Result<()> {
    if players.len() < MIN_SHAMIR_PLAYERS {
        return Err(Error::InvalidConfig(format!(
            "At least {} players are required, got {}",
            MIN_SHAMIR_PLAYERS,
            players.len()
        )));
    }
    let mut seen = HashSet::new();
    for player in players {
        if !seen.insert(player.id.as_str()) {
            return Err(Error::InvalidConfig(format!("Player {} listed twice", player.id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn players() -> Vec<Player> {
        vec![
            Player::automatic("frodo.example"),
            Player::automatic("sam.example"),
            Player::delegate("merry.example"),
            Player::delegate("pippin.example"),
            Player::automatic("bilbo.example"),
        ]
    }

    fn dealer() -> (ShamirDealer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            ShamirDealer::new("owner.example", store.clone(), SecretKey::generate()),
            store,
        )
    }

    #[test]
    fn test_configure_and_recover() {
        let (dealer, _) = dealer();
        let outgoing = dealer.configure(b"recovery secret!", &players(), 3).unwrap();
        assert_eq!(outgoing.len(), 5);
        assert_eq!(outgoing[2].kind, PlayerKind::Delegate);

        let released = [outgoing[4].clone(), outgoing[0].clone(), outgoing[2].clone()];
        let secret = dealer.recover(&released).unwrap();
        assert_eq!(&secret[..], b"recovery secret!");
        assert!(!dealer.is_configured().unwrap());
    }

    #[test]
    fn test_recover_needs_threshold() {
        let (dealer, _) = dealer();
        let outgoing = dealer.configure(b"recovery secret!", &players(), 3).unwrap();

        assert!(matches!(
            dealer.recover(&outgoing[..2]),
            Err(Error::InsufficientShards { required: 3, provided: 2 })
        ));
        assert!(dealer.is_configured().unwrap());
    }

    #[test]
    fn test_package_encrypted_at_rest() {
        let (dealer, store) = dealer();
        let outgoing = dealer.configure(b"recovery secret!", &players(), 3).unwrap();

        let package = dealer.package().unwrap();
        assert_eq!(package.players().len(), 5);
        assert_eq!(package.wrappers[0].shard_id, outgoing[0].shard_id);
        assert!(!package.wrappers[0].wrap_key.ct_eq(&package.wrappers[1].wrap_key));

        let other = ShamirDealer::new("owner.example", store, SecretKey::generate());
        assert!(other.package().is_err());
    }

    #[test]
    fn test_player_cannot_read_shard() {
        let (dealer, _) = dealer();
        let outgoing = dealer.configure(b"recovery secret!", &players(), 3).unwrap();
        let package = dealer.package().unwrap();

        let mut tampered = outgoing[0].clone();
        tampered.shard_id = outgoing[1].shard_id;
        match dealer.unwrap_shard(&package, &tampered) {
            Err(Error::DecryptionFailed) => {}
            Ok(shard) => {
                let genuine = dealer.unwrap_shard(&package, &outgoing[1]).unwrap();
                assert_ne!(shard, genuine);
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn test_bad_shards_skipped() {
        let (dealer, _) = dealer();
        let outgoing = dealer.configure(b"recovery secret!", &players(), 3).unwrap();

        let mut stray = outgoing[0].clone();
        stray.shard_id = Uuid::new_v4();
        let mut corrupt = outgoing[1].clone();
        corrupt.dealer_encrypted_shard[0] ^= 0xff;

        let released = [
            stray,
            corrupt,
            outgoing[2].clone(),
            outgoing[3].clone(),
            outgoing[4].clone(),
        ];
        let secret = dealer.recover(&released).unwrap();
        assert_eq!(&secret[..], b"recovery secret!");
    }

    #[test]
    fn test_bad_shards_do_not_count() {
        let (dealer, _) = dealer();
        let outgoing = dealer.configure(b"recovery secret!", &players(), 3).unwrap();

        let mut corrupt = outgoing[0].clone();
        corrupt.dealer_encrypted_shard[0] ^= 0xff;
        let released = [
            corrupt,
            outgoing[1].clone(),
            outgoing[2].clone(),
            outgoing[2].clone(),
        ];
        assert!(matches!(
            dealer.recover(&released),
            Err(Error::InsufficientShards { required: 3, provided: 2 })
        ));
        assert!(dealer.is_configured().unwrap());
    }

    #[test]
    fn test_corrupt_shard_fails_digest() {
        let (dealer, _) = dealer();
        let outgoing = dealer.configure(b"recovery secret!", &players(), 3).unwrap();
        let package = dealer.package().unwrap();

        let mut corrupt = outgoing[0].clone();
        corrupt.dealer_encrypted_shard[0] ^= 0xff;
        assert!(matches!(
            dealer.unwrap_shard(&package, &corrupt),
            Err(Error::DecryptionFailed)
        ));
        assert!(dealer.unwrap_shard(&package, &outgoing[0]).is_ok());
    }

    #[test]
    fn test_player_validation() {
        let (dealer, _) = dealer();
        let all = players();
        assert!(matches!(
            dealer.configure(b"secret", &all[..2], 2),
            Err(Error::InvalidConfig(_))
        ));

        let mut twice = players();
        twice[1] = Player::automatic("frodo.example");
        assert!(matches!(
            dealer.configure(b"secret", &twice, 3),
            Err(Error::InvalidConfig(_))
        ));

        assert!(matches!(
            dealer.configure(b"secret", &players(), 1),
            Err(Error::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_no_package() {
        let (dealer, _) = dealer();
        assert!(matches!(dealer.package(), Err(Error::ShardNotFound)));
        assert!(!dealer.clear().unwrap());
    }
}
