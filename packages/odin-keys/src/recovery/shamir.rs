//! Threshold split and reconstruction over GF(256).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sharks::{Share, Sharks};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::validate_threshold;
use crate::error::{Error, Result};

/// One share of a split secret
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ShamirShard {
    /// Evaluation point (1..=255)
    pub index: u8,
    /// Share bytes, as long as the secret
    pub data: Vec<u8>,
}

impl ShamirShard {
    /// `index || data`
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(1 + self.data.len()));
        bytes.push(self.index);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Parse `index || data`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.split_first() {
            Some((&index, data)) if index != 0 && !data.is_empty() => Ok(Self {
                index,
                data: data.to_vec(),
            }),
            _ => Err(Error::MalformedPayload("Invalid shard encoding".into())),
        }
    }

    fn to_share(&self) -> Result<Share> {
        Share::try_from(self.to_bytes().as_slice())
            .map_err(|e| Error::MalformedPayload(format!("Invalid shard: {}", e)))
    }

    fn from_share(share: &Share) -> Result<Self> {
        let bytes = Zeroizing::new(Vec::<u8>::from(share));
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for ShamirShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShamirShard")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Split `secret` into `total` shards, any `threshold` of which rebuild it
pub fn split(secret: &[u8], total: usize, threshold: usize) -> Result<Vec<ShamirShard>> {
    validate_threshold(total, threshold)?;
    if secret.is_empty() {
        return Err(Error::InvalidConfig("Cannot split an empty secret".into()));
    }

    let sharks = Sharks(threshold as u8);
    let shards = sharks
        .dealer(secret)
        .take(total)
        .map(|share| ShamirShard::from_share(&share))
        .collect::<Result<Vec<_>>>()?;

    if shards.len() != total {
        return Err(Error::Internal(format!(
            "Expected {} shards, dealer produced {}",
            total,
            shards.len()
        )));
    }
    Ok(shards)
}

/// Rebuild a secret from at least `threshold` distinct shards
///
/// Order does not matter. A shard repeated verbatim counts once; two
/// different shards with the same index are rejected.
pub fn reconstruct(shards: &[ShamirShard], threshold: usize) -> Result<Zeroizing<Vec<u8>>> {
    if threshold < 2 || threshold > usize::from(u8::MAX) {
        return Err(Error::InvalidThreshold {
            threshold,
            total: shards.len(),
        });
    }

    let mut distinct: BTreeMap<u8, &ShamirShard> = BTreeMap::new();
    for shard in shards {
        match distinct.get(&shard.index) {
            Some(existing) if *existing != shard => {
                return Err(Error::DuplicateShardIndex(shard.index));
            }
            Some(_) => {}
            None => {
                distinct.insert(shard.index, shard);
            }
        }
    }

    if distinct.len() < threshold {
        return Err(Error::InsufficientShards {
            required: threshold,
            provided: distinct.len(),
        });
    }

    let shares = distinct
        .values()
        .map(|shard| shard.to_share())
        .collect::<Result<Vec<_>>>()?;

    Sharks(threshold as u8)
        .recover(&shares)
        .map(Zeroizing::new)
        .map_err(|e| Error::MalformedPayload(format!("Shard recovery failed: {}", e)))
}
