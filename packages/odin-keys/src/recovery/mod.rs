//! # Shamir Recovery
//!
//! Recovers a lost master secret from a quorum of players.
//!
//! ## Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SHARD DISTRIBUTION                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  DEALER                                   PLAYER                        │
//! │  ──────                                   ──────                        │
//! │  distribution key D (random)                                            │
//! │  store AES(secret, D)                                                   │
//! │  split(D, n, k) → shard[1..n]                                           │
//! │  per shard: wrap key W, IV                                              │
//! │    keep {shardId, player, W, IV}                                        │
//! │    send {shardId, AES(shard, W)} ──────► store AES(received, local key) │
//! │  package sealed under package key                                       │
//! │                                                                         │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                             RECOVERY                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │                                           gate.is_in_recovery(dealer)?  │
//! │                                             no  → RecoveryNotAuthorized │
//! │                                           delegate and not approved?    │
//! │                                             yes → AwaitingApproval      │
//! │  unwrap with W, IV  ◄──────────────────── {shardId, AES(shard, W)}      │
//! │  reconstruct(k shards) → D                                              │
//! │  AES⁻¹(secret, D), clear package                                        │
//! │                                                                         │
//! │  Dealer storage alone: wrap keys but no shards.                         │
//! │  Player storage alone: shards it cannot read.                           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod dealer;
mod player;
mod shamir;

pub use dealer::{
    DealerPackage, Player, PlayerKind, ShamirDealer, ShardDealerWrapper, ShardPlayerWrapper,
};
pub use player::{RecoveryGate, ShamirPlayer};
pub use shamir::{reconstruct, split, ShamirShard};
