//! # Recovery Demo
//!
//! Splits a DeK 3-of-5 across automatic and delegate players, then
//! recovers it once the dealer enters recovery mode.
//!
//! ## Run
//!
//! ```bash
//! RUST_LOG=odin_keys=debug cargo run --example recovery_demo
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use odin_keys::recovery::{Player, PlayerKind, ShamirDealer, ShamirPlayer};
use odin_keys::{MemoryStore, SecretKey};
use tracing_subscriber::EnvFilter;

const DEALER: &str = "owner.example";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Odin Keys: Shamir Recovery Demo ===\n");

    let dek = SecretKey::generate();
    println!("Secret to protect: {}...", &hex::encode(dek.as_bytes())[..8]);
    println!();

    // Step 1: Deal
    println!("Step 1: Dealing 5 shards, threshold 3...");
    let dealer = ShamirDealer::new(DEALER, Arc::new(MemoryStore::new()), SecretKey::generate());
    let roster = vec![
        Player::automatic("vault-1.example"),
        Player::automatic("vault-2.example"),
        Player::automatic("vault-3.example"),
        Player::delegate("alex.example"),
        Player::delegate("sam.example"),
    ];
    let outgoing = dealer
        .configure(dek.as_bytes(), &roster, 3)
        .expect("Failed to configure shards");

    let in_recovery = Arc::new(AtomicBool::new(false));
    let players: Vec<(Player, ShamirPlayer)> = roster
        .iter()
        .zip(&outgoing)
        .map(|(who, wrapper)| {
            let flag = Arc::clone(&in_recovery);
            let player = ShamirPlayer::new(
                Arc::new(MemoryStore::new()),
                SecretKey::generate(),
                Arc::new(move |_: &str| flag.load(Ordering::SeqCst)),
            );
            player.accept(wrapper).expect("Player failed to store shard");
            println!("  {} holds shard {}", who.id, wrapper.shard_id);
            (who.clone(), player)
        })
        .collect();
    println!();

    // Step 2: Gate closed
    println!("Step 2: Asking for a shard outside recovery mode...");
    match players[0].1.release(DEALER) {
        Ok(_) => println!("  Unexpectedly released!"),
        Err(e) => println!("  Refused: {}", e),
    }
    println!();

    // Step 3: Recovery
    println!("Step 3: Dealer enters recovery mode...");
    in_recovery.store(true, Ordering::SeqCst);

    let mut released = Vec::new();
    for (who, player) in &players {
        if released.len() == 3 {
            break;
        }
        if who.kind == PlayerKind::Delegate {
            match player.release(DEALER) {
                Err(e) => println!("  {}: {}, approving", who.id, e),
                Ok(_) => println!("  {}: released without approval?", who.id),
            }
            player.approve(DEALER).expect("Approval failed");
        }
        if who.id == "vault-2.example" {
            println!("  {}: offline", who.id);
            continue;
        }
        released.push(player.release(DEALER).expect("Release failed"));
        println!("  {}: released", who.id);
    }
    println!();

    // Step 4: Reconstruct
    println!("Step 4: Reconstructing from {} shards...", released.len());
    let recovered = dealer.recover(&released).expect("Recovery failed");
    println!("  Recovered matches original: {}", &recovered[..] == dek.as_bytes());
    println!("  Dealer package cleared: {}", !dealer.is_configured().unwrap_or(true));
    println!();

    println!("=== Demo Complete ===");
}
