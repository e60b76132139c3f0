//! # Login Demo
//!
//! Walks the challenge/response login from first password to an
//! application session.
//!
//! ## Run
//!
//! ```bash
//! RUST_LOG=odin_keys=debug cargo run --example login_demo
//! ```

use std::sync::Arc;

use odin_keys::{Keychain, KeychainConfig, MemoryStore, PasswordReply, SecretKey};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Odin Keys: Login Demo ===\n");

    let config = KeychainConfig {
        pbkdf2_iterations: 10_000,
        ..Default::default()
    };
    let iterations = config.pbkdf2_iterations;
    let keychain =
        Keychain::new(Arc::new(MemoryStore::new()), config).expect("Failed to build keychain");

    // Step 1: Server key
    println!("Step 1: Generating the server RSA key...");
    let public = keychain.bootstrap().expect("Failed to generate RSA key");
    println!("  Fingerprint: {:08x}", public.fingerprint);
    println!();

    // Step 2: Challenge
    println!("Step 2: Issuing a login challenge...");
    let package = keychain.begin_login().expect("Failed to issue challenge");
    println!("  Nonce id:      {}", package.id);
    println!("  Salt password: {}", hex::encode(package.salt_password));
    println!("  Salt KeK:      {}", hex::encode(package.salt_kek));
    println!();

    println!("  ┌─────────────────────────────────────────────────────────────┐");
    println!("  │                      CLIENT SIDE                            │");
    println!("  ├─────────────────────────────────────────────────────────────┤");
    println!("  │  hashedPassword      = PBKDF2(password, saltPassword)       │");
    println!("  │  kek                 = PBKDF2(password, saltKek)            │");
    println!("  │  nonceHashedPassword = PBKDF2(hashedPassword, nonce)        │");
    println!("  │  payload             = RSA({{hashedPassword, kek, secret}})   │");
    println!("  └─────────────────────────────────────────────────────────────┘");
    println!();

    // Step 3: Client reply
    println!("Step 3: Client computes its reply...");
    let reply = PasswordReply::compute(
        b"correct-horse",
        &package,
        &public,
        &SecretKey::generate(),
        iterations,
    )
    .expect("Failed to compute reply");
    println!("  RSA payload: {} bytes", reply.rsa_encrypted_payload.len());
    println!();

    // Step 4: Verify and open a session
    println!("Step 4: Server verifies and opens an owner session...");
    let (owner_token, record) = keychain
        .complete_login(&reply)
        .expect("Login should succeed");
    println!("  Session id: {}", record.id);
    println!("  Cookie:     {}...", &owner_token.to_cookie()[..16]);
    println!();

    // Step 5: Replay
    println!("Step 5: Replaying the same reply...");
    match keychain.complete_login(&reply) {
        Ok(_) => println!("  Unexpectedly accepted!"),
        Err(e) => println!("  Rejected: {} (code {})", e, e.code()),
    }
    println!();

    // Step 6: Application
    println!("Step 6: Registering an application and authorizing it...");
    let login_kek = keychain
        .apps()
        .resolve_session_key(&owner_token)
        .expect("Owner session should resolve");
    keychain
        .apps()
        .create_application("chat", &login_kek)
        .expect("Failed to register application");
    let (app_token, _) = keychain
        .apps()
        .authorize_application("chat", &login_kek, None)
        .expect("Failed to authorize application");

    let via_session = keychain
        .apps()
        .resolve_app_dek(&app_token)
        .expect("App session should resolve");
    let via_owner = keychain
        .apps()
        .master_recover_app_dek("chat", &login_kek)
        .expect("Owner should recover AppDeK");
    println!("  AppDeK matches owner recovery: {}", via_session.ct_eq(&via_owner));
    println!();

    println!("=== Demo Complete ===");
}
