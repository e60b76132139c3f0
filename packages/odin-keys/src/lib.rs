//! # Odin Keys
//!
//! Identity-key and authentication core for a self-hosted identity server.
//! Turns the owner's password into a layered key hierarchy, runs a
//! replay-resistant challenge/response login, derives per-application and
//! per-session keys, wraps payloads for host-to-host transit, and recovers
//! a lost master secret from a quorum of Shamir players.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          ODIN KEYS MODULES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐    │
//! │  │   Auth      │  │  Key Ring   │  │  Transit    │  │  Recovery    │    │
//! │  │             │  │             │  │             │  │              │    │
//! │  │ - Nonces    │  │ - RSA pairs │  │ - Seal      │  │ - Split      │    │
//! │  │ - Login KeK │  │ - Rotation  │  │ - Open      │  │ - Dealer     │    │
//! │  │ - App keys  │  │ - Purge     │  │ - Reseal    │  │ - Players    │    │
//! │  │ - Sessions  │  │             │  │             │  │              │    │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └──────┬───────┘    │
//! │         │                │                │                │            │
//! │         └────────────────┴────────────────┴────────────────┘            │
//! │                                   │                                     │
//! │  ┌──────────────────────────┐     │     ┌──────────────────────────┐    │
//! │  │         Crypto           │◄────┴────►│         Storage          │    │
//! │  │                          │           │                          │    │
//! │  │ - XOR split / join       │           │ - KeyValueStore contract │    │
//! │  │ - AES-128-CBC            │           │ - In-memory store        │    │
//! │  │ - PBKDF2-HMAC-SHA256     │           │ - AES-GCM sealed store   │    │
//! │  │ - RSA-OAEP               │           │                          │    │
//! │  └──────────────────────────┘           └──────────────────────────┘    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`config`] - Iteration counts, key sizes, TTLs and Shamir thresholds
//! - [`crypto`] - Envelope primitives and RSA key pairs
//! - [`keyring`] - Current/previous RSA key rotation
//! - [`storage`] - Record persistence contract and stores
//! - [`auth`] - Login challenge, owner keys, application keys, sessions
//! - [`transit`] - Hybrid RSA/AES packets
//! - [`recovery`] - Shamir dealer and players
//!
//! ## Security Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SECURITY LAYERS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Layer 1: Password never leaves the client                              │
//! │  ─────────────────────────────────────────                              │
//! │  The client proves knowledge of the password hash against a one-time    │
//! │  nonce. The KeK travels only inside an RSA-OAEP payload.                │
//! │                                                                         │
//! │  Layer 2: No bare keys at rest                                          │
//! │  ─────────────────────────────                                          │
//! │  DeK and AppDeK are stored XOR-wrapped, AppKeK AES-wrapped under the    │
//! │  LoginKeK, session keys as one half of a split.                         │
//! │                                                                         │
//! │  Layer 3: Single-use and monotonic nonces                               │
//! │  ────────────────────────────────────────                               │
//! │  Login nonces are consumed on first use. Channel nonces must strictly   │
//! │  increase and carry an HMAC checksum.                                   │
//! │                                                                         │
//! │  Layer 4: Split custody for recovery                                    │
//! │  ───────────────────────────────────                                    │
//! │  Neither dealer storage nor player storage alone yields a shard.        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keyring;
pub mod recovery;
pub mod storage;
/// Unix timestamp helpers.
pub mod time;
pub mod transit;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use auth::{
    AppTokenHierarchy, ClientAccessToken, LoginKeyHierarchy, LoginKeyRecord, NonceChallenge,
    NonceGrowingManager, NoncePackage, PasswordReply, ServerTokenRecord, VerifiedReply,
};
pub use config::KeychainConfig;
pub use crypto::{PublicKeyInfo, RsaKeyPair, SecretKey};
pub use error::{Error, Result};
pub use keyring::{RotationPolicy, RsaKeyRing};
pub use storage::{KeyValueStore, MemoryStore, SealedStore};

// ============================================================================
// KEYCHAIN
// ============================================================================

use std::sync::Arc;

/// The key core services wired over one store
///
/// ## Login Lifecycle
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                          KEYCHAIN LOGIN                                 │
/// ├─────────────────────────────────────────────────────────────────────────┤
/// │                                                                         │
/// │  1. bootstrap()      ensure a current RSA key                           │
/// │  2. begin_login()    fresh salts on first run, stored salts after       │
/// │  3. client           PasswordReply::compute(...)                        │
/// │  4. complete_login() verify, initialize owner keys on first run,        │
/// │                      open an owner session carrying the LoginKeK        │
/// │                                                                         │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
pub struct Keychain {
    config: KeychainConfig,
    ring: Arc<RsaKeyRing>,
    challenge: NonceChallenge,
    login: LoginKeyHierarchy,
    apps: AppTokenHierarchy,
    nonce_tables: NonceGrowingManager,
}

impl Keychain {
    /// Wire every service over `store`
    pub fn new(store: Arc<dyn KeyValueStore>, config: KeychainConfig) -> Result<Self> {
        config.validate()?;
        let ring = Arc::new(RsaKeyRing::new(&config));
        let writes = Arc::new(parking_lot::Mutex::new(()));
        Ok(Self {
            challenge: NonceChallenge::new(Arc::clone(&store), Arc::clone(&ring), config.clone()),
            login: LoginKeyHierarchy::with_write_lock(Arc::clone(&store), Arc::clone(&writes)),
            apps: AppTokenHierarchy::with_write_lock(Arc::clone(&store), &config, writes),
            nonce_tables: NonceGrowingManager::new(store),
            ring,
            config,
        })
    }

    /// Make sure a current RSA key exists
    pub fn bootstrap(&self) -> Result<PublicKeyInfo> {
        self.ring.ensure_current(self.config.rsa_min_lifetime_hours)
    }

    /// Issue a login challenge
    pub fn begin_login(&self) -> Result<NoncePackage> {
        match self.login.record() {
            Ok(record) => self.challenge.issue_for(&record),
            Err(Error::NotInitialized) => self.challenge.issue(),
            Err(e) => Err(e),
        }
    }

    /// Verify a login reply and open an owner session
    ///
    /// The first successful reply sets the password.
    pub fn complete_login(&self, reply: &PasswordReply) -> Result<(ClientAccessToken, ServerTokenRecord)> {
        let verified = match self.login.record() {
            Ok(record) => self.challenge.verify_login(reply, &record)?,
            Err(Error::NotInitialized) => {
                let verified = self.challenge.verify(reply)?;
                self.login.initialize(&verified)?;
                verified
            }
            Err(e) => return Err(e),
        };
        tracing::info!("Owner logged in");
        self.apps
            .create_owner_session(&verified.kek, Some(verified.shared_secret.clone()))
    }

    /// Configuration in use
    pub fn config(&self) -> &KeychainConfig {
        &self.config
    }

    /// RSA key ring
    pub fn ring(&self) -> &Arc<RsaKeyRing> {
        &self.ring
    }

    /// Login challenges
    pub fn challenge(&self) -> &NonceChallenge {
        &self.challenge
    }

    /// Owner key record
    pub fn login(&self) -> &LoginKeyHierarchy {
        &self.login
    }

    /// Applications and sessions
    pub fn apps(&self) -> &AppTokenHierarchy {
        &self.apps
    }

    /// Channel anti-replay tables
    pub fn nonce_tables(&self) -> &NonceGrowingManager {
        &self.nonce_tables
    }
}

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Odin Keys
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns build information for debugging
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        target: std::env::consts::OS,
        profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    }
}

/// Build information for debugging
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Crate version
    pub version: &'static str,
    /// Target operating system
    pub target: &'static str,
    /// Build profile (debug/release)
    pub profile: &'static str,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;

    const ITERATIONS: u32 = 1_000;

    fn keychain() -> Keychain {
        let config = KeychainConfig {
            pbkdf2_iterations: ITERATIONS,
            ..Default::default()
        };
        let keychain = Keychain::new(Arc::new(MemoryStore::new()), config).unwrap();
        keychain.ring().install(test_keys::primary()).unwrap();
        keychain
    }

    fn login(keychain: &Keychain, password: &[u8]) -> Result<(ClientAccessToken, ServerTokenRecord)> {
        let package = keychain.begin_login()?;
        let public = keychain.bootstrap()?;
        let reply =
            PasswordReply::compute(password, &package, &public, &SecretKey::generate(), ITERATIONS)?;
        keychain.complete_login(&reply)
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = build_info();
        assert_eq!(info.version, version());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = KeychainConfig {
            pbkdf2_iterations: 0,
            ..Default::default()
        };
        assert!(Keychain::new(Arc::new(MemoryStore::new()), config).is_err());
    }

    #[test]
    fn test_first_login_sets_password() {
        let keychain = keychain();
        assert!(!keychain.login().is_initialized().unwrap());

        let (token, _) = login(&keychain, b"correct-horse").unwrap();
        assert!(keychain.login().is_initialized().unwrap());

        let kek = keychain.apps().resolve_session_key(&token).unwrap();
        let record = keychain.login().record().unwrap();
        let expected = crypto::derive_secret(b"correct-horse", &record.salt_kek, ITERATIONS).unwrap();
        assert!(kek.ct_eq(&expected));
    }

    #[test]
    fn test_later_login_checks_password() {
        let keychain = keychain();
        login(&keychain, b"correct-horse").unwrap();

        assert!(login(&keychain, b"correct-horse").is_ok());
        assert!(matches!(
            login(&keychain, b"battery-staple"),
            Err(Error::PasswordMismatch)
        ));
    }
}
