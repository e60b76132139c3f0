//! # Authentication
//!
//! Password login and the key chains it unlocks.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          LOGIN TO SESSION                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  NonceChallenge ──verify──► VerifiedReply { kek, sharedSecret }         │
//! │                                   │                                     │
//! │                                   ▼                                     │
//! │  LoginKeyHierarchy ──unlock(kek)──► DeK                                 │
//! │                                   │                                     │
//! │                                   ▼                                     │
//! │  AppTokenHierarchy ──LoginKeK──► AppKeK ──► AppDeK                      │
//! │        │                                                                │
//! │        └─ SessionTokens: key split into cookie half + server half       │
//! │                                                                         │
//! │  NonceGrowingManager guards established channels against replay.       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod app_tokens;
mod login_keys;
mod nonce;
mod replay;
mod tokens;

pub use app_tokens::{AppTokenHierarchy, ApplicationRecord};
pub use login_keys::{LoginKeyHierarchy, LoginKeyRecord};
pub use nonce::{NonceChallenge, NoncePackage, PasswordReply, VerifiedReply};
pub use replay::{nonce_checksum, NonceGrowingManager, NonceTable};
pub use tokens::{
    refresh, resolve_session_key, split_key, ClientAccessToken, ServerTokenRecord, SessionTokens,
    TokenKind, TokenScope, PORTABLE_TOKEN_LEN,
};
