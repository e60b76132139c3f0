//! # Session Tokens
//!
//! Split-key session tokens. The key a session unlocks (LoginKeK for an
//! owner session, AppKeK for an application session) is never stored; the
//! server keeps one half, the client the other.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           HALF-KEY SPLIT                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  clientHalf  = random                      (cookie)                     │
//! │  halfKey     = key ⊕ clientHalf            (server record)              │
//! │  key         = halfKey ⊕ clientHalf        (resolve)                    │
//! │                                                                         │
//! │  refresh:  halfKey' = halfKey ⊕ (clientHalf ⊕ clientHalf')              │
//! │            the key itself never appears; the shared secret rotates,     │
//! │            so the old token is refused                                  │
//! │                                                                         │
//! │  Portable client token (49 bytes):                                      │
//! │  ┌───────┬────────────┬──────────────┬───────────────┐                  │
//! │  │ scope │  id (16)   │  half (16)   │  secret (16)  │                  │
//! │  │  (1)  │            │              │               │                  │
//! │  └───────┴────────────┴──────────────┴───────────────┘                  │
//! │  Cookie form: URL-safe base64 of the portable bytes, no padding.        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SECRET_LEN;
use crate::crypto::SecretKey;
use crate::error::{Error, Result};
use crate::storage::{keys, load_record, save_record, take_record, KeyValueStore};
use crate::time::{expires_in, now_timestamp};

/// Size of a portable client token
pub const PORTABLE_TOKEN_LEN: usize = 1 + 3 * SECRET_LEN;

/// What a session unlocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    /// The owner's LoginKeK
    Owner,
    /// One application's AppKeK
    App {
        /// Application id
        app_id: String,
    },
}

impl TokenKind {
    /// The one-byte scope carried by the client token
    pub fn scope(&self) -> TokenScope {
        match self {
            TokenKind::Owner => TokenScope::Owner,
            TokenKind::App { .. } => TokenScope::App,
        }
    }
}

/// Scope byte of a client token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TokenScope {
    /// Owner session
    Owner = 1,
    /// Application session
    App = 2,
}

impl TryFrom<u8> for TokenScope {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(TokenScope::Owner),
            2 => Ok(TokenScope::App),
            other => Err(Error::MalformedPayload(format!("Unknown token scope {}", other))),
        }
    }
}

/// Server-held half of a session
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerTokenRecord {
    /// Token id
    pub id: Uuid,
    /// What the session unlocks
    pub kind: TokenKind,
    /// Secret the client must present alongside its half
    pub shared_secret: SecretKey,
    /// key ⊕ clientHalf
    pub half_key: SecretKey,
    /// Unix timestamp of creation
    pub created: i64,
    /// Unix timestamp after which the session is refused
    pub expiry: i64,
}

impl ServerTokenRecord {
    /// Whether the session is still usable at `now`
    pub fn is_valid_at(&self, now: i64) -> bool {
        now <= self.expiry
    }
}

impl std::fmt::Debug for ServerTokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTokenRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("created", &self.created)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

/// Client-held half of a session
#[derive(Clone)]
pub struct ClientAccessToken {
    /// Owner or application session
    pub scope: TokenScope,
    /// Server record id
    pub id: Uuid,
    /// The client's key half
    pub half: SecretKey,
    /// Shared secret, checked against the server record
    pub shared_secret: SecretKey,
}

impl ClientAccessToken {
    /// Encode as `scope || id || half || secret`
    pub fn to_portable(&self) -> [u8; PORTABLE_TOKEN_LEN] {
        let mut out = [0u8; PORTABLE_TOKEN_LEN];
        out[0] = self.scope as u8;
        out[1..17].copy_from_slice(self.id.as_bytes());
        out[17..33].copy_from_slice(self.half.as_bytes());
        out[33..].copy_from_slice(self.shared_secret.as_bytes());
        out
    }

    /// Decode portable bytes, rejecting any other length
    pub fn from_portable(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PORTABLE_TOKEN_LEN {
            return Err(Error::LengthMismatch {
                expected: PORTABLE_TOKEN_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            scope: TokenScope::try_from(bytes[0])?,
            id: Uuid::from_slice(&bytes[1..17])
                .map_err(|e| Error::MalformedPayload(e.to_string()))?,
            half: SecretKey::from_slice(&bytes[17..33])?,
            shared_secret: SecretKey::from_slice(&bytes[33..])?,
        })
    }

    /// Encode as a cookie value
    pub fn to_cookie(&self) -> String {
        let bytes = zeroize::Zeroizing::new(self.to_portable());
        URL_SAFE_NO_PAD.encode(&bytes[..])
    }

    /// Decode a cookie value
    pub fn from_cookie(cookie: &str) -> Result<Self> {
        let bytes = zeroize::Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(cookie.trim())
                .map_err(|_| Error::MalformedPayload("Token cookie is not base64".into()))?,
        );
        Self::from_portable(&bytes)
    }
}

impl std::fmt::Debug for ClientAccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAccessToken")
            .field("scope", &self.scope)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Server half for `key` given the client's half
pub fn split_key(key: &SecretKey, client_half: &SecretKey) -> SecretKey {
    key.xor(client_half)
}

/// Rejoin the two halves
pub fn resolve_session_key(half_key: &SecretKey, client_half: &SecretKey) -> SecretKey {
    half_key.xor(client_half)
}

/// Move the split to a new client half without forming the key
pub fn refresh(old_half: &SecretKey, new_half: &SecretKey, half_key: &SecretKey) -> SecretKey {
    half_key.xor(&old_half.xor(new_half))
}

/// Persisted session records
pub struct SessionTokens {
    store: Arc<dyn KeyValueStore>,
    ttl_secs: u64,
    updates: Mutex<()>,
}

impl SessionTokens {
    /// Create over a store with a session lifetime
    pub fn new(store: Arc<dyn KeyValueStore>, ttl_secs: u64) -> Self {
        Self {
            store,
            ttl_secs,
            updates: Mutex::new(()),
        }
    }

    /// Split `key` into a new session
    ///
    /// A shared secret is generated when the caller has none.
    pub fn issue(
        &self,
        kind: TokenKind,
        key: &SecretKey,
        shared_secret: Option<SecretKey>,
    ) -> Result<(ClientAccessToken, ServerTokenRecord)> {
        let half = SecretKey::generate();
        let shared_secret = shared_secret.unwrap_or_else(SecretKey::generate);
        let record = ServerTokenRecord {
            id: Uuid::new_v4(),
            kind,
            shared_secret: shared_secret.clone(),
            half_key: split_key(key, &half),
            created: now_timestamp(),
            expiry: expires_in(self.ttl_secs),
        };
        save_record(&*self.store, &keys::token(&record.id), &record)?;
        tracing::debug!("Session {} created ({:?})", record.id, record.kind);

        let token = ClientAccessToken {
            scope: record.kind.scope(),
            id: record.id,
            half,
            shared_secret,
        };
        Ok((token, record))
    }

    /// Load a session record
    pub fn get(&self, id: &Uuid) -> Result<ServerTokenRecord> {
        load_record(&*self.store, &keys::token(id))?.ok_or(Error::TokenNotFound)
    }

    /// Whether a session exists and has not expired
    pub fn is_valid(&self, id: &Uuid) -> Result<bool> {
        match self.get(id) {
            Ok(record) => Ok(record.is_valid_at(now_timestamp())),
            Err(Error::TokenNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Rejoin the session key from a client token
    pub fn resolve(&self, token: &ClientAccessToken) -> Result<(ServerTokenRecord, SecretKey)> {
        self.resolve_at(token, now_timestamp())
    }

    /// Rejoin at an explicit time
    pub fn resolve_at(&self, token: &ClientAccessToken, now: i64) -> Result<(ServerTokenRecord, SecretKey)> {
        let record = self.checked(token, now)?;
        let key = resolve_session_key(&record.half_key, &token.half);
        Ok((record, key))
    }

    /// Push a session's expiry out by the configured lifetime
    pub fn extend(&self, id: &Uuid) -> Result<i64> {
        let _guard = self.updates.lock();
        let mut record = self.get(id)?;
        if !record.is_valid_at(now_timestamp()) {
            return Err(Error::TokenExpired);
        }
        record.expiry = expires_in(self.ttl_secs);
        save_record(&*self.store, &keys::token(id), &record)?;
        Ok(record.expiry)
    }

    /// End a session; returns whether it existed
    pub fn expire(&self, id: &Uuid) -> Result<bool> {
        let removed: Option<ServerTokenRecord> = take_record(&*self.store, &keys::token(id))?;
        if removed.is_some() {
            tracing::debug!("Session {} expired", id);
        }
        Ok(removed.is_some())
    }

    /// Issue a new client half for a live session
    ///
    /// The shared secret is replaced too, so the old token is refused with
    /// [`Error::TokenNotFound`].
    pub fn refresh(&self, token: &ClientAccessToken) -> Result<ClientAccessToken> {
        let _guard = self.updates.lock();
        let mut record = self.checked(token, now_timestamp())?;
        let new_half = SecretKey::generate();
        let shared_secret = SecretKey::generate();
        record.half_key = refresh(&token.half, &new_half, &record.half_key);
        record.shared_secret = shared_secret.clone();
        save_record(&*self.store, &keys::token(&record.id), &record)?;
        tracing::debug!("Session {} refreshed", record.id);

        Ok(ClientAccessToken {
            half: new_half,
            shared_secret,
            ..token.clone()
        })
    }

    fn checked(&self, token: &ClientAccessToken, now: i64) -> Result<ServerTokenRecord> {
        let record = self.get(&token.id)?;
        if record.kind.scope() != token.scope || !record.shared_secret.ct_eq(&token.shared_secret) {
            tracing::warn!("Session {} presented with mismatched token", token.id);
            return Err(Error::TokenNotFound);
        }
        if !record.is_valid_at(now) {
            return Err(Error::TokenExpired);
        }
        Ok(record)
    }
}
