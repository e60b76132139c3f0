//! # Application Token Hierarchy
//!
//! Per-application key pairs under the owner's LoginKeK, and the sessions
//! that hand an application its AppKeK.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        APPLICATION KEYS                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  LoginKeK ──AES──► AppKeK ──XOR──► AppDeK                               │
//! │                                                                         │
//! │  stored:  AES(AppKeK, LoginKeK)   AppDeK ⊕ AppKeK                       │
//! │                                                                         │
//! │  owner (has LoginKeK)       → AppKeK → AppDeK                           │
//! │  app session (cookie half)  → halfKey ⊕ half = AppKeK → AppDeK          │
//! │                                                                         │
//! │  password change: every indexed AppKeK is re-sealed under the new       │
//! │  LoginKeK; AppKeK and AppDeK themselves never change                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::tokens::{ClientAccessToken, ServerTokenRecord, SessionTokens, TokenKind};
use crate::config::{KeychainConfig, SECRET_LEN};
use crate::crypto::{aes_encrypt, AesSealed, SecretKey};
use crate::error::{Error, Result};
use crate::storage::{keys, load_record, save_record, KeyValueStore};
use crate::time::now_timestamp;

/// A registered application's wrapped keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRecord {
    /// Application id
    pub app_id: String,
    /// AppDeK ⊕ AppKeK
    pub xor_encrypted_app_dek: [u8; SECRET_LEN],
    /// AppKeK sealed under the LoginKeK
    pub kek_encrypted_app_kek: AesSealed,
    /// Unix timestamp of registration
    pub created: i64,
}

impl ApplicationRecord {
    /// Generate fresh application keys wrapped under `login_kek`
    pub fn create(app_id: impl Into<String>, login_kek: &SecretKey) -> Result<Self> {
        let app_dek = SecretKey::generate();
        let app_kek = SecretKey::generate();
        Ok(Self {
            app_id: app_id.into(),
            xor_encrypted_app_dek: *app_dek.xor(&app_kek).as_bytes(),
            kek_encrypted_app_kek: aes_encrypt(app_kek.as_bytes(), login_kek)?,
            created: now_timestamp(),
        })
    }

    /// Recover the AppKeK with the owner's LoginKeK
    pub fn unlock_app_kek(&self, login_kek: &SecretKey) -> Result<SecretKey> {
        self.kek_encrypted_app_kek.open_key(login_kek)
    }

    /// Recover the AppDeK from an AppKeK
    ///
    /// Silent like the login unlock: a wrong AppKeK yields a wrong AppDeK.
    pub fn app_dek(&self, app_kek: &SecretKey) -> SecretKey {
        SecretKey::from_bytes(self.xor_encrypted_app_dek).xor(app_kek)
    }

    /// Recover the AppDeK with the owner's LoginKeK
    pub fn master_recover_app_dek(&self, login_kek: &SecretKey) -> Result<SecretKey> {
        let app_kek = self.unlock_app_kek(login_kek)?;
        Ok(self.app_dek(&app_kek))
    }

    /// Re-seal the AppKeK under a new LoginKeK
    ///
    /// Fails without a result when `old_kek` does not open the AppKeK.
    pub fn rewrap(&self, old_kek: &SecretKey, new_kek: &SecretKey) -> Result<Self> {
        let app_kek = self.unlock_app_kek(old_kek)?;
        Ok(Self {
            kek_encrypted_app_kek: aes_encrypt(app_kek.as_bytes(), new_kek)?,
            ..self.clone()
        })
    }
}

/// Ids of every registered application
pub(crate) fn application_ids(store: &dyn KeyValueStore) -> Result<Vec<String>> {
    Ok(load_record(store, keys::APPLICATION_INDEX)?.unwrap_or_default())
}

/// Every registered application re-sealed from `old_kek` to `new_kek`
///
/// Nothing is written; the caller persists the result.
pub(crate) fn rewrap_applications(
    store: &dyn KeyValueStore,
    old_kek: &SecretKey,
    new_kek: &SecretKey,
) -> Result<Vec<ApplicationRecord>> {
    application_ids(store)?
        .iter()
        .map(|app_id| {
            let record: ApplicationRecord = load_record(store, &keys::application(app_id))?
                .ok_or_else(|| Error::ApplicationNotFound(app_id.clone()))?;
            record.rewrap(old_kek, new_kek)
        })
        .collect()
}

/// Applications and their sessions
pub struct AppTokenHierarchy {
    store: Arc<dyn KeyValueStore>,
    sessions: SessionTokens,
    writes: Arc<Mutex<()>>,
}

impl AppTokenHierarchy {
    /// Create over a store
    pub fn new(store: Arc<dyn KeyValueStore>, config: &KeychainConfig) -> Self {
        Self::with_write_lock(store, config, Arc::new(Mutex::new(())))
    }

    /// Create over a store, serializing registrations with `writes`
    ///
    /// Share the lock with the [`LoginKeyHierarchy`](super::LoginKeyHierarchy)
    /// on the same store so no application is registered under a LoginKeK
    /// that a concurrent password change is replacing.
    pub(crate) fn with_write_lock(
        store: Arc<dyn KeyValueStore>,
        config: &KeychainConfig,
        writes: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            sessions: SessionTokens::new(Arc::clone(&store), config.token_ttl_secs),
            store,
            writes,
        }
    }

    /// Session records
    pub fn sessions(&self) -> &SessionTokens {
        &self.sessions
    }

    /// Register an application
    pub fn create_application(&self, app_id: &str, login_kek: &SecretKey) -> Result<ApplicationRecord> {
        let _guard = self.writes.lock();
        let key = keys::application(app_id);
        if self.store.get(&key)?.is_some() {
            return Err(Error::ApplicationExists(app_id.to_string()));
        }
        let record = ApplicationRecord::create(app_id, login_kek)?;
        save_record(&*self.store, &key, &record)?;

        let mut ids = application_ids(&*self.store)?;
        ids.push(app_id.to_string());
        save_record(&*self.store, keys::APPLICATION_INDEX, &ids)?;
        tracing::info!("Application {} registered", app_id);
        Ok(record)
    }

    /// Ids of every registered application, in registration order
    pub fn application_ids(&self) -> Result<Vec<String>> {
        application_ids(&*self.store)
    }

    /// Load an application record
    pub fn application(&self, app_id: &str) -> Result<ApplicationRecord> {
        load_record(&*self.store, &keys::application(app_id))?
            .ok_or_else(|| Error::ApplicationNotFound(app_id.to_string()))
    }

    /// Recover an application's AppDeK as the owner
    pub fn master_recover_app_dek(&self, app_id: &str, login_kek: &SecretKey) -> Result<SecretKey> {
        self.application(app_id)?.master_recover_app_dek(login_kek)
    }

    /// Start an owner session carrying the LoginKeK
    pub fn create_owner_session(
        &self,
        login_kek: &SecretKey,
        shared_secret: Option<SecretKey>,
    ) -> Result<(ClientAccessToken, ServerTokenRecord)> {
        self.sessions.issue(TokenKind::Owner, login_kek, shared_secret)
    }

    /// Start an application session carrying `app_kek`
    pub fn create_client_session(
        &self,
        app_id: &str,
        app_kek: &SecretKey,
        shared_secret: Option<SecretKey>,
    ) -> Result<(ClientAccessToken, ServerTokenRecord)> {
        self.application(app_id)?;
        let kind = TokenKind::App {
            app_id: app_id.to_string(),
        };
        self.sessions.issue(kind, app_kek, shared_secret)
    }

    /// Start an application session as the owner
    pub fn authorize_application(
        &self,
        app_id: &str,
        login_kek: &SecretKey,
        shared_secret: Option<SecretKey>,
    ) -> Result<(ClientAccessToken, ServerTokenRecord)> {
        let app_kek = self.application(app_id)?.unlock_app_kek(login_kek)?;
        self.create_client_session(app_id, &app_kek, shared_secret)
    }

    /// Rejoin the key a client token unlocks
    pub fn resolve_session_key(&self, token: &ClientAccessToken) -> Result<SecretKey> {
        Ok(self.sessions.resolve(token)?.1)
    }

    /// Rejoin an application session and unwrap the AppDeK
    pub fn resolve_app_dek(&self, token: &ClientAccessToken) -> Result<SecretKey> {
        let (record, app_kek) = self.sessions.resolve(token)?;
        match record.kind {
            TokenKind::App { app_id } => Ok(self.application(&app_id)?.app_dek(&app_kek)),
            TokenKind::Owner => Err(Error::TokenNotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn hierarchy() -> AppTokenHierarchy {
        AppTokenHierarchy::new(Arc::new(MemoryStore::new()), &KeychainConfig::default())
    }

    #[test]
    fn test_record_unwraps_with_login_kek() {
        let login_kek = SecretKey::generate();
        let record = ApplicationRecord::create("photos", &login_kek).unwrap();

        let app_kek = record.unlock_app_kek(&login_kek).unwrap();
        let app_dek = record.master_recover_app_dek(&login_kek).unwrap();
        assert!(record.app_dek(&app_kek).ct_eq(&app_dek));
        assert!(!app_dek.ct_eq(&app_kek));
        assert_ne!(&record.xor_encrypted_app_dek, app_dek.as_bytes());
    }

    #[test]
    fn test_wrong_login_kek_never_yields_app_dek() {
        let login_kek = SecretKey::generate();
        let record = ApplicationRecord::create("photos", &login_kek).unwrap();
        let app_dek = record.master_recover_app_dek(&login_kek).unwrap();

        match record.master_recover_app_dek(&SecretKey::generate()) {
            Err(Error::DecryptionFailed) => {}
            Ok(other) => assert!(!other.ct_eq(&app_dek)),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn test_application_registry() {
        let apps = hierarchy();
        let login_kek = SecretKey::generate();

        apps.create_application("photos", &login_kek).unwrap();
        assert!(matches!(
            apps.create_application("photos", &login_kek),
            Err(Error::ApplicationExists(_))
        ));
        assert!(matches!(
            apps.application("mail"),
            Err(Error::ApplicationNotFound(_))
        ));
        assert!(apps.master_recover_app_dek("photos", &login_kek).is_ok());
        assert_eq!(apps.application_ids().unwrap(), vec!["photos".to_string()]);
    }

    #[test]
    fn test_rewrap_keeps_app_keys() {
        let old_kek = SecretKey::generate();
        let new_kek = SecretKey::generate();
        let record = ApplicationRecord::create("photos", &old_kek).unwrap();
        let app_dek = record.master_recover_app_dek(&old_kek).unwrap();

        let moved = record.rewrap(&old_kek, &new_kek).unwrap();
        assert!(moved.master_recover_app_dek(&new_kek).unwrap().ct_eq(&app_dek));
        assert_eq!(moved.xor_encrypted_app_dek, record.xor_encrypted_app_dek);
        assert!(record.rewrap(&new_kek, &old_kek).is_err());
    }

    #[test]
    fn test_concurrent_registration_indexes_every_app() {
        let apps = Arc::new(hierarchy());
        let login_kek = SecretKey::generate();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let apps = Arc::clone(&apps);
                let login_kek = login_kek.clone();
                std::thread::spawn(move || apps.create_application(&format!("app-{}", i), &login_kek))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let mut ids = apps.application_ids().unwrap();
        ids.sort();
        assert_eq!(ids.len(), 8);
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn test_application_session_resolves_app_dek() {
        let apps = hierarchy();
        let login_kek = SecretKey::generate();
        apps.create_application("photos", &login_kek).unwrap();
        let expected = apps.master_recover_app_dek("photos", &login_kek).unwrap();

        let (token, record) = apps.authorize_application("photos", &login_kek, None).unwrap();
        assert_eq!(
            record.kind,
            TokenKind::App {
                app_id: "photos".into()
            }
        );
        assert!(apps.resolve_app_dek(&token).unwrap().ct_eq(&expected));

        let cookie = token.to_cookie();
        let back = ClientAccessToken::from_cookie(&cookie).unwrap();
        assert!(apps.resolve_app_dek(&back).unwrap().ct_eq(&expected));
    }

    #[test]
    fn test_owner_session_resolves_login_kek() {
        let apps = hierarchy();
        let login_kek = SecretKey::generate();
        let (token, _) = apps.create_owner_session(&login_kek, None).unwrap();

        assert!(apps.resolve_session_key(&token).unwrap().ct_eq(&login_kek));
        assert!(matches!(apps.resolve_app_dek(&token), Err(Error::TokenNotFound)));
    }

    #[test]
    fn test_session_for_unknown_application() {
        let apps = hierarchy();
        assert!(matches!(
            apps.create_client_session("mail", &SecretKey::generate(), None),
            Err(Error::ApplicationNotFound(_))
        ));
    }
}
