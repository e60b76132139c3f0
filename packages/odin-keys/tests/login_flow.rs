//! End-to-end flows through the public API: first login, unlock, replayed
//! nonces, password change, application sessions, transit and recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use odin_keys::auth::{nonce_checksum, ClientAccessToken, LoginKeyRecord};
use odin_keys::crypto::derive_secret;
use odin_keys::recovery::{Player, ShamirDealer, ShamirPlayer};
use odin_keys::transit::TransitPacket;
use odin_keys::{
    Error, Keychain, KeychainConfig, MemoryStore, PasswordReply, SealedStore, SecretKey,
};

const ITERATIONS: u32 = 1_000;

fn keychain() -> Keychain {
    let config = KeychainConfig {
        pbkdf2_iterations: ITERATIONS,
        ..Default::default()
    };
    let store = SealedStore::new(MemoryStore::new(), [42u8; 32]);
    let keychain = Keychain::new(Arc::new(store), config).unwrap();
    keychain.bootstrap().unwrap();
    keychain
}

#[test]
fn test_correct_horse_end_to_end() {
    let keychain = keychain();
    let public = keychain.ring().current_public().unwrap();

    let package = keychain.challenge().issue().unwrap();
    assert_ne!(package.salt_password, package.salt_kek);
    assert_ne!(package.nonce, package.salt_password);

    let shared = SecretKey::generate();
    let reply =
        PasswordReply::compute(b"correct-horse", &package, &public, &shared, ITERATIONS).unwrap();

    let verified = keychain.challenge().verify(&reply).unwrap();
    assert!(verified.shared_secret.ct_eq(&shared));

    let record = keychain.login().initialize(&verified).unwrap();
    let dek = keychain.login().unlock(&verified.kek).unwrap();
    assert_eq!(dek.as_bytes().len(), 16);
    assert!(dek.ct_eq(&record.unlock(&verified.kek)));

    for _ in 0..8 {
        let other = keychain.login().unlock(&SecretKey::generate()).unwrap();
        assert_eq!(other.as_bytes().len(), 16);
        assert!(!other.ct_eq(&dek));
    }

    assert!(matches!(
        keychain.challenge().verify(&reply),
        Err(Error::NonceNotFound)
    ));
}

#[test]
fn test_password_change_keeps_dek() {
    let keychain = keychain();
    let public = keychain.bootstrap().unwrap();

    let first = keychain.challenge().issue().unwrap();
    let reply = PasswordReply::compute(b"correct-horse", &first, &public, &SecretKey::generate(), ITERATIONS)
        .unwrap();
    let verified = keychain.challenge().verify(&reply).unwrap();
    keychain.login().initialize(&verified).unwrap();
    let dek = keychain.login().unlock(&verified.kek).unwrap();

    let record = keychain.login().record().unwrap();
    let login = keychain.challenge().issue_for(&record).unwrap();
    let reply = PasswordReply::compute(b"correct-horse", &login, &public, &SecretKey::generate(), ITERATIONS)
        .unwrap();
    let old = keychain.challenge().verify_login(&reply, &record).unwrap();

    let fresh = keychain.challenge().issue().unwrap();
    let reply = PasswordReply::compute(b"battery-staple", &fresh, &public, &SecretKey::generate(), ITERATIONS)
        .unwrap();
    let new = keychain.challenge().verify(&reply).unwrap();

    let updated: LoginKeyRecord = keychain.login().change_password(&old.kek, &new).unwrap();
    assert!(keychain.login().unlock(&new.kek).unwrap().ct_eq(&dek));
    assert_eq!(updated.salt_kek, fresh.salt_kek);

    let new_kek = derive_secret(b"battery-staple", &updated.salt_kek, ITERATIONS).unwrap();
    assert!(new_kek.ct_eq(&new.kek));
}

#[test]
fn test_password_change_keeps_application_keys() {
    let keychain = keychain();
    let public = keychain.bootstrap().unwrap();

    let first = keychain.begin_login().unwrap();
    let reply = PasswordReply::compute(b"correct-horse", &first, &public, &SecretKey::generate(), ITERATIONS)
        .unwrap();
    let (owner_token, _) = keychain.complete_login(&reply).unwrap();
    let old_kek = keychain.apps().resolve_session_key(&owner_token).unwrap();

    keychain.apps().create_application("chat", &old_kek).unwrap();
    let app_dek = keychain.apps().master_recover_app_dek("chat", &old_kek).unwrap();

    let fresh = keychain.challenge().issue().unwrap();
    let reply = PasswordReply::compute(b"battery-staple", &fresh, &public, &SecretKey::generate(), ITERATIONS)
        .unwrap();
    let new = keychain.challenge().verify(&reply).unwrap();
    keychain.login().change_password(&old_kek, &new).unwrap();

    let package = keychain.begin_login().unwrap();
    let reply = PasswordReply::compute(b"battery-staple", &package, &public, &SecretKey::generate(), ITERATIONS)
        .unwrap();
    let (owner_token, _) = keychain.complete_login(&reply).unwrap();
    let new_kek = keychain.apps().resolve_session_key(&owner_token).unwrap();

    let recovered = keychain.apps().master_recover_app_dek("chat", &new_kek).unwrap();
    assert!(recovered.ct_eq(&app_dek));
}

#[test]
fn test_owner_session_to_application() {
    let keychain = keychain();
    let public = keychain.bootstrap().unwrap();

    let package = keychain.begin_login().unwrap();
    let reply = PasswordReply::compute(b"correct-horse", &package, &public, &SecretKey::generate(), ITERATIONS)
        .unwrap();
    let (owner_token, _) = keychain.complete_login(&reply).unwrap();

    let cookie = owner_token.to_cookie();
    let owner_token = ClientAccessToken::from_cookie(&cookie).unwrap();
    let login_kek = keychain.apps().resolve_session_key(&owner_token).unwrap();

    keychain.apps().create_application("chat", &login_kek).unwrap();
    let app_dek = keychain.apps().master_recover_app_dek("chat", &login_kek).unwrap();

    let (app_token, record) = keychain
        .apps()
        .authorize_application("chat", &login_kek, None)
        .unwrap();
    assert!(keychain.apps().resolve_app_dek(&app_token).unwrap().ct_eq(&app_dek));

    let refreshed = keychain.apps().sessions().refresh(&app_token).unwrap();
    assert!(keychain.apps().resolve_app_dek(&refreshed).unwrap().ct_eq(&app_dek));

    assert!(keychain.apps().sessions().expire(&record.id).unwrap());
    assert!(matches!(
        keychain.apps().resolve_app_dek(&refreshed),
        Err(Error::TokenNotFound)
    ));
}

#[test]
fn test_channel_nonces() {
    let keychain = keychain();
    let secret = SecretKey::generate();
    let table = keychain.nonce_tables().create_table(secret.clone()).unwrap();

    for nonce in 1..=3u64 {
        let checksum = nonce_checksum(&secret, nonce).unwrap();
        keychain.nonce_tables().validate(&table, nonce, &checksum).unwrap();
    }
    let replay = nonce_checksum(&secret, 2).unwrap();
    assert!(matches!(
        keychain.nonce_tables().validate(&table, 2, &replay),
        Err(Error::ReplayDetected { nonce: 2, last_nonce: 3 })
    ));
}

#[test]
fn test_transit_after_rotation() {
    let keychain = keychain();
    let original = keychain.ring().current_public().unwrap();
    let packet = TransitPacket::seal(b"file payload", &original).unwrap();

    keychain.ring().generate(24).unwrap();
    keychain.ring().generate(24).unwrap();
    assert!(matches!(
        packet.open_with_ring(keychain.ring()),
        Err(Error::UnknownKey(_))
    ));
    assert!(keychain.ring().public_key(original.fingerprint).is_none());

    let current = keychain.ring().current_public().unwrap();
    let packet = TransitPacket::seal(b"file payload", &current).unwrap();
    keychain.ring().generate(24).unwrap();
    assert_eq!(&packet.open_with_ring(keychain.ring()).unwrap()[..], b"file payload");

    let relay_key = SecretKey::generate();
    let pair = keychain.ring().private_key(current.fingerprint).unwrap();
    let resealed = packet.reseal(&pair, &relay_key).unwrap();
    assert_eq!(&resealed.open(&relay_key).unwrap()[..], b"file payload");
}

#[test]
fn test_shamir_five_three_recovery() {
    let keychain = keychain();
    let public = keychain.bootstrap().unwrap();
    let package = keychain.challenge().issue().unwrap();
    let reply = PasswordReply::compute(b"correct-horse", &package, &public, &SecretKey::generate(), ITERATIONS)
        .unwrap();
    let verified = keychain.challenge().verify(&reply).unwrap();
    keychain.login().initialize(&verified).unwrap();
    let dek = keychain.login().unlock(&verified.kek).unwrap();

    let dealer = ShamirDealer::new(
        "owner.example",
        Arc::new(MemoryStore::new()),
        SecretKey::generate(),
    );
    let roster = vec![
        Player::automatic("a.example"),
        Player::automatic("b.example"),
        Player::delegate("c.example"),
        Player::automatic("d.example"),
        Player::delegate("e.example"),
    ];
    let outgoing = dealer.configure(dek.as_bytes(), &roster, 3).unwrap();

    let in_recovery = Arc::new(AtomicBool::new(false));
    let players: Vec<ShamirPlayer> = outgoing
        .iter()
        .map(|wrapper| {
            let flag = Arc::clone(&in_recovery);
            let player = ShamirPlayer::new(
                Arc::new(MemoryStore::new()),
                SecretKey::generate(),
                Arc::new(move |_: &str| flag.load(Ordering::SeqCst)),
            );
            player.accept(wrapper).unwrap();
            player
        })
        .collect();

    assert!(matches!(
        players[0].release("owner.example"),
        Err(Error::RecoveryNotAuthorized)
    ));

    in_recovery.store(true, Ordering::SeqCst);
    assert!(matches!(
        players[2].release("owner.example"),
        Err(Error::AwaitingApproval)
    ));
    players[2].approve("owner.example").unwrap();

    let two = vec![
        players[0].release("owner.example").unwrap(),
        players[1].release("owner.example").unwrap(),
    ];
    assert!(matches!(
        dealer.recover(&two),
        Err(Error::InsufficientShards { required: 3, provided: 2 })
    ));

    let three = vec![
        players[2].release("owner.example").unwrap(),
        players[0].release("owner.example").unwrap(),
        players[3].release("owner.example").unwrap(),
    ];
    let recovered = dealer.recover(&three).unwrap();
    assert_eq!(&recovered[..], dek.as_bytes());
    assert!(!dealer.is_configured().unwrap());
}
