//! # Cryptography Module
//!
//! The primitives every other module composes: fixed-length secrets,
//! XOR split/join, AES-CBC envelopes, PBKDF2 and RSA-OAEP key pairs.
//!
//! ## Key Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          OWNER KEY HIERARCHY                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  password                                                               │
//! │     │ PBKDF2(saltKek)                                                   │
//! │     ▼                                                                   │
//! │  LoginKeK ──────── XOR ────────► DeK          (record: DeK ⊕ KeK)       │
//! │     │                                                                   │
//! │     │ AES-CBC                                                           │
//! │     ▼                                                                   │
//! │  AppKeK ───────── XOR ────────► AppDeK        (record: AppDeK ⊕ AppKeK) │
//! │     │                                                                   │
//! │     │ XOR                                                               │
//! │     ▼                                                                   │
//! │  server halfKey  +  client cookie half                                  │
//! │                                                                         │
//! │  Nothing above the record line is ever persisted in the clear.          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices
//!
//! | Algorithm | Purpose |
//! |-----------|---------|
//! | AES-128-CBC + PKCS7 | Wrapping 16-byte keys, transit payloads |
//! | PBKDF2-HMAC-SHA256 | Password hashing, KeK derivation, nonce proofs |
//! | RSA-OAEP (SHA-256) | Login reply channel, transit headers |
//! | CRC32 | Public key identification only |
//!
//! ## Security Considerations
//!
//! 1. **Key Zeroization**: every secret buffer is zeroized when dropped
//! 2. **Constant-Time Comparison**: derived hashes are compared with `subtle`
//! 3. **Secure Random**: `rand::rngs::OsRng` for every generated value
//! 4. **Opaque Failures**: decryption failures never say why

mod envelope;
mod kdf;
mod rsa_keys;
mod secret;

pub use envelope::{aes_decrypt, aes_encrypt, aes_encrypt_with_iv, xor_join, AesSealed, BLOCK_SIZE};
pub use kdf::{derive_key, derive_secret, SaltedHash};
pub use rsa_keys::{fingerprint, PublicKeyInfo, RsaKeyPair, StoredRsaKey, MAX_RSA_SEALED_LEN};
pub use secret::{random_array, to_array, SecretKey};

#[cfg(test)]
pub(crate) use rsa_keys::test_keys;
