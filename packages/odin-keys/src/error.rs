//! # Error Handling
//!
//! Error types for the identity key core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                      │
//! │  │                                                                      │
//! │  ├── Configuration Errors                                               │
//! │  │   └── InvalidConfig         - Out-of-range configuration value       │
//! │  │                                                                      │
//! │  ├── Envelope Errors                                                    │
//! │  │   ├── LengthMismatch        - Buffer has the wrong size              │
//! │  │   ├── EncryptionFailed      - Encryption operation failed            │
//! │  │   ├── DecryptionFailed      - Wrong key, IV, or corrupted data       │
//! │  │   ├── KeyGenerationFailed   - RSA key generation failed              │
//! │  │   └── InvalidKey            - Key material could not be parsed       │
//! │  │                                                                      │
//! │  ├── Key Ring Errors                                                    │
//! │  │   ├── UnknownKey            - Fingerprint matches no held key        │
//! │  │   ├── KeyMismatch           - Packet addressed to a different key    │
//! │  │   ├── RotationBlocked       - Previous key still has dependents      │
//! │  │   ├── LifetimeTooShort      - Requested lifetime below 24 hours      │
//! │  │   └── NoCurrentKey          - Ring has not been bootstrapped         │
//! │  │                                                                      │
//! │  ├── Authentication Errors                                              │
//! │  │   ├── NonceNotFound         - Unknown or already consumed nonce      │
//! │  │   ├── NonceExpired          - Pending nonce outlived its TTL         │
//! │  │   ├── PasswordMismatch      - Nonce hash does not match              │
//! │  │   ├── MalformedPayload      - Decrypted reply is unparseable         │
//! │  │   ├── ReplayDetected        - Nonce not strictly increasing          │
//! │  │   ├── ChecksumMismatch      - Growing nonce checksum is wrong        │
//! │  │   ├── TokenNotFound / TokenExpired                                   │
//! │  │   ├── NotInitialized / AlreadyInitialized                            │
//! │  │   └── ApplicationExists / ApplicationNotFound                        │
//! │  │                                                                      │
//! │  ├── Recovery Errors                                                    │
//! │  │   ├── RecoveryNotAuthorized - Dealer is not in recovery mode         │
//! │  │   ├── InsufficientShards    - Fewer than k distinct shards           │
//! │  │   ├── DuplicateShardIndex   - Same shard supplied twice              │
//! │  │   ├── InvalidThreshold      - k / n outside the allowed range        │
//! │  │   ├── ShardNotFound         - Player holds nothing for this dealer   │
//! │  │   └── AwaitingApproval      - Delegate has not approved release      │
//! │  │                                                                      │
//! │  └── Storage Errors                                                     │
//! │      ├── StorageReadError / StorageWriteError                           │
//! │      └── StorageCorrupted      - Record failed validation               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation
//!
//! Cryptographic failures are terminal for the calling operation. Nothing
//! here retries: re-running a failed decryption with the same inputs cannot
//! succeed, and re-running a password check is a brute-force amplifier that
//! the caller must rate-limit. [`Error::is_retry_safe`] marks the few
//! transient failures (storage I/O) and [`Error::is_attack_signal`] marks the
//! ones the caller should log as a potential attack.

use thiserror::Error;

/// Result type alias for key core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the key core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors (100-199)
    // ========================================================================

    /// A configuration value is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Envelope Errors (200-299)
    // ========================================================================

    /// A buffer does not have the required length
    #[error("Length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed.
    ///
    /// Deliberately carries no detail: a wrong key, a wrong IV and a
    /// corrupted ciphertext all look the same from the outside.
    #[error("Decryption failed")]
    DecryptionFailed,

    /// RSA key generation failed
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Key material could not be parsed
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // ========================================================================
    // Key Ring Errors (300-399)
    // ========================================================================

    /// No key with this fingerprint is held (stale key, client should refresh)
    #[error("No key with fingerprint {0:08x}")]
    UnknownKey(u32),

    /// A packet was addressed to a different key than the one supplied
    #[error("Key mismatch: packet is for {expected:08x}, key is {actual:08x}")]
    KeyMismatch {
        /// Fingerprint carried by the packet
        expected: u32,
        /// Fingerprint of the supplied key
        actual: u32,
    },

    /// Rotation refused because the previous key still has dependents
    #[error("Key rotation blocked: previous key still has dependents")]
    RotationBlocked,

    /// Requested key lifetime is below the minimum
    #[error("Key lifetime of {requested}h is below the {minimum}h minimum")]
    LifetimeTooShort {
        /// Minimum lifetime in hours
        minimum: u32,
        /// Requested lifetime in hours
        requested: u32,
    },

    /// The key ring holds no current key
    #[error("Key ring has no current key")]
    NoCurrentKey,

    // ========================================================================
    // Authentication Errors (400-499)
    // ========================================================================

    /// The nonce package does not exist or was already consumed
    #[error("Nonce not found or already consumed")]
    NonceNotFound,

    /// The nonce package expired before it was used
    #[error("Nonce expired")]
    NonceExpired,

    /// The password proof does not match
    #[error("Password mismatch")]
    PasswordMismatch,

    /// A decrypted reply could not be parsed
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A growing nonce was not strictly greater than the last accepted one
    #[error("Replay detected: nonce {nonce} is not greater than {last_nonce}")]
    ReplayDetected {
        /// Offered nonce
        nonce: u64,
        /// Last accepted nonce
        last_nonce: u64,
    },

    /// A growing nonce carried the wrong keyed checksum
    #[error("Nonce checksum mismatch")]
    ChecksumMismatch,

    /// No token record with this id
    #[error("Token not found")]
    TokenNotFound,

    /// The token record is past its expiry
    #[error("Token expired")]
    TokenExpired,

    /// The owner key record has not been created yet
    #[error("Login keys have not been initialized")]
    NotInitialized,

    /// The owner key record already exists
    #[error("Login keys are already initialized")]
    AlreadyInitialized,

    /// An application with this id is already registered
    #[error("Application already registered: {0}")]
    ApplicationExists(String),

    /// No application with this id
    #[error("Application not found: {0}")]
    ApplicationNotFound(String),

    // ========================================================================
    // Recovery Errors (500-599)
    // ========================================================================

    /// The dealer is not in an authorized recovery mode
    #[error("Recovery not authorized")]
    RecoveryNotAuthorized,

    /// Not enough distinct shards to reconstruct
    #[error("Insufficient shards: need {required}, got {provided}")]
    InsufficientShards {
        /// Threshold
        required: usize,
        /// Distinct shards supplied
        provided: usize,
    },

    /// A shard index was supplied more than once
    #[error("Duplicate shard index {0}")]
    DuplicateShardIndex(u8),

    /// Threshold parameters are out of range
    #[error("Invalid threshold: {threshold} of {total}")]
    InvalidThreshold {
        /// Minimum shards (k)
        threshold: usize,
        /// Total shards (n)
        total: usize,
    },

    /// The player holds no shard for this dealer
    #[error("Shard not found")]
    ShardNotFound,

    /// A delegate player has not approved releasing the shard
    #[error("Shard release awaiting delegate approval")]
    AwaitingApproval,

    // ========================================================================
    // Storage Errors (600-699)
    // ========================================================================

    /// Failed to read from the store
    #[error("Storage read error: {0}")]
    StorageReadError(String),

    /// Failed to write to the store
    #[error("Storage write error: {0}")]
    StorageWriteError(String),

    /// A stored record failed validation
    #[error("Storage corrupted: {0}")]
    StorageCorrupted(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Configuration
    /// - 200-299: Envelope
    /// - 300-399: Key ring
    /// - 400-499: Authentication
    /// - 500-599: Recovery
    /// - 600-699: Storage
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Configuration (100-199)
            Error::InvalidConfig(_) => 100,

            // Envelope (200-299)
            Error::LengthMismatch { .. } => 200,
            Error::EncryptionFailed(_) => 201,
            Error::DecryptionFailed => 202,
            Error::KeyGenerationFailed(_) => 203,
            Error::InvalidKey(_) => 204,

            // Key ring (300-399)
            Error::UnknownKey(_) => 300,
            Error::KeyMismatch { .. } => 301,
            Error::RotationBlocked => 302,
            Error::LifetimeTooShort { .. } => 303,
            Error::NoCurrentKey => 304,

            // Authentication (400-499)
            Error::NonceNotFound => 400,
            Error::NonceExpired => 401,
            Error::PasswordMismatch => 402,
            Error::MalformedPayload(_) => 403,
            Error::ReplayDetected { .. } => 404,
            Error::ChecksumMismatch => 405,
            Error::TokenNotFound => 406,
            Error::TokenExpired => 407,
            Error::NotInitialized => 408,
            Error::AlreadyInitialized => 409,
            Error::ApplicationExists(_) => 410,
            Error::ApplicationNotFound(_) => 411,

            // Recovery (500-599)
            Error::RecoveryNotAuthorized => 500,
            Error::InsufficientShards { .. } => 501,
            Error::DuplicateShardIndex(_) => 502,
            Error::InvalidThreshold { .. } => 503,
            Error::ShardNotFound => 504,
            Error::AwaitingApproval => 505,

            // Storage (600-699)
            Error::StorageReadError(_) => 600,
            Error::StorageWriteError(_) => 601,
            Error::StorageCorrupted(_) => 602,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
            Error::DeserializationError(_) => 902,
        }
    }

    /// Check if retrying the same call could succeed
    ///
    /// Only transient store failures qualify. Every cryptographic failure is
    /// permanent for its inputs.
    pub fn is_retry_safe(&self) -> bool {
        matches!(
            self,
            Error::StorageReadError(_) | Error::StorageWriteError(_)
        )
    }

    /// Check if the caller should log this as a potential attack
    pub fn is_attack_signal(&self) -> bool {
        matches!(
            self,
            Error::ReplayDetected { .. }
                | Error::ChecksumMismatch
                | Error::NonceNotFound
                | Error::RecoveryNotAuthorized
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::DeserializationError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::InvalidConfig("test".into()).code(), 100);
        assert_eq!(Error::DecryptionFailed.code(), 202);
        assert_eq!(Error::UnknownKey(7).code(), 300);
        assert_eq!(Error::PasswordMismatch.code(), 402);
        assert_eq!(Error::RecoveryNotAuthorized.code(), 500);
        assert_eq!(Error::StorageReadError("test".into()).code(), 600);
        assert_eq!(Error::Internal("test".into()).code(), 900);
    }

    #[test]
    fn test_retry_safe_errors() {
        assert!(Error::StorageWriteError("disk full".into()).is_retry_safe());
        assert!(!Error::DecryptionFailed.is_retry_safe());
        assert!(!Error::PasswordMismatch.is_retry_safe());
    }

    #[test]
    fn test_attack_signals() {
        assert!(Error::ReplayDetected {
            nonce: 3,
            last_nonce: 5
        }
        .is_attack_signal());
        assert!(Error::RecoveryNotAuthorized.is_attack_signal());
        assert!(!Error::TokenExpired.is_attack_signal());
    }

    #[test]
    fn test_decryption_failed_has_no_detail() {
        assert_eq!(Error::DecryptionFailed.to_string(), "Decryption failed");
    }
}
