//! Key core configuration.
//!
//! Iteration counts, RSA key parameters, TTLs and Shamir thresholds. Values
//! come from `Default`, from environment variables (`from_env`), or from the
//! host's own config file through serde.

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Length of every symmetric key, salt, hash and nonce in the hierarchy.
///
/// The binary layouts (unlock header, portable tokens, records) depend on
/// it, so it is not configurable beyond validation.
pub const SECRET_LEN: usize = 16;

/// Minimum lifetime of an RSA key pair, in hours
pub const MIN_RSA_LIFETIME_HOURS: u32 = 24;

/// Minimum number of players in a Shamir configuration
pub const MIN_SHAMIR_PLAYERS: usize = 3;

const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;

/// Configuration for the key core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeychainConfig {
    /// PBKDF2 iterations for password hashing and nonce proofs
    pub pbkdf2_iterations: u32,
    /// Length in bytes of salts, hashes, nonces and symmetric keys
    pub secret_length: usize,
    /// RSA modulus size in bits
    pub rsa_key_bits: usize,
    /// Lifetime of a newly generated RSA key, in hours
    pub rsa_min_lifetime_hours: u32,
    /// How long an issued login nonce stays valid
    pub nonce_ttl_secs: u64,
    /// How long a login or application session token stays valid
    pub token_ttl_secs: u64,
    /// Shamir total shard count (n)
    pub shamir_total_shards: usize,
    /// Shamir threshold (k)
    pub shamir_min_shards: usize,
}

impl Default for KeychainConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: 100_000,
            secret_length: SECRET_LEN,
            rsa_key_bits: 2048,
            rsa_min_lifetime_hours: MIN_RSA_LIFETIME_HOURS,
            nonce_ttl_secs: 300,
            token_ttl_secs: 14 * 24 * 3600,
            shamir_total_shards: 5,
            shamir_min_shards: 3,
        }
    }
}

impl KeychainConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults. Unparseable values are an error
    /// rather than silently falling back.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            pbkdf2_iterations: parse_var(
                &lookup,
                "ODIN_KEYS_PBKDF2_ITERATIONS",
                defaults.pbkdf2_iterations,
            )?,
            secret_length: defaults.secret_length,
            rsa_key_bits: parse_var(&lookup, "ODIN_KEYS_RSA_BITS", defaults.rsa_key_bits)?,
            rsa_min_lifetime_hours: parse_var(
                &lookup,
                "ODIN_KEYS_RSA_LIFETIME_HOURS",
                defaults.rsa_min_lifetime_hours,
            )?,
            nonce_ttl_secs: parse_var(&lookup, "ODIN_KEYS_NONCE_TTL_SECS", defaults.nonce_ttl_secs)?,
            token_ttl_secs: parse_var(&lookup, "ODIN_KEYS_TOKEN_TTL_SECS", defaults.token_ttl_secs)?,
            shamir_total_shards: parse_var(
                &lookup,
                "ODIN_KEYS_SHAMIR_TOTAL",
                defaults.shamir_total_shards,
            )?,
            shamir_min_shards: parse_var(&lookup, "ODIN_KEYS_SHAMIR_MIN", defaults.shamir_min_shards)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every value against its allowed range
    pub fn validate(&self) -> Result<()> {
        if self.pbkdf2_iterations == 0 || self.pbkdf2_iterations > MAX_PBKDF2_ITERATIONS {
            return Err(Error::InvalidConfig(format!(
                "pbkdf2_iterations must be between 1 and {}, got {}",
                MAX_PBKDF2_ITERATIONS, self.pbkdf2_iterations
            )));
        }
        if self.secret_length != SECRET_LEN {
            return Err(Error::InvalidConfig(format!(
                "secret_length must be {}, got {}",
                SECRET_LEN, self.secret_length
            )));
        }
        if !(2048..=8192).contains(&self.rsa_key_bits) {
            return Err(Error::InvalidConfig(format!(
                "rsa_key_bits must be between 2048 and 8192, got {}",
                self.rsa_key_bits
            )));
        }
        if self.rsa_min_lifetime_hours < MIN_RSA_LIFETIME_HOURS {
            return Err(Error::LifetimeTooShort {
                minimum: MIN_RSA_LIFETIME_HOURS,
                requested: self.rsa_min_lifetime_hours,
            });
        }
        if self.nonce_ttl_secs == 0 || self.token_ttl_secs == 0 {
            return Err(Error::InvalidConfig("TTLs must be non-zero".into()));
        }
        validate_threshold(self.shamir_total_shards, self.shamir_min_shards)
    }
}

/// Check a Shamir `(n, k)` pair: at least three players, `2 <= k <= n <= 255`
pub fn validate_threshold(total: usize, threshold: usize) -> Result<()> {
    if total < MIN_SHAMIR_PLAYERS || total > 255 || threshold < 2 || threshold > total {
        return Err(Error::InvalidThreshold { threshold, total });
    }
    Ok(())
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("{} is not a valid value: {:?}", name, raw))),
        None => Ok(default),
    }
}
