//! Salted password hashing for account credentials
//!
//! Stored format is `hex(salt):hex(hash)` where the hash is
//! PBKDF2-HMAC-SHA512 over the plaintext with a 16 byte random salt.

use std::num::NonZeroU32;

use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 64;
const ITERATIONS: u32 = 100_000;

static ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA512;

#[derive(Debug, Error)]
#[error("system random source unavailable")]
pub struct RandomUnavailable;

fn iterations() -> NonZeroU32 {
    NonZeroU32::new(ITERATIONS).unwrap_or(NonZeroU32::MIN)
}

/// Hash a plaintext password with a fresh random salt
pub fn generate_password(plain: impl AsRef<[u8]>) -> Result<String, RandomUnavailable> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| RandomUnavailable)?;

    let mut hash = [0u8; HASH_LEN];
    pbkdf2::derive(ALGORITHM, iterations(), &salt, plain.as_ref(), &mut hash);

    Ok(format!("{}:{}", hex::encode(salt), hex::encode(hash)))
}

/// Check a plaintext password against a stored `salt:hash` string
///
/// The plaintext is compared as raw bytes, whatever its encoding. Any
/// malformed stored value yields `false`. The comparison runs in constant
/// time with respect to the stored hash.
pub fn validate_password(stored: &str, plain: impl AsRef<[u8]>) -> bool {
    let Some((salt_hex, hash_hex)) = stored.split_once(':') else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (hex::decode(salt_hex), hex::decode(hash_hex)) else {
        return false;
    };
    if salt.is_empty() || hash.len() != HASH_LEN {
        return false;
    }

    pbkdf2::verify(ALGORITHM, iterations(), &salt, plain.as_ref(), &hash).is_ok()
}
