//! Cryptographic utilities for Relaygram Server
//!
//! Everything here draws from the operating system CSPRNG:
//! - SMS verification codes and phone code hashes
//! - Access hashes for users and calls
//! - Admin password hashing (PBKDF2-HMAC-SHA256)

use rand::{rngs::OsRng, Rng};
use ring::{
    constant_time, pbkdf2,
    rand::{SecureRandom, SystemRandom},
};
use std::num::NonZeroU32;

const PHONE_CODE_HASH_LENGTH: usize = 16;
const PASSWORD_SALT_LENGTH: usize = 16;
const PASSWORD_HASH_LENGTH: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;
pub const VERIFICATION_CODE_LENGTH: usize = 6;

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    SystemRandom::new()
        .fill(&mut bytes)
        .expect("Failed to generate random bytes");
    bytes
}

/// Six decimal digits, uniformly distributed over 000000..=999999.
pub fn generate_verification_code() -> String {
    let code: u32 = OsRng.gen_range(0..1_000_000);
    format!("{:0width$}", code, width = VERIFICATION_CODE_LENGTH)
}

/// 16 random bytes, hex encoded (32 characters).
pub fn generate_phone_code_hash() -> String {
    hex::encode(random_bytes::<PHONE_CODE_HASH_LENGTH>())
}

/// A positive random 62-bit integer.
pub fn generate_access_hash() -> i64 {
    let value = u64::from_le_bytes(random_bytes::<8>()) >> 2;
    // never zero so that it is distinguishable from an unset column
    value.max(1) as i64
}

/// Compare two secrets without short-circuiting on the first mismatch.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    constant_time::verify_slices_are_equal(a.as_bytes(), b.as_bytes()).is_ok()
}

fn iterations() -> NonZeroU32 {
    NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN)
}

/// Hash an admin password for storage: `pbkdf2$<salt hex>$<hash hex>`.
pub fn hash_password(password: &str) -> String {
    let salt = random_bytes::<PASSWORD_SALT_LENGTH>();
    let mut hash = [0u8; PASSWORD_HASH_LENGTH];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations(),
        &salt,
        password.as_bytes(),
        &mut hash,
    );
    format!("pbkdf2${}${}", hex::encode(salt), hex::encode(hash))
}

/// Verify a password against a hash produced by [`hash_password`].
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some("pbkdf2"), Some(salt), Some(hash), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (hex::decode(salt), hex::decode(hash)) else {
        return false;
    };

    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations(),
        &salt,
        password.as_bytes(),
        &hash,
    )
    .is_ok()
}
