//! PBKDF2-HMAC-SHA256 derivation for passwords and PINs.
//!
//! The salt is 32 random bytes stored hex encoded; the hex text itself is the
//! PBKDF2 salt input, which keeps records written by older deployments valid.
//!
//! A hash derived at the default cost is stored as plain hex. Any other cost
//! is carried in the hash itself as `<rounds>$<hex>`.

use crate::config::MIN_PBKDF2_ITERATIONS;
use rand::{rngs::OsRng, RngCore};
use ring::pbkdf2;
use std::num::NonZeroU32;

#[cfg(test)]
thread_local! {
    static DERIVATIONS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Derivations run on this thread so far.
#[cfg(test)]
pub(crate) fn derivations() -> usize {
    DERIVATIONS.with(std::cell::Cell::get)
}

fn counted() {
    #[cfg(test)]
    DERIVATIONS.with(|count| count.set(count.get() + 1));
}

pub const SALT_LEN: usize = 32;
pub const HASH_LEN: usize = 32;

const PBKDF2_ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

// Used when the user does not exist, so a miss costs the same derivations.
const DUMMY_SALT: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Fresh per-user salt, hex encoded.
#[must_use]
pub fn generate_salt() -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    hex::encode(salt)
}

fn iterations(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value.max(MIN_PBKDF2_ITERATIONS)).unwrap_or(NonZeroU32::MIN)
}

/// Cost and hex digest of a stored hash. Costs below the floor are raised.
#[must_use]
pub fn stored_cost(stored: &str) -> Option<(u32, &str)> {
    match stored.split_once('$') {
        None => Some((MIN_PBKDF2_ITERATIONS, stored)),
        Some((rounds, digest)) => rounds
            .parse::<u32>()
            .ok()
            .map(|rounds| (rounds.max(MIN_PBKDF2_ITERATIONS), digest)),
    }
}

/// Derive the stored form of `secret` hashed under `salt`.
#[must_use]
pub fn derive(secret: &str, salt: &str, rounds: u32) -> String {
    counted();
    let rounds = iterations(rounds);
    let mut out = [0u8; HASH_LEN];
    pbkdf2::derive(
        PBKDF2_ALGORITHM,
        rounds,
        salt.as_bytes(),
        secret.as_bytes(),
        &mut out,
    );
    if rounds.get() == MIN_PBKDF2_ITERATIONS {
        hex::encode(out)
    } else {
        format!("{rounds}${}", hex::encode(out))
    }
}

/// Constant-time check of `secret` against a stored hash, at the cost the
/// hash was derived with.
#[must_use]
pub fn verify(secret: &str, salt: &str, stored: &str) -> bool {
    let Some((rounds, digest)) = stored_cost(stored) else {
        return false;
    };
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    counted();
    pbkdf2::verify(
        PBKDF2_ALGORITHM,
        iterations(rounds),
        salt.as_bytes(),
        secret.as_bytes(),
        &expected,
    )
    .is_ok()
}

/// Burn the password and PIN derivations of a real check without a record.
pub fn dummy_verify(password: &str, pin: &str, rounds: u32) {
    let _ = derive(password, DUMMY_SALT, rounds);
    let _ = derive(pin, DUMMY_SALT, rounds);
}
