//! Argon2id password hashing with opportunistic rehash signaling.

use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier,
};

/// Accounts provisioned without a password (legacy invite flow) store this
/// sentinel. Callers must branch on [`is_empty_sentinel`] before calling
/// [`verify`]; the login flow sends such accounts into the password-change
/// flow instead of comparing anything.
pub const EMPTY_PASSWORD: &str = "";

#[must_use]
pub fn is_empty_sentinel(stored: &str) -> bool {
    stored.is_empty()
}

/// Outcome of comparing a plaintext against a stored hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// The password matched, but the stored hash uses weaker parameters than
    /// current policy; callers re-hash and persist without blocking login.
    ValidNeedsRehash,
    Invalid,
}

/// Hash a plaintext password into a PHC string with a fresh salt.
///
/// # Errors
///
/// Fails only on catastrophic conditions (RNG or parameter failure); callers
/// treat this as fatal for the request, not retryable.
pub fn hash(plaintext: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map(|hashed| hashed.to_string())
        .map_err(|err| anyhow!("failed to hash password: {err}"))
}

/// Verify a plaintext against a stored PHC string.
///
/// Never call with the empty-account sentinel; branch on
/// [`is_empty_sentinel`] first.
#[must_use]
pub fn verify(plaintext: &str, stored: &str) -> Verdict {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return Verdict::Invalid;
    };

    match Argon2::default().verify_password(plaintext.as_bytes(), &parsed) {
        Ok(()) => {
            if needs_rehash(&parsed) {
                Verdict::ValidNeedsRehash
            } else {
                Verdict::Valid
            }
        }
        Err(_) => Verdict::Invalid,
    }
}

/// A stored hash needs an upgrade when its algorithm or cost parameters fall
/// below current policy.
fn needs_rehash(parsed: &PasswordHash<'_>) -> bool {
    if parsed.algorithm != Algorithm::Argon2id.ident() {
        return true;
    }
    let Ok(params) = Params::try_from(parsed) else {
        return true;
    };
    let current = Params::default();
    params.m_cost() < current.m_cost()
        || params.t_cost() < current.t_cost()
        || params.p_cost() < current.p_cost()
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::Version;

    #[test]
    fn hash_then_verify_is_valid() {
        let hashed = hash("longenoughpassword123").expect("hash");
        assert_eq!(verify("longenoughpassword123", &hashed), Verdict::Valid);
    }

    #[test]
    fn wrong_password_is_invalid() {
        let hashed = hash("longenoughpassword123").expect("hash");
        assert_eq!(verify("a-different-password", &hashed), Verdict::Invalid);
    }

    #[test]
    fn hashes_are_salted() {
        let first = hash("longenoughpassword123").expect("hash");
        let second = hash("longenoughpassword123").expect("hash");
        assert_ne!(first, second);
    }

    #[test]
    fn garbage_stored_hash_is_invalid() {
        assert_eq!(verify("whatever", "not-a-phc-string"), Verdict::Invalid);
    }

    #[test]
    fn weaker_params_signal_needs_rehash() {
        let weak_params = Params::new(Params::MIN_M_COST, 1, 1, None).expect("params");
        let weak = Argon2::new(Algorithm::Argon2id, Version::V0x13, weak_params);
        let salt = SaltString::generate(&mut OsRng);
        let hashed = weak
            .hash_password(b"longenoughpassword123", &salt)
            .expect("hash")
            .to_string();

        assert_eq!(
            verify("longenoughpassword123", &hashed),
            Verdict::ValidNeedsRehash
        );
        assert_eq!(verify("wrong-password", &hashed), Verdict::Invalid);
    }

    #[test]
    fn current_params_do_not_need_rehash() {
        let hashed = hash("longenoughpassword123").expect("hash");
        let parsed = PasswordHash::new(&hashed).expect("parse");
        assert!(!needs_rehash(&parsed));
    }

    #[test]
    fn empty_sentinel_detected() {
        assert!(is_empty_sentinel(EMPTY_PASSWORD));
        assert!(is_empty_sentinel(""));
        assert!(!is_empty_sentinel("$argon2id$..."));
    }
}
