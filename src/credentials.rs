//! Credential verification with lazy algorithm migration.
//!
//! Stored hashes are self-describing, so the verifier detects the algorithm
//! from the hash itself: argon2id (current), bcrypt (legacy, verified and
//! flagged for upgrade), or a bare 32-char hex digest (deprecated fast hash,
//! gated behind an explicit opt-in). Verification of the fast hash uses a
//! fixed-time comparison; argon2 and bcrypt already compare in constant time
//! internally.

use anyhow::{Context, Result, anyhow};
use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

const ARGON2_MEMORY_KIB: u32 = 65536;
const ARGON2_ITERATIONS: u32 = 3;
const ARGON2_PARALLELISM: u32 = 2;
const ARGON2_OUTPUT_LEN: usize = 32;
const LEGACY_DIGEST_HEX_LEN: usize = 32;

/// Hash algorithm detected from a stored credential string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Argon2id,
    Bcrypt,
    LegacyFast,
    Unknown,
}

/// Outcome of a password verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub valid: bool,
    /// Set when the password verified against a legacy hash; the caller
    /// re-hashes with the current algorithm and persists on the same request.
    pub needs_upgrade: bool,
}

impl VerifyOutcome {
    const INVALID: Self = Self {
        valid: false,
        needs_upgrade: false,
    };
}

/// Detects the stored hash algorithm, verifies passwords, and produces
/// current-generation hashes for new or migrated credentials.
#[derive(Debug, Clone)]
pub struct CredentialVerifier {
    allow_insecure_legacy: bool,
}

impl CredentialVerifier {
    #[must_use]
    pub fn new(allow_insecure_legacy: bool) -> Self {
        Self {
            allow_insecure_legacy,
        }
    }

    /// Detect the algorithm from the self-describing hash string.
    #[must_use]
    pub fn detect(stored: &str) -> HashAlgorithm {
        if stored.starts_with("$argon2id$") {
            return HashAlgorithm::Argon2id;
        }
        if is_bcrypt_hash(stored) {
            return HashAlgorithm::Bcrypt;
        }
        if stored.len() == LEGACY_DIGEST_HEX_LEN
            && stored.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return HashAlgorithm::LegacyFast;
        }
        HashAlgorithm::Unknown
    }

    /// Verify a plaintext password against a stored hash.
    ///
    /// Unknown formats and malformed hashes are reported as invalid, never
    /// as errors, so a corrupted credential row behaves like a wrong password.
    #[must_use]
    pub fn verify(&self, plaintext: &SecretString, stored: &str) -> VerifyOutcome {
        if stored.is_empty() {
            return VerifyOutcome::INVALID;
        }

        match Self::detect(stored) {
            HashAlgorithm::Argon2id => VerifyOutcome {
                valid: verify_argon2id(plaintext.expose_secret(), stored),
                needs_upgrade: false,
            },
            HashAlgorithm::Bcrypt => {
                let valid = bcrypt::verify(plaintext.expose_secret(), stored).unwrap_or_else(|err| {
                    debug!("bcrypt verification failed to parse stored hash: {err}");
                    false
                });
                VerifyOutcome {
                    valid,
                    needs_upgrade: valid,
                }
            }
            HashAlgorithm::LegacyFast => {
                if !self.allow_insecure_legacy {
                    return VerifyOutcome::INVALID;
                }
                let valid = verify_legacy_fast(plaintext.expose_secret(), stored);
                VerifyOutcome {
                    valid,
                    needs_upgrade: valid,
                }
            }
            HashAlgorithm::Unknown => VerifyOutcome::INVALID,
        }
    }

    /// Hash a plaintext password with the current-generation algorithm.
    ///
    /// The output encodes algorithm id, version, and cost parameters, so
    /// parameter changes remain verifiable against old hashes.
    ///
    /// # Errors
    ///
    /// Returns an error if the crypto backend rejects the parameters.
    pub fn hash(&self, plaintext: &SecretString) -> Result<String> {
        let params = Params::new(
            ARGON2_MEMORY_KIB,
            ARGON2_ITERATIONS,
            ARGON2_PARALLELISM,
            Some(ARGON2_OUTPUT_LEN),
        )
        .map_err(|err| anyhow!("invalid argon2 parameters: {err}"))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let salt = SaltString::generate(&mut OsRng);
        let hash = argon2
            .hash_password(plaintext.expose_secret().as_bytes(), &salt)
            .map_err(|err| anyhow!("argon2 hashing failed: {err}"))
            .context("failed to hash password")?;
        Ok(hash.to_string())
    }
}

fn is_bcrypt_hash(stored: &str) -> bool {
    ["$2a$", "$2b$", "$2y$", "$2x$"]
        .iter()
        .any(|prefix| stored.starts_with(prefix))
}

fn verify_argon2id(plaintext: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        debug!("stored argon2id hash failed to parse");
        return false;
    };
    // Cost parameters come from the hash string, not from our defaults.
    Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .is_ok()
}

fn verify_legacy_fast(plaintext: &str, stored: &str) -> bool {
    let Ok(expected) = hex::decode(stored) else {
        return false;
    };
    let actual = md5::compute(plaintext.as_bytes());
    fixed_time_eq(&actual.0, &expected)
}

/// Byte comparison without early exit. Length is not secret (digests are
/// fixed size); the content comparison always touches every byte.
fn fixed_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[test]
    fn detects_algorithms_by_prefix() {
        assert_eq!(
            CredentialVerifier::detect("$argon2id$v=19$m=65536,t=3,p=2$c2FsdA$aGFzaA"),
            HashAlgorithm::Argon2id
        );
        assert_eq!(
            CredentialVerifier::detect("$2b$12$abcdefghijklmnopqrstuv"),
            HashAlgorithm::Bcrypt
        );
        assert_eq!(
            CredentialVerifier::detect("5f4dcc3b5aa765d61d8327deb882cf99"),
            HashAlgorithm::LegacyFast
        );
        assert_eq!(
            CredentialVerifier::detect("plaintext-password"),
            HashAlgorithm::Unknown
        );
        // Right length, but not hex.
        assert_eq!(
            CredentialVerifier::detect("zz4dcc3b5aa765d61d8327deb882cfzz"),
            HashAlgorithm::Unknown
        );
    }

    #[test]
    fn argon2id_round_trip_embeds_parameters() {
        let verifier = CredentialVerifier::new(false);
        let hash = verifier.hash(&secret("correct horse battery")).unwrap();
        assert!(hash.starts_with("$argon2id$v=19$"));
        assert!(hash.contains("m=65536,t=3,p=2"));

        let outcome = verifier.verify(&secret("correct horse battery"), &hash);
        assert!(outcome.valid);
        assert!(!outcome.needs_upgrade);

        let outcome = verifier.verify(&secret("wrong password"), &hash);
        assert!(!outcome.valid);
    }

    #[test]
    fn bcrypt_verifies_and_signals_upgrade() {
        let stored = bcrypt::hash("hunter2-hunter2", 4).unwrap();
        let verifier = CredentialVerifier::new(false);

        let outcome = verifier.verify(&secret("hunter2-hunter2"), &stored);
        assert!(outcome.valid);
        assert!(outcome.needs_upgrade);

        let outcome = verifier.verify(&secret("wrong"), &stored);
        assert!(!outcome.valid);
        assert!(!outcome.needs_upgrade);
    }

    #[test]
    fn legacy_fast_hash_gated_behind_flag() {
        // md5("password")
        let stored = "5f4dcc3b5aa765d61d8327deb882cf99";

        let disabled = CredentialVerifier::new(false);
        assert!(!disabled.verify(&secret("password"), stored).valid);

        let enabled = CredentialVerifier::new(true);
        let outcome = enabled.verify(&secret("password"), stored);
        assert!(outcome.valid);
        assert!(outcome.needs_upgrade);
        assert!(!enabled.verify(&secret("other"), stored).valid);
    }

    #[test]
    fn unknown_and_empty_hashes_are_invalid() {
        let verifier = CredentialVerifier::new(true);
        assert!(!verifier.verify(&secret("anything"), "").valid);
        assert!(!verifier.verify(&secret("anything"), "not-a-hash").valid);
    }

    #[test]
    fn fixed_time_eq_semantics() {
        assert!(fixed_time_eq(b"abc", b"abc"));
        assert!(!fixed_time_eq(b"abc", b"abd"));
        assert!(!fixed_time_eq(b"abc", b"abcd"));
    }
}
