//! Typed failure taxonomy surfaced to callers.
//!
//! Every user-facing failure carries enough structure for the transport
//! layer to build its response without re-deriving state: remaining-attempt
//! hints, lock duration, retry-after seconds. Internal faults in side
//! channels (audit writes, cache warm-up) are logged and swallowed at the
//! point of failure and never reach this enum.

use thiserror::Error;

/// Failures surfaced by the authentication core.
///
/// Bad credentials and unknown identities both map to [`AuthError::Unauthenticated`]
/// with identical shape, so callers cannot enumerate accounts.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed request input.
    #[error("{0}")]
    InvalidInput(String),

    /// Invalid credentials or unknown identity.
    #[error("Invalid credentials")]
    Unauthenticated {
        /// Attempts left before lockout, included once the hint threshold is reached.
        remaining_attempts: Option<u32>,
        /// Human-readable warning once few attempts remain.
        warning: Option<String>,
    },

    /// The identity is temporarily locked out.
    #[error("Account is temporarily locked; try again in {remaining_minutes} minute(s)")]
    Locked { remaining_minutes: u64 },

    /// Too many requests from this identifier.
    #[error("Too many requests; retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    /// Account exists but may not log in (frozen or deleted).
    #[error("{0}")]
    Forbidden(String),

    /// A concurrent login for the same identity is already being processed.
    #[error("Login request is already being processed; try again shortly")]
    Conflict,

    /// Hash-chain or archive verification mismatch. Reported for operator
    /// action only; never auto-corrected.
    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),

    /// Unexpected internal fault (storage, crypto backend).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// HTTP status code the transport layer should use for this failure.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::Unauthenticated { .. } => 401,
            Self::Forbidden(_) => 403,
            Self::Conflict => 409,
            Self::Locked { .. } => 423,
            Self::RateLimited { .. } => 429,
            Self::IntegrityFailure(_) | Self::Internal(_) => 500,
        }
    }

    pub(crate) fn invalid_credentials() -> Self {
        Self::Unauthenticated {
            remaining_attempts: None,
            warning: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AuthError;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            AuthError::InvalidInput("bad".to_string()).status_code(),
            400
        );
        assert_eq!(AuthError::invalid_credentials().status_code(), 401);
        assert_eq!(
            AuthError::Forbidden("frozen".to_string()).status_code(),
            403
        );
        assert_eq!(AuthError::Conflict.status_code(), 409);
        assert_eq!(
            AuthError::Locked {
                remaining_minutes: 30
            }
            .status_code(),
            423
        );
        assert_eq!(
            AuthError::RateLimited {
                retry_after_seconds: 60
            }
            .status_code(),
            429
        );
        assert_eq!(
            AuthError::IntegrityFailure("hash mismatch".to_string()).status_code(),
            500
        );
    }

    #[test]
    fn unauthenticated_message_does_not_leak_identity_state() {
        let unknown = AuthError::invalid_credentials();
        let wrong_password = AuthError::Unauthenticated {
            remaining_attempts: None,
            warning: None,
        };
        assert_eq!(unknown.to_string(), wrong_password.to_string());
    }
}
