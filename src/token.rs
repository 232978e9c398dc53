//! Token issuance, decoding, and hashing.
//!
//! Tokens are HS256 JWTs. Claims carry the credential version
//! (`auth_version`) so a password change invalidates previously issued
//! tokens by version mismatch, without touching the revocation list.
//!
//! Raw tokens never reach the database: sessions and revocation entries are
//! keyed by a SHA-256 hash of the token.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const MIN_SECRET_LENGTH: usize = 32;

/// Claims embedded in issued tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Owning identity.
    pub sub: String,
    /// Credential version at issuance; token validation rejects mismatches.
    pub auth_version: i64,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// A freshly issued token plus its decoded expiry.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in_seconds: i64,
}

/// Signs and decodes tokens with a shared secret.
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    ttl_seconds: i64,
}

impl TokenCodec {
    /// # Errors
    ///
    /// Fails when the secret is shorter than 32 bytes after trimming.
    pub fn new(secret: &SecretString, issuer: String, ttl_seconds: i64) -> Result<Self> {
        let trimmed = secret.expose_secret().trim();
        if trimmed.len() < MIN_SECRET_LENGTH {
            return Err(anyhow!(
                "token secret must be at least {MIN_SECRET_LENGTH} bytes"
            ));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(trimmed.as_bytes()),
            decoding: DecodingKey::from_secret(trimmed.as_bytes()),
            issuer,
            ttl_seconds,
        })
    }

    /// Issue a token for an identity at its current credential version.
    ///
    /// # Errors
    ///
    /// Fails only on signing errors from the JWT backend.
    pub fn issue(&self, identity: &str, auth_version: i64) -> Result<IssuedToken> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.ttl_seconds);
        let claims = Claims {
            sub: identity.to_string(),
            auth_version,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .context("failed to sign token")?;
        Ok(IssuedToken {
            token,
            expires_at,
            expires_in_seconds: self.ttl_seconds,
        })
    }

    /// Decode and verify a token's signature and issuer.
    ///
    /// Expiry is *not* enforced here: revocation and pruning need the claims
    /// of already-expired tokens, and request authorization checks expiry
    /// itself against the claim.
    ///
    /// # Errors
    ///
    /// Fails on bad signature, malformed token, or issuer mismatch.
    pub fn claims(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_exp = false;
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .context("failed to decode token")?;
        Ok(data.claims)
    }

    /// Token expiry as a UTC timestamp, from the token's own claims.
    ///
    /// # Errors
    ///
    /// Fails when the token does not decode.
    pub fn expiry(&self, token: &str) -> Result<DateTime<Utc>> {
        let claims = self.claims(token)?;
        DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| anyhow!("token exp claim out of range"))
    }
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("issuer", &self.issuer)
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

/// Hash a token so raw values never touch the database.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(ttl: i64) -> TokenCodec {
        TokenCodec::new(
            &SecretString::from("an-adequately-long-signing-secret-value"),
            "gardisto".to_string(),
            ttl,
        )
        .unwrap()
    }

    #[test]
    fn rejects_short_secret() {
        let result = TokenCodec::new(&SecretString::from("short"), "gardisto".to_string(), 60);
        assert!(result.is_err());
    }

    #[test]
    fn issue_and_decode_round_trip() {
        let codec = codec(3600);
        let issued = codec.issue("user-1", 2).unwrap();
        assert_eq!(issued.expires_in_seconds, 3600);

        let claims = codec.claims(&issued.token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.auth_version, 2);
        assert_eq!(claims.exp, issued.expires_at.timestamp());
    }

    #[test]
    fn expired_tokens_still_decode() {
        let codec = codec(-60);
        let issued = codec.issue("user-1", 1).unwrap();
        let claims = codec.claims(&issued.token).unwrap();
        assert!(claims.exp < Utc::now().timestamp());
    }

    #[test]
    fn tampered_tokens_fail() {
        let codec = codec(3600);
        let issued = codec.issue("user-1", 1).unwrap();
        let mut tampered = issued.token.clone();
        tampered.push('x');
        assert!(codec.claims(&tampered).is_err());
    }

    #[test]
    fn hash_token_is_stable_hex() {
        let first = hash_token("token");
        assert_eq!(first, hash_token("token"));
        assert_ne!(first, hash_token("other"));
        assert_eq!(first.len(), 64);
        assert!(first.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
