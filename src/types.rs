//! Request and response types for the authentication operations.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// A login attempt. `ip_address` and `user_agent` come from the transport
/// layer; they feed rate limiting, session anomaly checks, and audit.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub identifier: String,
    pub secret: SecretString,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// A successful login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_in_seconds: i64,
    /// Active sessions for this identity, including the one just created.
    pub session_count: i64,
    pub must_change_password: bool,
    /// Sessions retired by the anomaly check during this login.
    pub invalidated_sessions: usize,
}

/// A password change for an authenticated identity.
#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_secret: SecretString,
    pub new_secret: SecretString,
}

/// A completed password change. All previously issued tokens are invalid
/// from here on: sessions are revoked and the credential version advanced.
#[derive(Debug, Clone, Serialize)]
pub struct ChangePasswordResponse {
    pub auth_version: i64,
    pub sessions_revoked: usize,
}
