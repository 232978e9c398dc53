//! # Gardisto (Authentication & Trust-Integrity Core)
//!
//! `gardisto` is the authentication core of the supplier platform. It owns
//! credential verification, brute-force defense, session lifecycle, token
//! revocation, and the tamper-evident audit trail. Business-entity CRUD,
//! permission tables, and HTTP routing live in the surrounding application
//! and talk to this crate through [`auth::Authenticator`] and the store
//! traits in [`store`].
//!
//! ## Credential Format
//!
//! Password hashes are self-describing strings:
//!
//! - `$argon2id$v=19$m=65536,t=3,p=2$<salt>$<digest>`: current generation.
//! - `$2a$`/`$2b$`/`$2y$`/`$2x$...`: legacy bcrypt, verified transparently
//!   and re-hashed to argon2id on the next successful login.
//! - 32 lowercase hex chars: deprecated fast hash, verified only when
//!   [`config::AuthConfig::with_allow_insecure_legacy`] is enabled.
//!
//! ## Brute-Force Defense
//!
//! Three independent layers run in front of credential verification:
//!
//! - **Rate limiter:** sliding window per `(endpoint, identifier)`.
//! - **Lockout engine:** per-identity failure counting with a timed lock.
//! - **Login lock:** a short per-identity guard that collapses duplicate
//!   rapid-fire submissions into one processed attempt.
//!
//! ## Trust Integrity
//!
//! Sensitive audit entries carry a SHA-256 hash chained to the previous
//! sensitive entry, and are mirrored to write-once archive artifacts with a
//! detached signature sidecar. [`audit::verify_chain`] walks the chain and
//! [`audit::ColdArchive::verify`] re-hashes individual artifacts; breaks are
//! reported, never auto-corrected.
//!
//! ## Single Source of Truth
//!
//! The durable store is authoritative for sessions, revocations, and audit
//! entries. In-memory caches are read-through and positive-only: a cache
//! miss is never cached, so revocations added by another process are always
//! observed on the next check.

pub mod audit;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod lockout;
pub mod login_lock;
pub mod rate_limit;
pub mod revocation;
pub mod session;
pub mod store;
pub mod token;
pub mod types;

pub use auth::Authenticator;
pub use config::AuthConfig;
pub use error::AuthError;
