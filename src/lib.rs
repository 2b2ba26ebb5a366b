//! # Authguard (authentication and session security engine)
//!
//! `authguard` verifies local two-secret credentials (password + PIN), guards
//! them against brute force, runs second-factor challenges and issues
//! idle-expiring session tokens. Authorization is role based.
//!
//! ## Login flow
//!
//! 1. The login guard pipeline rejects blocked or throttled origins and locked
//!    identities.
//! 2. The credential store re-derives both PBKDF2 hashes from the user's salt.
//! 3. Anomalies are observed (new device, suspicious origin, unusual hour).
//! 4. When MFA applies, a one-time code is issued and delivered; the login is
//!    parked behind a short-lived ticket until a code, a TOTP value or a
//!    `WebAuthn` assertion is presented.
//! 5. A session token is minted. Only its SHA-256 hash is kept in memory.
//!
//! Every step is written to the audit log and feeds the threat monitor.
//!
//! ## Shared state
//!
//! Each table (users, attempts, challenges, sessions, blocked origins) is owned
//! by its component and sharded with `DashMap`, so read-modify-write on a key
//! (consume a code, bump a counter, renew a session) is atomic per key. No lock
//! is held while persisting or delivering.

pub mod api;
pub mod audit;
pub mod challenge;
pub mod cli;
pub mod clock;
pub mod config;
pub mod context;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod lockout;
pub mod persistence;
pub mod pipeline;
pub mod rbac;
pub mod session;
pub mod threat;
pub mod webauthn;

pub use config::AuthConfig;
pub use engine::AuthEngine;
pub use error::AuthError;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
