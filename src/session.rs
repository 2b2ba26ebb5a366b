//! Session tokens with a sliding idle timeout.
//!
//! ```text
//! Active --(idle > timeout)------> Expired
//! Active --(binding mismatch)----> Revoked
//! Active --(revoke / logout)-----> Revoked
//! ```
//!
//! Expired and revoked sessions are deleted; a new `create` is the only way
//! back to `Active`. Only the SHA-256 of a token is kept in the table.

use crate::{clock::Clock, config::AuthConfig, context::SessionBinding, error::AuthError};
use anyhow::Context;
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

const TOKEN_BYTES: usize = 32;
const LOG_PREFIX_LEN: usize = 6;

#[derive(Clone, Debug)]
struct Session {
    username: String,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    binding: Option<SessionBinding>,
}

/// Session state handed back to callers; never contains the token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub bound: bool,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            username: session.username.clone(),
            created_at: session.created_at,
            last_activity: session.last_activity,
            bound: session.binding.is_some(),
        }
    }
}

/// Create a new random session token (256 bits, base64url).
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_session_token() -> anyhow::Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Hash a session token so the raw value is never stored.
#[must_use]
pub fn hash_session_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Short token prefix that is safe to log.
#[must_use]
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(LOG_PREFIX_LEN).collect();
    format!("{prefix}…")
}

pub struct SessionManager {
    sessions: DashMap<String, Session>,
    idle_timeout: TimeDelta,
    max_lifetime: Option<TimeDelta>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: &AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout: config.session_idle_timeout(),
            max_lifetime: config.session_max_lifetime(),
            clock,
        }
    }

    /// Start a session for `username`, optionally pinned to a binding.
    ///
    /// # Errors
    /// [`AuthError::Internal`] if no token could be generated.
    pub fn create(
        &self,
        username: &str,
        binding: Option<SessionBinding>,
    ) -> Result<String, AuthError> {
        let now = self.clock.now();
        let session = Session {
            username: username.to_string(),
            created_at: now,
            last_activity: now,
            binding,
        };

        loop {
            let token = generate_session_token()?;
            match self.sessions.entry(hash_session_token(&token)) {
                Entry::Occupied(_) => {
                    warn!("session token collision, regenerating");
                }
                Entry::Vacant(slot) => {
                    slot.insert(session);
                    info!(username, token = %redact(&token), "session created");
                    return Ok(token);
                }
            }
        }
    }

    /// Check a token and slide its idle window forward.
    ///
    /// A bound session presented with a different (or no) binding is treated
    /// as stolen and deleted.
    ///
    /// # Errors
    /// [`AuthError::SessionNotFound`], [`AuthError::SessionBindingViolation`]
    /// or [`AuthError::SessionExpired`].
    pub fn validate(
        &self,
        token: &str,
        binding: Option<&SessionBinding>,
    ) -> Result<SessionInfo, AuthError> {
        let now = self.clock.now();
        // Holding the entry makes check-and-renew indivisible per token.
        let Entry::Occupied(mut entry) = self.sessions.entry(hash_session_token(token)) else {
            return Err(AuthError::SessionNotFound);
        };

        let mismatch = entry
            .get()
            .binding
            .as_ref()
            .is_some_and(|expected| binding != Some(expected));
        if mismatch {
            let session = entry.remove();
            warn!(
                username = %session.username,
                token = %redact(token),
                expected_origin = session.binding.as_ref().map_or("none", |b| b.origin.as_str()),
                presented_origin = binding.map_or("none", |b| b.origin.as_str()),
                "session binding mismatch, session revoked"
            );
            return Err(AuthError::SessionBindingViolation);
        }

        let session = entry.get();
        let idle_expired = now - session.last_activity > self.idle_timeout;
        let lifetime_expired = self
            .max_lifetime
            .is_some_and(|max| now - session.created_at > max);
        if idle_expired || lifetime_expired {
            let session = entry.remove();
            debug!(
                username = %session.username,
                token = %redact(token),
                idle_expired,
                lifetime_expired,
                "session expired"
            );
            return Err(AuthError::SessionExpired);
        }

        let session = entry.get_mut();
        session.last_activity = session.last_activity.max(now);
        Ok(SessionInfo::from(&*session))
    }

    /// Delete one session. Returns false if it was already gone.
    pub fn revoke(&self, token: &str) -> bool {
        let removed = self.sessions.remove(&hash_session_token(token));
        if let Some((_, session)) = &removed {
            info!(username = %session.username, token = %redact(token), "session revoked");
        }
        removed.is_some()
    }

    /// Delete every session of `username`. Returns how many were removed.
    pub fn revoke_all(&self, username: &str) -> usize {
        self.revoke_matching(username, None)
    }

    /// Delete every session of `username` except the one for `keep_token`.
    pub fn revoke_others(&self, username: &str, keep_token: &str) -> usize {
        self.revoke_matching(username, Some(hash_session_token(keep_token)))
    }

    fn revoke_matching(&self, username: &str, keep: Option<String>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|key, session| {
            session.username != username || keep.as_deref() == Some(key.as_str())
        });
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!(username, removed, "sessions revoked");
        }
        removed
    }

    #[must_use]
    pub fn sessions_of(&self, username: &str) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|session| session.username == username)
            .map(|session| SessionInfo::from(session.value()))
            .collect();
        sessions.sort_by_key(|session| session.created_at);
        sessions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions that can no longer validate.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            now - session.last_activity <= self.idle_timeout
                && self
                    .max_lifetime
                    .is_none_or(|max| now - session.created_at <= max)
        });
        before.saturating_sub(self.sessions.len())
    }
}
