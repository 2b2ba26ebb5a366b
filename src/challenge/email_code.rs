//! One-time codes delivered out of band.

use super::{codes_match, ProofStrategy};
use crate::{clock::Clock, config::AuthConfig, error::AuthError};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use rand::{rngs::OsRng, Rng};
use std::sync::Arc;
use tracing::{debug, warn};

const CODE_MIN: u32 = 100_000;
const CODE_MAX: u32 = 999_999;

#[derive(Debug)]
struct PendingCode {
    code: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    mismatches: u32,
}

/// A freshly issued code, handed to the delivery step.
#[derive(Clone, Debug)]
pub struct IssuedCode {
    pub code: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// At most one live code per username. A code is consumed by a match, by
/// expiry, or once the mismatch budget is spent.
pub struct EmailCodeStrategy {
    pending: DashMap<String, PendingCode>,
    ttl: TimeDelta,
    max_mismatches: u32,
    clock: Arc<dyn Clock>,
}

impl EmailCodeStrategy {
    #[must_use]
    pub fn new(config: &AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            pending: DashMap::new(),
            ttl: config.challenge_ttl(),
            max_mismatches: config.challenge_max_mismatches(),
            clock,
        }
    }

    /// Generate a code for `username`, replacing any live one.
    #[must_use]
    pub fn issue(&self, username: &str) -> IssuedCode {
        let code = OsRng.gen_range(CODE_MIN..=CODE_MAX).to_string();
        let issued_at = self.clock.now();
        let expires_at = issued_at + self.ttl;

        let replaced = self
            .pending
            .insert(
                username.to_string(),
                PendingCode {
                    code: code.clone(),
                    issued_at,
                    expires_at,
                    mismatches: 0,
                },
            )
            .is_some();
        debug!(username, replaced, "verification code issued");

        IssuedCode {
            code,
            issued_at,
            expires_at,
        }
    }

    #[must_use]
    pub fn has_pending(&self, username: &str) -> bool {
        let now = self.clock.now();
        self.pending
            .get(username)
            .is_some_and(|pending| now <= pending.expires_at)
    }

    /// Drop a pending code without verifying it.
    pub fn cancel(&self, username: &str) {
        self.pending.remove(username);
    }

    /// Drop every expired code.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.pending.len();
        self.pending.retain(|_, pending| now <= pending.expires_at);
        before.saturating_sub(self.pending.len())
    }
}

impl ProofStrategy for EmailCodeStrategy {
    fn name(&self) -> &'static str {
        "email_code"
    }

    fn verify(&self, username: &str, submitted: &str) -> Result<(), AuthError> {
        let now = self.clock.now();
        // The entry guard makes check-and-consume indivisible per username.
        let Entry::Occupied(mut entry) = self.pending.entry(username.to_string()) else {
            return Err(AuthError::ChallengeAbsent);
        };

        if now > entry.get().expires_at {
            let pending = entry.remove();
            debug!(
                username,
                age = (now - pending.issued_at).num_seconds(),
                "verification code expired"
            );
            return Err(AuthError::ChallengeExpired);
        }

        if codes_match(&entry.get().code, submitted) {
            entry.remove();
            return Ok(());
        }

        let pending = entry.get_mut();
        pending.mismatches += 1;
        if pending.mismatches >= self.max_mismatches {
            entry.remove();
            warn!(username, "verification code discarded after repeated mismatches");
        }
        Err(AuthError::ChallengeMismatch)
    }
}
