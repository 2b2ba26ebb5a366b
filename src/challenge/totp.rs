//! RFC 6238 time-based codes from a per-user shared secret.

use super::{codes_match, ProofStrategy};
use crate::{clock::Clock, error::AuthError};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{debug, info};

pub const TOTP_DIGITS: usize = 6;
pub const TOTP_STEP_SECONDS: u64 = 30;
// Steps checked around the current one, in order.
const STEP_OFFSETS: [i64; 3] = [-1, 0, 1];

#[derive(Debug)]
struct TotpState {
    secret: Vec<u8>,
    last_step: Option<u64>,
}

/// What the user needs to configure an authenticator app.
#[derive(Clone, Debug, Serialize)]
pub struct TotpEnrollment {
    pub secret_base32: String,
    pub otpauth_url: String,
}

pub struct TotpStrategy {
    secrets: DashMap<String, TotpState>,
    issuer: String,
    clock: Arc<dyn Clock>,
}

fn build_totp(secret: Vec<u8>, issuer: &str, username: &str) -> Result<TOTP, AuthError> {
    // ':' separates issuer and account in otpauth labels.
    let account = username.replace(':', "_");
    TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        0,
        TOTP_STEP_SECONDS,
        secret,
        Some(issuer.to_string()),
        account,
    )
    .map_err(|e| AuthError::Internal(format!("TOTP init error: {e}")))
}

impl TotpStrategy {
    #[must_use]
    pub fn new(issuer: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            secrets: DashMap::new(),
            issuer,
            clock,
        }
    }

    /// Generate and install a fresh 160-bit secret.
    ///
    /// # Errors
    /// [`AuthError::Internal`] if the secret cannot be materialised.
    pub fn enroll(&self, username: &str) -> Result<TotpEnrollment, AuthError> {
        let secret = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| AuthError::Internal(format!("Secret gen error: {e}")))?;
        let totp = build_totp(secret.clone(), &self.issuer, username)?;

        self.secrets.insert(
            username.to_string(),
            TotpState {
                secret,
                last_step: None,
            },
        );
        info!(username, "totp enrolled");

        Ok(TotpEnrollment {
            secret_base32: totp.get_secret_base32(),
            otpauth_url: totp.get_url(),
        })
    }

    /// Install an existing base32 secret.
    ///
    /// # Errors
    /// [`AuthError::WeakSecret`] if the secret is not valid base32 of at
    /// least 128 bits.
    pub fn set_secret(&self, username: &str, secret_base32: &str) -> Result<(), AuthError> {
        let secret = Secret::Encoded(secret_base32.trim().to_uppercase())
            .to_bytes()
            .map_err(|_| AuthError::WeakSecret {
                reasons: vec!["TOTP secret must be base32".to_string()],
            })?;
        build_totp(secret.clone(), &self.issuer, username).map_err(|_| AuthError::WeakSecret {
            reasons: vec!["TOTP secret must be at least 128 bits".to_string()],
        })?;
        self.secrets.insert(
            username.to_string(),
            TotpState {
                secret,
                last_step: None,
            },
        );
        Ok(())
    }

    pub fn disable(&self, username: &str) {
        if self.secrets.remove(username).is_some() {
            info!(username, "totp disabled");
        }
    }

    #[must_use]
    pub fn is_enrolled(&self, username: &str) -> bool {
        self.secrets.contains_key(username)
    }

    fn current_step(&self) -> u64 {
        u64::try_from(self.clock.now().timestamp()).unwrap_or(0) / TOTP_STEP_SECONDS
    }
}

impl ProofStrategy for TotpStrategy {
    fn name(&self) -> &'static str {
        "totp"
    }

    fn verify(&self, username: &str, submitted: &str) -> Result<(), AuthError> {
        let current = self.current_step();
        // Held for the whole check so one step cannot be accepted twice.
        let mut state = self
            .secrets
            .get_mut(username)
            .ok_or(AuthError::ChallengeAbsent)?;
        let totp = build_totp(state.secret.clone(), &self.issuer, username)?;

        for offset in STEP_OFFSETS {
            let Some(step) = current.checked_add_signed(offset) else {
                continue;
            };
            if state.last_step.is_some_and(|last| step <= last) {
                continue;
            }
            if codes_match(&totp.generate(step * TOTP_STEP_SECONDS), submitted) {
                state.last_step = Some(step);
                return Ok(());
            }
        }

        debug!(username, "totp mismatch");
        Err(AuthError::ChallengeMismatch)
    }
}
