//! Second-factor challenges.
//!
//! An emailed one-time code and a TOTP value are two strategies for the same
//! short-lived proof of possession; both implement [`ProofStrategy`].

pub mod delivery;
pub mod email_code;
pub mod totp;

pub use delivery::{DeliveryChannel, FailingDelivery, LogDelivery, RecordingDelivery};
pub use email_code::{EmailCodeStrategy, IssuedCode};
pub use totp::{TotpEnrollment, TotpStrategy};

use crate::{clock::Clock, config::AuthConfig, error::AuthError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

pub trait ProofStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check `submitted` for `username`.
    ///
    /// # Errors
    /// `ChallengeAbsent`, `ChallengeExpired` or `ChallengeMismatch`.
    fn verify(&self, username: &str, submitted: &str) -> Result<(), AuthError>;
}

pub(crate) fn codes_match(expected: &str, submitted: &str) -> bool {
    expected.as_bytes().ct_eq(submitted.trim().as_bytes()).into()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    EmailCode,
    Totp,
}

impl ProofKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmailCode => "email_code",
            Self::Totp => "totp",
        }
    }
}

/// Result of issuing an emailed code.
#[derive(Clone, Debug)]
pub struct IssuedChallenge {
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub delivered: bool,
}

pub struct TwoFactorChallenge {
    email: EmailCodeStrategy,
    totp: TotpStrategy,
    delivery: Arc<dyn DeliveryChannel>,
    ttl_seconds: u64,
}

impl TwoFactorChallenge {
    #[must_use]
    pub fn new(
        config: &AuthConfig,
        delivery: Arc<dyn DeliveryChannel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            email: EmailCodeStrategy::new(config, clock.clone()),
            totp: TotpStrategy::new(config.totp_issuer().to_string(), clock),
            delivery,
            ttl_seconds: config.challenge_ttl_seconds(),
        }
    }

    /// Store a new code for `username` and send it to `address`.
    ///
    /// The code is stored before delivery and stays valid if delivery fails;
    /// `delivered` tells the caller whether a fallback is needed.
    #[must_use]
    pub fn issue(&self, username: &str, address: &str) -> IssuedChallenge {
        let IssuedCode {
            code, expires_at, ..
        } = self.email.issue(username);

        let body = delivery::verification_body(username, &code, self.ttl_seconds);
        let delivered = match self
            .delivery
            .send(address, delivery::VERIFICATION_SUBJECT, &body)
        {
            Ok(()) => true,
            Err(e) => {
                warn!(username, "Failed to deliver verification code: {e:#}");
                false
            }
        };

        IssuedChallenge {
            code,
            expires_at,
            delivered,
        }
    }

    #[must_use]
    pub fn strategy(&self, kind: ProofKind) -> &dyn ProofStrategy {
        match kind {
            ProofKind::EmailCode => &self.email,
            ProofKind::Totp => &self.totp,
        }
    }

    /// # Errors
    /// See [`ProofStrategy::verify`].
    pub fn verify(&self, kind: ProofKind, username: &str, submitted: &str) -> Result<(), AuthError> {
        self.strategy(kind).verify(username, submitted)
    }

    #[must_use]
    pub fn email(&self) -> &EmailCodeStrategy {
        &self.email
    }

    #[must_use]
    pub fn totp(&self) -> &TotpStrategy {
        &self.totp
    }

    pub fn sweep(&self) -> usize {
        self.email.sweep()
    }
}
