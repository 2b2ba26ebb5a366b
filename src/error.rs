use thiserror::Error;

/// Failures surfaced by the security core.
///
/// `Display` carries the detailed reason for logs and audit entries. Callers
/// facing end users must use [`AuthError::public_message`], which collapses
/// credential and session failures into one generic denial.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account locked: {remaining_seconds}s remaining")]
    AccountLocked { remaining_seconds: u64 },
    #[error("origin blocked")]
    OriginBlocked,
    #[error("honeypot path requested")]
    HoneypotTriggered,
    #[error("no challenge pending")]
    ChallengeAbsent,
    #[error("challenge expired")]
    ChallengeExpired,
    #[error("challenge code mismatch")]
    ChallengeMismatch,
    #[error("session not found")]
    SessionNotFound,
    #[error("session expired")]
    SessionExpired,
    #[error("session binding violation")]
    SessionBindingViolation,
    #[error("permission denied")]
    PermissionDenied,
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
    #[error("user already exists")]
    UserExists,
    #[error("unknown user")]
    UnknownUser,
    #[error("secret rejected by policy: {}", reasons.join("; "))]
    WeakSecret { reasons: Vec<String> },
    #[error("webauthn assertion rejected: {0}")]
    AssertionRejected(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Message safe to show to an unauthenticated caller.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidCredentials
            | Self::ChallengeAbsent
            | Self::ChallengeExpired
            | Self::ChallengeMismatch
            | Self::AssertionRejected(_)
            | Self::UnknownUser => "Invalid credentials",
            Self::SessionNotFound | Self::SessionExpired | Self::SessionBindingViolation => {
                "Authentication required"
            }
            Self::AccountLocked { .. } | Self::OriginBlocked => {
                "Too many attempts, try again later"
            }
            Self::PermissionDenied => "Access denied",
            Self::HoneypotTriggered => "Not found",
            Self::UserExists => "User already exists",
            Self::WeakSecret { .. } => "Secret does not meet the policy",
            Self::PersistenceUnavailable(_) | Self::Internal(_) => "Service unavailable",
        }
    }

    /// True for the failures that must count toward lockout.
    #[must_use]
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials
                | Self::ChallengeMismatch
                | Self::AssertionRejected(_)
        )
    }
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}
