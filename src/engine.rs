//! Login orchestration on top of the individual security components.
//!
//! The engine owns every state table through its components and is the only
//! place where they are combined: guard pipeline, credential check, anomaly
//! observation, second factor, session issuance and authorization. Every
//! decision is written to the audit log.

use crate::{
    audit::{
        detail, AuditDetail, AuditEvent, AuditEventType, AuditLog, AuditOutcome, AuditSink,
        TracingAuditSink,
    },
    challenge::{
        DeliveryChannel, IssuedChallenge, LogDelivery, ProofKind, TotpEnrollment,
        TwoFactorChallenge,
    },
    clock::{Clock, SystemClock},
    config::AuthConfig,
    context::RequestContext,
    credentials::{CredentialStore, NewUser, UserProfile},
    error::AuthError,
    lockout::LockoutGuard,
    persistence::{MemoryUserRepository, UserRepository},
    pipeline::{GuardPipeline, GuardRequest},
    rbac::{self, Permission, Role},
    session::{redact, SessionInfo, SessionManager},
    threat::{Anomaly, OriginBlock, ThreatMonitor},
    webauthn::{AssertionResponse, RegisteredCredential, WebAuthnVerifier},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Primary credentials submitted at login.
#[derive(Clone, Debug, Deserialize)]
pub struct LoginCredentials {
    pub username: String,
    pub password: SecretString,
    pub pin: SecretString,
}

/// Second-factor proof presented to finish a login.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Proof {
    EmailCode { code: String },
    Totp { code: String },
    #[serde(rename = "webauthn")]
    WebAuthn { assertion: AssertionResponse },
}

impl Proof {
    const fn method(&self) -> &'static str {
        match self {
            Self::EmailCode { .. } => "email_code",
            Self::Totp { .. } => "totp",
            Self::WebAuthn { .. } => "webauthn",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginOutcome {
    Authenticated {
        username: String,
        #[serde(skip)]
        token: String,
        anomalies: Vec<Anomaly>,
    },
    ChallengeRequired {
        ticket: Uuid,
        expires_at: DateTime<Utc>,
        /// False when the code could not be sent; the code is still valid.
        delivered: bool,
        methods: Vec<&'static str>,
        anomalies: Vec<Anomaly>,
    },
}

/// An authenticated and authorized caller.
#[derive(Clone, Debug, Serialize)]
pub struct Principal {
    pub username: String,
    pub role: Role,
    pub session: SessionInfo,
}

/// Combined block state of an origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct OriginStatus {
    pub blocked: Option<OriginBlock>,
    pub throttled_for_seconds: Option<u64>,
    pub suspicious: bool,
}

impl OriginStatus {
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some() || self.throttled_for_seconds.is_some()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sessions: usize,
    pub challenges: usize,
    pub lockouts: usize,
    pub pending_logins: usize,
    pub webauthn_challenges: usize,
    pub origins: usize,
}

impl SweepReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.sessions
            + self.challenges
            + self.lockouts
            + self.pending_logins
            + self.webauthn_challenges
            + self.origins
    }
}

#[derive(Clone, Debug)]
struct PendingLogin {
    username: String,
    origin: String,
    fingerprint: String,
    expires_at: DateTime<Utc>,
}

pub struct AuthEngineBuilder {
    config: AuthConfig,
    repository: Option<Arc<dyn UserRepository>>,
    delivery: Option<Arc<dyn DeliveryChannel>>,
    audit_sinks: Vec<Arc<dyn AuditSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AuthEngineBuilder {
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn UserRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    #[must_use]
    pub fn with_delivery(mut self, delivery: Arc<dyn DeliveryChannel>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sinks.push(sink);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Load the user table and wire the components.
    ///
    /// # Errors
    /// [`AuthError::PersistenceUnavailable`] if the users cannot be loaded.
    pub fn build(self) -> Result<AuthEngine, AuthError> {
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(MemoryUserRepository::new()));
        let delivery = self.delivery.unwrap_or_else(|| Arc::new(LogDelivery));
        let audit_sinks = if self.audit_sinks.is_empty() {
            vec![Arc::new(TracingAuditSink) as Arc<dyn AuditSink>]
        } else {
            self.audit_sinks
        };
        let config = self.config;

        let credentials =
            CredentialStore::load(repository, config.pbkdf2_iterations(), clock.clone())?;
        let lockout = Arc::new(LockoutGuard::new(&config, clock.clone()));
        let threat = Arc::new(ThreatMonitor::new(&config, clock.clone()));

        Ok(AuthEngine {
            credentials,
            challenges: TwoFactorChallenge::new(&config, delivery, clock.clone()),
            sessions: SessionManager::new(&config, clock.clone()),
            webauthn: WebAuthnVerifier::new(&config, clock.clone()),
            audit: AuditLog::new(audit_sinks, clock.clone()),
            request_guard: GuardPipeline::for_requests(&threat),
            login_guard: GuardPipeline::for_login(&threat, &lockout),
            pending: DashMap::new(),
            lockout,
            threat,
            config,
            clock,
        })
    }
}

pub struct AuthEngine {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
    credentials: CredentialStore,
    lockout: Arc<LockoutGuard>,
    threat: Arc<ThreatMonitor>,
    challenges: TwoFactorChallenge,
    sessions: SessionManager,
    webauthn: WebAuthnVerifier,
    audit: AuditLog,
    request_guard: GuardPipeline,
    login_guard: GuardPipeline,
    pending: DashMap<Uuid, PendingLogin>,
}

impl AuthEngine {
    #[must_use]
    pub fn builder(config: AuthConfig) -> AuthEngineBuilder {
        AuthEngineBuilder {
            config,
            repository: None,
            delivery: None,
            audit_sinks: Vec::new(),
            clock: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub fn lockout(&self) -> &LockoutGuard {
        &self.lockout
    }

    #[must_use]
    pub fn threat(&self) -> &ThreatMonitor {
        &self.threat
    }

    #[must_use]
    pub fn challenges(&self) -> &TwoFactorChallenge {
        &self.challenges
    }

    #[must_use]
    pub fn webauthn(&self) -> &WebAuthnVerifier {
        &self.webauthn
    }

    fn audit(
        &self,
        event_type: AuditEventType,
        actor: &str,
        outcome: AuditOutcome,
        ctx: Option<&RequestContext>,
        mut detail: AuditDetail,
    ) -> AuditEvent {
        if let Some(ctx) = ctx {
            detail
                .entry("origin".to_string())
                .or_insert_with(|| ctx.origin().to_string());
            detail
                .entry("fingerprint".to_string())
                .or_insert_with(|| ctx.fingerprint().to_string());
        }
        self.audit.record(event_type, actor, outcome, detail)
    }

    /// Append a caller supplied event to the audit log.
    pub fn record_audit_event(
        &self,
        event_type: AuditEventType,
        actor: &str,
        outcome: AuditOutcome,
        detail: AuditDetail,
    ) -> AuditEvent {
        self.audit.record(event_type, actor, outcome, detail)
    }

    /// Seed an administrator into an empty user table.
    ///
    /// # Errors
    /// See [`CredentialStore::create_user`].
    pub fn bootstrap(&self, admin: &NewUser) -> Result<bool, AuthError> {
        let created = self.credentials.bootstrap(admin)?;
        if created {
            self.audit(
                AuditEventType::UserCreated,
                "bootstrap",
                AuditOutcome::Success,
                None,
                detail([
                    ("username", admin.username.clone()),
                    ("role", admin.role.to_string()),
                ]),
            );
        }
        Ok(created)
    }

    /// Run the request guard pipeline for one HTTP request.
    ///
    /// # Errors
    /// [`AuthError::OriginBlocked`] or [`AuthError::HoneypotTriggered`].
    pub fn guard_request(&self, ctx: &RequestContext, path: &str) -> Result<(), AuthError> {
        let result = self.request_guard.run(&GuardRequest::http(ctx, path));
        if result == Err(AuthError::HoneypotTriggered) {
            self.audit(
                AuditEventType::HoneypotAccess,
                "anonymous",
                AuditOutcome::Denied,
                Some(ctx),
                detail([("path", path.to_string())]),
            );
        }
        result
    }

    /// Combined origin state from the threat monitor and the login throttle.
    #[must_use]
    pub fn check_origin(&self, origin: &str) -> OriginStatus {
        OriginStatus {
            blocked: self.threat.blocked(origin),
            throttled_for_seconds: self.lockout.origin_blocked_for(origin),
            suspicious: self.threat.is_suspicious(origin),
        }
    }

    /// Lift every block on `origin`.
    pub fn clear_origin(&self, origin: &str) {
        self.threat.clear(origin);
        self.lockout.unblock_origin(origin);
        self.audit(
            AuditEventType::OriginBlocked,
            "system",
            AuditOutcome::Info,
            None,
            detail([("origin", origin.to_string()), ("action", "cleared".to_string())]),
        );
    }

    #[must_use]
    pub fn observe_login_for_anomalies(&self, username: &str, ctx: &RequestContext) -> Vec<Anomaly> {
        self.threat.observe_login(username, ctx)
    }

    /// Identity lockout check, credential verification and failure counting
    /// as one step. Every failed verification is counted exactly once.
    ///
    /// # Errors
    /// [`AuthError::AccountLocked`] or [`AuthError::InvalidCredentials`].
    pub fn verify_credentials(
        &self,
        username: &str,
        password: &str,
        pin: &str,
        ctx: &RequestContext,
    ) -> Result<(), AuthError> {
        let slot = self.lockout.begin_attempt(username)?;
        if self.credentials.verify_credentials(username, password, pin) {
            return slot.succeed();
        }
        let locked = slot.fail();
        self.count_failure(username, ctx, locked, AuditEventType::LoginFailed, "credentials");
        Err(AuthError::InvalidCredentials)
    }

    fn count_failure(
        &self,
        username: &str,
        ctx: &RequestContext,
        locked: bool,
        event_type: AuditEventType,
        stage: &str,
    ) {
        let blocked = self.threat.record_failure(ctx.origin());
        self.audit(
            event_type,
            username,
            AuditOutcome::Failure,
            Some(ctx),
            detail([("stage", stage.to_string())]),
        );
        if locked {
            self.audit(
                AuditEventType::AccountLocked,
                username,
                AuditOutcome::Denied,
                Some(ctx),
                detail([(
                    "seconds",
                    self.config.lockout_duration().num_seconds().to_string(),
                )]),
            );
            self.challenges.email().cancel(username);
            self.pending.retain(|_, pending| pending.username != username);
        }
        if blocked {
            self.audit(
                AuditEventType::BruteForceDetected,
                username,
                AuditOutcome::Denied,
                Some(ctx),
                AuditDetail::new(),
            );
        }
    }

    /// First step of a login.
    ///
    /// # Errors
    /// Guard rejections, [`AuthError::InvalidCredentials`], or failures to
    /// create the session.
    #[instrument(skip_all, fields(username = %credentials.username, origin = %ctx.origin()))]
    pub fn login(
        &self,
        credentials: &LoginCredentials,
        ctx: &RequestContext,
    ) -> Result<LoginOutcome, AuthError> {
        let username = credentials.username.as_str();

        if let Err(e) = self.login_guard.run(&GuardRequest::login(ctx, username)) {
            let event_type = match e {
                AuthError::AccountLocked { .. } => AuditEventType::AccountLocked,
                AuthError::OriginBlocked => AuditEventType::OriginThrottled,
                _ => AuditEventType::LoginFailed,
            };
            self.audit(
                event_type,
                username,
                AuditOutcome::Denied,
                Some(ctx),
                detail([("reason", e.to_string())]),
            );
            return Err(e);
        }

        self.verify_credentials(
            username,
            credentials.password.expose_secret(),
            credentials.pin.expose_secret(),
            ctx,
        )?;

        let anomalies = self.threat.observe_login(username, ctx);
        if !anomalies.is_empty() {
            let names: Vec<&str> = anomalies.iter().map(|a| a.as_str()).collect();
            self.audit(
                AuditEventType::AnomalyDetected,
                username,
                AuditOutcome::Info,
                Some(ctx),
                detail([("anomalies", names.join(","))]),
            );
        }

        let escalate = self.config.escalate_on_anomaly() && !anomalies.is_empty();
        if self.credentials.mfa_enabled(username) || escalate {
            return self.start_challenge(username, ctx, anomalies);
        }

        let token = self.finish_login(username, ctx, "password")?;
        Ok(LoginOutcome::Authenticated {
            username: username.to_string(),
            token,
            anomalies,
        })
    }

    fn start_challenge(
        &self,
        username: &str,
        ctx: &RequestContext,
        anomalies: Vec<Anomaly>,
    ) -> Result<LoginOutcome, AuthError> {
        let ticket = Uuid::new_v4();
        let expires_at = self.clock.now() + self.config.pending_login_ttl();
        self.pending.insert(
            ticket,
            PendingLogin {
                username: username.to_string(),
                origin: ctx.origin().to_string(),
                fingerprint: ctx.fingerprint().to_string(),
                expires_at,
            },
        );

        let issued = self.issue_challenge(username, Some(ctx))?;

        let mut methods = vec![ProofKind::EmailCode.as_str()];
        if self.challenges.totp().is_enrolled(username) {
            methods.push(ProofKind::Totp.as_str());
        }
        if self.webauthn.has_credentials(username) {
            methods.push("webauthn");
        }
        debug!(username, %ticket, "login waiting for second factor");

        Ok(LoginOutcome::ChallengeRequired {
            ticket,
            expires_at,
            delivered: issued.delivered,
            methods,
            anomalies,
        })
    }

    fn pending_for(&self, ticket: Uuid, ctx: &RequestContext) -> Result<PendingLogin, AuthError> {
        let now = self.clock.now();
        let pending = self
            .pending
            .get(&ticket)
            .map(|pending| pending.clone())
            .ok_or(AuthError::ChallengeAbsent)?;
        if now > pending.expires_at {
            self.pending.remove(&ticket);
            return Err(AuthError::ChallengeExpired);
        }
        if pending.origin != ctx.origin() || pending.fingerprint != ctx.fingerprint() {
            warn!(username = %pending.username, origin = ctx.origin(), "login ticket presented from another client");
            return Err(AuthError::ChallengeAbsent);
        }
        Ok(pending)
    }

    /// Second step of a login: check the proof and mint the session.
    ///
    /// # Errors
    /// Challenge failures, [`AuthError::AccountLocked`], or session creation
    /// failures.
    #[instrument(skip_all, fields(origin = %ctx.origin()))]
    pub fn complete_login(
        &self,
        ticket: Uuid,
        proof: &Proof,
        ctx: &RequestContext,
    ) -> Result<String, AuthError> {
        let pending = self.pending_for(ticket, ctx)?;
        let username = pending.username.as_str();
        let slot = self.lockout.begin_attempt(username)?;

        let result = match proof {
            Proof::EmailCode { code } => self.challenges.verify(ProofKind::EmailCode, username, code),
            Proof::Totp { code } => self.challenges.verify(ProofKind::Totp, username, code),
            Proof::WebAuthn { assertion } => self.webauthn.finish_assertion(username, assertion),
        };

        if let Err(e) = result {
            if e.is_credential_failure() {
                let locked = slot.fail();
                self.count_failure(username, ctx, locked, AuditEventType::ChallengeFailed, proof.method());
            } else {
                self.audit(
                    AuditEventType::ChallengeFailed,
                    username,
                    AuditOutcome::Failure,
                    Some(ctx),
                    detail([("method", proof.method().to_string()), ("reason", e.to_string())]),
                );
            }
            return Err(e);
        }

        // A concurrent completion may have won the race for the ticket.
        if self.pending.remove(&ticket).is_none() {
            return Err(AuthError::ChallengeAbsent);
        }
        self.challenges.email().cancel(username);
        slot.succeed()?;
        self.audit(
            AuditEventType::ChallengeVerified,
            username,
            AuditOutcome::Success,
            Some(ctx),
            detail([("method", proof.method().to_string())]),
        );

        self.finish_login(username, ctx, proof.method())
    }

    /// Send a new email code for a pending login.
    ///
    /// # Errors
    /// [`AuthError::ChallengeAbsent`] or [`AuthError::ChallengeExpired`] for an
    /// unusable ticket.
    pub fn resend_challenge(&self, ticket: Uuid, ctx: &RequestContext) -> Result<bool, AuthError> {
        let pending = self.pending_for(ticket, ctx)?;
        self.issue_challenge(&pending.username, Some(ctx))
            .map(|issued| issued.delivered)
    }

    /// Start a `WebAuthn` assertion for a pending login.
    ///
    /// # Errors
    /// [`AuthError::ChallengeAbsent`] if the ticket is unusable or the user
    /// has no registered credential.
    pub fn begin_webauthn(&self, ticket: Uuid, ctx: &RequestContext) -> Result<String, AuthError> {
        let pending = self.pending_for(ticket, ctx)?;
        if !self.webauthn.has_credentials(&pending.username) {
            return Err(AuthError::ChallengeAbsent);
        }
        self.webauthn.begin_assertion(&pending.username)
    }

    fn finish_login(
        &self,
        username: &str,
        ctx: &RequestContext,
        method: &str,
    ) -> Result<String, AuthError> {
        self.threat.trust_device(username, ctx.fingerprint());
        if let Err(e) = self.credentials.record_login(username) {
            self.audit(
                AuditEventType::PersistenceFailure,
                username,
                AuditOutcome::Failure,
                Some(ctx),
                detail([("operation", "record_login".to_string()), ("error", e.to_string())]),
            );
        }

        let token = self.create_session(username, Some(ctx))?;
        self.audit(
            AuditEventType::LoginSucceeded,
            username,
            AuditOutcome::Success,
            Some(ctx),
            detail([("method", method.to_string())]),
        );
        info!(username, method, "login succeeded");
        Ok(token)
    }

    /// Issue an email code for `username` and deliver it to the address on
    /// record.
    ///
    /// # Errors
    /// [`AuthError::UnknownUser`] if there is no such user.
    pub fn issue_challenge(
        &self,
        username: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<IssuedChallenge, AuthError> {
        let address = self
            .credentials
            .email_of(username)
            .ok_or(AuthError::UnknownUser)?;
        let issued = self.challenges.issue(username, &address);

        let (event_type, outcome) = if issued.delivered {
            (AuditEventType::ChallengeIssued, AuditOutcome::Success)
        } else {
            (AuditEventType::ChallengeDeliveryFailed, AuditOutcome::Failure)
        };
        self.audit(
            event_type,
            username,
            outcome,
            ctx,
            detail([("expires_at", issued.expires_at.to_rfc3339())]),
        );
        Ok(issued)
    }

    /// Check an email code outside the login flow.
    ///
    /// # Errors
    /// See [`crate::challenge::ProofStrategy::verify`].
    pub fn verify_challenge(
        &self,
        username: &str,
        code: &str,
        ctx: &RequestContext,
    ) -> Result<(), AuthError> {
        let slot = self.lockout.begin_attempt(username)?;
        match self.challenges.verify(ProofKind::EmailCode, username, code) {
            Ok(()) => {
                slot.succeed()?;
                self.audit(
                    AuditEventType::ChallengeVerified,
                    username,
                    AuditOutcome::Success,
                    Some(ctx),
                    detail([("method", "email_code".to_string())]),
                );
                Ok(())
            }
            Err(e) => {
                if e.is_credential_failure() {
                    let locked = slot.fail();
                    self.count_failure(username, ctx, locked, AuditEventType::ChallengeFailed, "email_code");
                } else {
                    self.audit(
                        AuditEventType::ChallengeFailed,
                        username,
                        AuditOutcome::Failure,
                        Some(ctx),
                        detail([("reason", e.to_string())]),
                    );
                }
                Err(e)
            }
        }
    }

    /// Start a session, bound to `ctx` when one is given.
    ///
    /// # Errors
    /// [`AuthError::Internal`] if no token could be generated.
    pub fn create_session(
        &self,
        username: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<String, AuthError> {
        let token = self
            .sessions
            .create(username, ctx.map(RequestContext::binding))?;
        self.audit(
            AuditEventType::SessionCreated,
            username,
            AuditOutcome::Success,
            ctx,
            detail([
                ("token", redact(&token)),
                ("bound", ctx.is_some().to_string()),
            ]),
        );
        Ok(token)
    }

    /// Validate a token and slide its idle window.
    ///
    /// # Errors
    /// [`AuthError::SessionNotFound`], [`AuthError::SessionExpired`] or
    /// [`AuthError::SessionBindingViolation`].
    pub fn validate_session(
        &self,
        token: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<SessionInfo, AuthError> {
        let binding = ctx.map(RequestContext::binding);
        let result = self.sessions.validate(token, binding.as_ref());
        match &result {
            Err(AuthError::SessionExpired) => {
                self.audit(
                    AuditEventType::SessionExpired,
                    "unknown",
                    AuditOutcome::Info,
                    ctx,
                    detail([("token", redact(token))]),
                );
            }
            Err(AuthError::SessionBindingViolation) => {
                if let Some(ctx) = ctx {
                    self.threat.mark_suspicious(ctx.origin());
                }
                self.audit(
                    AuditEventType::SessionBindingViolation,
                    "unknown",
                    AuditOutcome::Denied,
                    ctx,
                    detail([("token", redact(token))]),
                );
            }
            _ => {}
        }
        result
    }

    pub fn revoke_session(&self, token: &str, actor: &str) -> bool {
        let revoked = self.sessions.revoke(token);
        if revoked {
            self.audit(
                AuditEventType::SessionRevoked,
                actor,
                AuditOutcome::Success,
                None,
                detail([("token", redact(token))]),
            );
        }
        revoked
    }

    pub fn revoke_all_sessions(&self, username: &str, actor: &str) -> usize {
        let revoked = self.sessions.revoke_all(username);
        self.audit(
            AuditEventType::SessionRevoked,
            actor,
            AuditOutcome::Success,
            None,
            detail([("username", username.to_string()), ("count", revoked.to_string())]),
        );
        revoked
    }

    /// Role lookup that denies unknown roles.
    #[must_use]
    pub fn has_permission(&self, role: &str, permission: Permission) -> bool {
        rbac::has_permission(role, permission)
    }

    /// Resolve the session and require `permission` for its user.
    ///
    /// # Errors
    /// Session errors or [`AuthError::PermissionDenied`].
    pub fn authorize(
        &self,
        token: &str,
        permission: Option<Permission>,
        ctx: &RequestContext,
    ) -> Result<Principal, AuthError> {
        let session = self.validate_session(token, Some(ctx))?;
        let Some(role) = self.credentials.role_of(&session.username) else {
            self.sessions.revoke(token);
            return Err(AuthError::SessionNotFound);
        };

        if let Some(permission) = permission {
            if !role.allows(permission) {
                self.audit(
                    AuditEventType::PermissionDenied,
                    &session.username,
                    AuditOutcome::Denied,
                    Some(ctx),
                    detail([
                        ("permission", permission.to_string()),
                        ("role", role.to_string()),
                    ]),
                );
                return Err(AuthError::PermissionDenied);
            }
        }

        Ok(Principal {
            username: session.username.clone(),
            role,
            session,
        })
    }

    /// Create a user on behalf of an administrator.
    ///
    /// # Errors
    /// [`AuthError::PermissionDenied`] when the caller lacks
    /// `user_management`, plus the errors of [`CredentialStore::create_user`].
    pub fn create_user(
        &self,
        token: &str,
        new_user: &NewUser,
        ctx: &RequestContext,
    ) -> Result<UserProfile, AuthError> {
        let principal = self.authorize(token, Some(Permission::UserManagement), ctx)?;

        let profile = self.credentials.create_user(new_user)?;
        self.audit(
            AuditEventType::UserCreated,
            &principal.username,
            AuditOutcome::Success,
            Some(ctx),
            detail([
                ("username", profile.username.clone()),
                ("role", profile.role.to_string()),
            ]),
        );
        Ok(profile)
    }

    /// Change the role of `username` on behalf of an administrator.
    ///
    /// # Errors
    /// Same as [`AuthEngine::create_user`], or [`AuthError::UnknownUser`].
    pub fn set_role(
        &self,
        token: &str,
        username: &str,
        role: Role,
        ctx: &RequestContext,
    ) -> Result<(), AuthError> {
        let principal = self.authorize(token, Some(Permission::UserManagement), ctx)?;

        self.credentials.set_role(username, role)?;
        self.audit(
            AuditEventType::RoleChanged,
            &principal.username,
            AuditOutcome::Success,
            Some(ctx),
            detail([("username", username.to_string()), ("role", role.to_string())]),
        );
        Ok(())
    }

    /// Self-service password change. Every other session of the user is
    /// revoked on success.
    ///
    /// # Errors
    /// Session errors, [`AuthError::InvalidCredentials`],
    /// [`AuthError::WeakSecret`] or [`AuthError::PersistenceUnavailable`].
    pub fn change_password(
        &self,
        token: &str,
        current_password: &str,
        pin: &str,
        new_password: &str,
        ctx: &RequestContext,
    ) -> Result<usize, AuthError> {
        let principal = self.authorize(token, None, ctx)?;
        let username = principal.username.as_str();
        let slot = self.lockout.begin_attempt(username)?;

        match self
            .credentials
            .change_password(username, current_password, pin, new_password)
        {
            Err(AuthError::InvalidCredentials) => {
                let locked = slot.fail();
                self.count_failure(username, ctx, locked, AuditEventType::PasswordChanged, "password_change");
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => return Err(e),
            Ok(()) => drop(slot),
        }

        let revoked = self.sessions.revoke_others(username, token);
        self.audit(
            AuditEventType::PasswordChanged,
            username,
            AuditOutcome::Success,
            Some(ctx),
            detail([("revoked_sessions", revoked.to_string())]),
        );
        Ok(revoked)
    }

    /// Self-service PIN change, same rules as [`AuthEngine::change_password`].
    ///
    /// # Errors
    /// See [`AuthEngine::change_password`].
    pub fn change_pin(
        &self,
        token: &str,
        password: &str,
        current_pin: &str,
        new_pin: &str,
        ctx: &RequestContext,
    ) -> Result<usize, AuthError> {
        let principal = self.authorize(token, None, ctx)?;
        let username = principal.username.as_str();
        let slot = self.lockout.begin_attempt(username)?;

        match self
            .credentials
            .change_pin(username, password, current_pin, new_pin)
        {
            Err(AuthError::InvalidCredentials) => {
                let locked = slot.fail();
                self.count_failure(username, ctx, locked, AuditEventType::PinChanged, "pin_change");
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => return Err(e),
            Ok(()) => drop(slot),
        }

        let revoked = self.sessions.revoke_others(username, token);
        self.audit(
            AuditEventType::PinChanged,
            username,
            AuditOutcome::Success,
            Some(ctx),
            detail([("revoked_sessions", revoked.to_string())]),
        );
        Ok(revoked)
    }

    /// Turn the second factor on or off for the session's user.
    ///
    /// # Errors
    /// Session errors or [`AuthError::PersistenceUnavailable`].
    pub fn set_mfa_enabled(
        &self,
        token: &str,
        enabled: bool,
        ctx: &RequestContext,
    ) -> Result<(), AuthError> {
        let principal = self.authorize(token, None, ctx)?;
        self.credentials
            .set_mfa_enabled(&principal.username, enabled)?;
        self.audit(
            AuditEventType::MfaChanged,
            &principal.username,
            AuditOutcome::Success,
            Some(ctx),
            detail([("enabled", enabled.to_string())]),
        );
        Ok(())
    }

    /// Enroll an authenticator app for the session's user.
    ///
    /// # Errors
    /// Session errors or [`AuthError::Internal`].
    pub fn enroll_totp(&self, token: &str, ctx: &RequestContext) -> Result<TotpEnrollment, AuthError> {
        let principal = self.authorize(token, None, ctx)?;
        let enrollment = self.challenges.totp().enroll(&principal.username)?;
        self.audit(
            AuditEventType::TotpEnrolled,
            &principal.username,
            AuditOutcome::Success,
            Some(ctx),
            AuditDetail::new(),
        );
        Ok(enrollment)
    }

    /// Register a security key for the session's user.
    ///
    /// # Errors
    /// Session errors or [`AuthError::AssertionRejected`] for a malformed key.
    pub fn register_webauthn(
        &self,
        token: &str,
        credential: RegisteredCredential,
        ctx: &RequestContext,
    ) -> Result<(), AuthError> {
        let principal = self.authorize(token, None, ctx)?;
        let credential_id = credential.credential_id.clone();
        self.webauthn.register(&principal.username, credential)?;
        self.audit(
            AuditEventType::WebAuthnRegistered,
            &principal.username,
            AuditOutcome::Success,
            Some(ctx),
            detail([("credential_id", credential_id)]),
        );
        Ok(())
    }

    /// Drop everything that has expired.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let before = self.pending.len();
        self.pending.retain(|_, pending| now <= pending.expires_at);

        let report = SweepReport {
            sessions: self.sessions.sweep(),
            challenges: self.challenges.sweep(),
            lockouts: self.lockout.sweep(),
            pending_logins: before.saturating_sub(self.pending.len()),
            webauthn_challenges: self.webauthn.sweep(),
            origins: self.threat.sweep(),
        };
        if report.total() > 0 {
            debug!(?report, "expired state swept");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audit::MemoryAuditSink,
        challenge::RecordingDelivery,
        clock::ManualClock,
        webauthn::tests::TestKey,
    };

    const PASSWORD: &str = "Correct#Horse42";
    const PIN: &str = "2468";

    struct Harness {
        engine: AuthEngine,
        clock: Arc<ManualClock>,
        delivery: Arc<RecordingDelivery>,
        audit: Arc<MemoryAuditSink>,
    }

    fn harness_with(config: AuthConfig) -> anyhow::Result<Harness> {
        let clock = Arc::new(ManualClock::at_noon());
        let delivery = Arc::new(RecordingDelivery::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = AuthEngine::builder(config)
            .with_clock(clock.clone())
            .with_delivery(delivery.clone())
            .with_audit_sink(audit.clone())
            .build()?;
        Ok(Harness {
            engine,
            clock,
            delivery,
            audit,
        })
    }

    fn harness() -> anyhow::Result<Harness> {
        harness_with(AuthConfig::new().with_escalate_on_anomaly(false))
    }

    fn new_user(username: &str, role: Role, mfa_enabled: bool) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password: SecretString::from(PASSWORD),
            pin: SecretString::from(PIN),
            role,
            mfa_enabled,
        }
    }

    fn creds(username: &str, password: &str, pin: &str) -> LoginCredentials {
        LoginCredentials {
            username: username.to_string(),
            password: SecretString::from(password),
            pin: SecretString::from(pin),
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("192.0.2.10", "f00dfeedf00dfeed")
    }

    fn token_of(outcome: LoginOutcome) -> anyhow::Result<String> {
        match outcome {
            LoginOutcome::Authenticated { token, .. } => Ok(token),
            other => anyhow::bail!("unexpected outcome: {other:?}"),
        }
    }

    fn ticket_of(outcome: LoginOutcome) -> anyhow::Result<Uuid> {
        match outcome {
            LoginOutcome::ChallengeRequired { ticket, .. } => Ok(ticket),
            other => anyhow::bail!("unexpected outcome: {other:?}"),
        }
    }

    fn last_code(h: &Harness) -> anyhow::Result<String> {
        let body = h
            .delivery
            .last()
            .map(|m| m.body)
            .ok_or_else(|| anyhow::anyhow!("nothing delivered"))?;
        body.split(|c: char| !c.is_ascii_digit())
            .find(|part| part.len() == 6)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("no code in body"))
    }

    #[test]
    fn password_only_login_creates_bound_session() -> anyhow::Result<()> {
        let h = harness()?;
        h.engine.credentials().create_user(&new_user("bob", Role::User, false))?;
        let token = token_of(h.engine.login(&creds("bob", PASSWORD, PIN), &ctx())?)?;

        let principal = h.engine.authorize(&token, Some(Permission::ReadFiles), &ctx())?;
        assert_eq!(principal.username, "bob");
        assert!(principal.session.bound);
        assert!(h.engine.credentials().get_user("bob").is_some_and(|u| u.last_login.is_some()));

        let other = RequestContext::new("198.51.100.1", "f00dfeedf00dfeed");
        assert_eq!(
            h.engine.validate_session(&token, Some(&other)).map(|s| s.username),
            Err(AuthError::SessionBindingViolation)
        );
        assert_eq!(
            h.engine.validate_session(&token, Some(&ctx())).map(|s| s.username),
            Err(AuthError::SessionNotFound)
        );
        assert!(h.engine.check_origin("198.51.100.1").suspicious);
        Ok(())
    }

    #[test]
    fn mfa_login_requires_emailed_code() -> anyhow::Result<()> {
        let h = harness()?;
        h.engine.credentials().create_user(&new_user("alice", Role::User, true))?;
        let ticket = ticket_of(h.engine.login(&creds("alice", PASSWORD, PIN), &ctx())?)?;
        let code = last_code(&h)?;

        let token = h
            .engine
            .complete_login(ticket, &Proof::EmailCode { code: code.clone() }, &ctx())?;
        assert_eq!(h.engine.validate_session(&token, Some(&ctx()))?.username, "alice");
        assert_eq!(
            h.engine.complete_login(ticket, &Proof::EmailCode { code }, &ctx()),
            Err(AuthError::ChallengeAbsent)
        );
        assert_eq!(h.audit.of_type(AuditEventType::ChallengeVerified).len(), 1);
        assert_eq!(h.audit.of_type(AuditEventType::LoginSucceeded).len(), 1);
        Ok(())
    }

    #[test]
    fn ticket_is_tied_to_the_client_and_expires() -> anyhow::Result<()> {
        let h = harness()?;
        h.engine.credentials().create_user(&new_user("alice", Role::User, true))?;
        let ticket = ticket_of(h.engine.login(&creds("alice", PASSWORD, PIN), &ctx())?)?;
        let code = last_code(&h)?;

        let elsewhere = RequestContext::new("203.0.113.9", "0000000000000000");
        assert_eq!(
            h.engine
                .complete_login(ticket, &Proof::EmailCode { code: code.clone() }, &elsewhere),
            Err(AuthError::ChallengeAbsent)
        );

        h.clock.advance_secs(301);
        assert_eq!(
            h.engine.complete_login(ticket, &Proof::EmailCode { code }, &ctx()),
            Err(AuthError::ChallengeExpired)
        );
        Ok(())
    }

    #[test]
    fn wrong_codes_count_toward_lockout() -> anyhow::Result<()> {
        let h = harness()?;
        h.engine.credentials().create_user(&new_user("alice", Role::User, true))?;
        let ticket = ticket_of(h.engine.login(&creds("alice", PASSWORD, PIN), &ctx())?)?;
        for _ in 0..3 {
            assert_eq!(
                h.engine
                    .complete_login(ticket, &Proof::EmailCode { code: "000000".into() }, &ctx()),
                Err(AuthError::ChallengeMismatch)
            );
        }
        assert!(matches!(
            h.engine.login(&creds("alice", PASSWORD, PIN), &ctx()),
            Err(AuthError::AccountLocked { .. })
        ));
        // Locking dropped the pending ticket.
        assert_eq!(
            h.engine
                .complete_login(ticket, &Proof::EmailCode { code: "000000".into() }, &ctx()),
            Err(AuthError::ChallengeAbsent)
        );
        Ok(())
    }

    #[test]
    fn anomalies_escalate_to_second_factor() -> anyhow::Result<()> {
        let h = harness_with(AuthConfig::new())?;
        h.engine.credentials().create_user(&new_user("carol", Role::User, false))?;

        // First login from this device is a new device.
        let outcome = h.engine.login(&creds("carol", PASSWORD, PIN), &ctx())?;
        let LoginOutcome::ChallengeRequired { ticket, anomalies, .. } = outcome else {
            anyhow::bail!("expected a challenge");
        };
        assert_eq!(anomalies, vec![Anomaly::NewDevice]);
        let code = last_code(&h)?;
        h.engine.complete_login(ticket, &Proof::EmailCode { code }, &ctx())?;

        // The device is now trusted.
        let outcome = h.engine.login(&creds("carol", PASSWORD, PIN), &ctx())?;
        assert!(matches!(outcome, LoginOutcome::Authenticated { ref anomalies, .. } if anomalies.is_empty()));
        Ok(())
    }

    #[test]
    fn webauthn_completes_login() -> anyhow::Result<()> {
        let h = harness()?;
        h.engine.credentials().create_user(&new_user("dave", Role::User, false))?;
        let token = token_of(h.engine.login(&creds("dave", PASSWORD, PIN), &ctx())?)?;
        let key = TestKey::ed25519()?;
        h.engine.register_webauthn(&token, key.credential("key-1"), &ctx())?;
        h.engine.set_mfa_enabled(&token, true, &ctx())?;

        let outcome = h.engine.login(&creds("dave", PASSWORD, PIN), &ctx())?;
        let LoginOutcome::ChallengeRequired { ticket, methods, .. } = outcome else {
            anyhow::bail!("expected a challenge");
        };
        assert!(methods.contains(&"webauthn"));

        let challenge = h.engine.begin_webauthn(ticket, &ctx())?;
        let config = h.engine.config();
        let assertion = key.assert(
            "key-1",
            &challenge,
            config.webauthn_rp_origin(),
            config.webauthn_rp_id(),
            1,
        )?;
        let token = h
            .engine
            .complete_login(ticket, &Proof::WebAuthn { assertion }, &ctx())?;
        assert_eq!(h.engine.validate_session(&token, Some(&ctx()))?.username, "dave");
        Ok(())
    }

    #[test]
    fn admin_operations_require_user_management() -> anyhow::Result<()> {
        let h = harness()?;
        h.engine.bootstrap(&new_user("root", Role::SuperAdmin, false))?;
        h.engine.credentials().create_user(&new_user("adam", Role::Admin, false))?;

        let adam = token_of(h.engine.login(&creds("adam", PASSWORD, PIN), &ctx())?)?;
        assert_eq!(
            h.engine
                .create_user(&adam, &new_user("mallory", Role::User, false), &ctx())
                .map(|p| p.username),
            Err(AuthError::PermissionDenied)
        );
        assert_eq!(
            h.engine.set_role(&adam, "adam", Role::SuperAdmin, &ctx()),
            Err(AuthError::PermissionDenied)
        );

        let root = token_of(h.engine.login(&creds("root", PASSWORD, PIN), &ctx())?)?;
        let created = h
            .engine
            .create_user(&root, &new_user("frank", Role::User, false), &ctx())?;
        assert_eq!(created.role, Role::User);
        h.engine.set_role(&root, "frank", Role::Guest, &ctx())?;
        assert_eq!(h.engine.credentials().role_of("frank"), Some(Role::Guest));
        assert_eq!(
            h.engine.set_role(&root, "nobody", Role::Guest, &ctx()),
            Err(AuthError::UnknownUser)
        );
        assert_eq!(h.audit.of_type(AuditEventType::PermissionDenied).len(), 2);
        assert_eq!(h.audit.of_type(AuditEventType::UserCreated).len(), 2);
        Ok(())
    }

    #[test]
    fn password_change_revokes_other_sessions() -> anyhow::Result<()> {
        let h = harness()?;
        h.engine.credentials().create_user(&new_user("gina", Role::User, false))?;
        let first = token_of(h.engine.login(&creds("gina", PASSWORD, PIN), &ctx())?)?;
        let second = token_of(h.engine.login(&creds("gina", PASSWORD, PIN), &ctx())?)?;

        assert_eq!(
            h.engine
                .change_password(&second, "wrong", PIN, "Brand#New#Pass7", &ctx()),
            Err(AuthError::InvalidCredentials)
        );
        let revoked = h
            .engine
            .change_password(&second, PASSWORD, PIN, "Brand#New#Pass7", &ctx())?;
        assert_eq!(revoked, 1);
        assert_eq!(
            h.engine.validate_session(&first, Some(&ctx())).map(|s| s.username),
            Err(AuthError::SessionNotFound)
        );
        assert!(h.engine.validate_session(&second, Some(&ctx())).is_ok());
        assert!(!h.engine.credentials().verify_credentials("gina", PASSWORD, PIN));
        assert!(h.engine.credentials().verify_credentials("gina", "Brand#New#Pass7", PIN));
        Ok(())
    }

    #[test]
    fn honeypot_request_blocks_origin_for_login() -> anyhow::Result<()> {
        let h = harness()?;
        h.engine.credentials().create_user(&new_user("hank", Role::User, false))?;
        assert_eq!(
            h.engine.guard_request(&ctx(), "/wp-admin/install.php"),
            Err(AuthError::HoneypotTriggered)
        );
        assert!(h.engine.check_origin(ctx().origin()).is_blocked());
        assert_eq!(
            h.engine.login(&creds("hank", PASSWORD, PIN), &ctx()).map(|_| ()),
            Err(AuthError::OriginBlocked)
        );
        assert_eq!(h.audit.of_type(AuditEventType::HoneypotAccess).len(), 1);

        h.engine.clear_origin(ctx().origin());
        assert!(h.engine.login(&creds("hank", PASSWORD, PIN), &ctx()).is_ok());
        Ok(())
    }

    #[test]
    fn sweep_reports_expired_state() -> anyhow::Result<()> {
        let h = harness()?;
        h.engine.credentials().create_user(&new_user("ivy", Role::User, true))?;
        let _ = h.engine.login(&creds("ivy", PASSWORD, PIN), &ctx())?;
        h.clock.advance_secs(3600);
        let report = h.engine.sweep();
        assert_eq!(report.pending_logins, 1);
        assert_eq!(report.challenges, 1);
        Ok(())
    }
}
