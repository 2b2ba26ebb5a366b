//! Ordered guard stages run before a request or login attempt is handled.
//!
//! Each stage is independent and can be tested on its own; a pipeline stops at
//! the first stage that rejects.

use crate::{context::RequestContext, error::AuthError, lockout::LockoutGuard, threat::ThreatMonitor};
use std::sync::Arc;
use tracing::debug;

/// What a stage gets to look at.
#[derive(Clone, Copy, Debug)]
pub struct GuardRequest<'a> {
    pub ctx: &'a RequestContext,
    pub path: Option<&'a str>,
    pub username: Option<&'a str>,
}

impl<'a> GuardRequest<'a> {
    #[must_use]
    pub fn http(ctx: &'a RequestContext, path: &'a str) -> Self {
        Self {
            ctx,
            path: Some(path),
            username: None,
        }
    }

    #[must_use]
    pub fn login(ctx: &'a RequestContext, username: &'a str) -> Self {
        Self {
            ctx,
            path: None,
            username: Some(username),
        }
    }
}

pub trait GuardStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    /// The reason this request may not proceed.
    fn check(&self, request: &GuardRequest<'_>) -> Result<(), AuthError>;
}

/// Rejects origins the threat monitor has blocked.
pub struct BlockedOriginStage(pub Arc<ThreatMonitor>);

impl GuardStage for BlockedOriginStage {
    fn name(&self) -> &'static str {
        "blocked_origin"
    }

    fn check(&self, request: &GuardRequest<'_>) -> Result<(), AuthError> {
        if self.0.is_blocked(request.ctx.origin()) {
            return Err(AuthError::OriginBlocked);
        }
        Ok(())
    }
}

/// Blocks the origin of any request to a decoy path.
pub struct HoneypotStage(pub Arc<ThreatMonitor>);

impl GuardStage for HoneypotStage {
    fn name(&self) -> &'static str {
        "honeypot"
    }

    fn check(&self, request: &GuardRequest<'_>) -> Result<(), AuthError> {
        match request.path {
            Some(path) if self.0.observe_path(request.ctx.origin(), path) => {
                Err(AuthError::HoneypotTriggered)
            }
            _ => Ok(()),
        }
    }
}

/// Counts the request against the origin's login window.
pub struct OriginRateLimitStage(pub Arc<LockoutGuard>);

impl GuardStage for OriginRateLimitStage {
    fn name(&self) -> &'static str {
        "origin_rate_limit"
    }

    fn check(&self, request: &GuardRequest<'_>) -> Result<(), AuthError> {
        self.0.register_request(request.ctx.origin())
    }
}

/// Rejects locked identities.
pub struct IdentityLockoutStage(pub Arc<LockoutGuard>);

impl GuardStage for IdentityLockoutStage {
    fn name(&self) -> &'static str {
        "identity_lockout"
    }

    fn check(&self, request: &GuardRequest<'_>) -> Result<(), AuthError> {
        match request.username {
            Some(username) => self.0.check_identity(username),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct GuardPipeline {
    stages: Vec<Box<dyn GuardStage>>,
}

impl GuardPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stage(mut self, stage: impl GuardStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Pipeline applied to every HTTP request.
    #[must_use]
    pub fn for_requests(threat: &Arc<ThreatMonitor>) -> Self {
        Self::new()
            .stage(BlockedOriginStage(threat.clone()))
            .stage(HoneypotStage(threat.clone()))
    }

    /// Pipeline applied to every login attempt.
    #[must_use]
    pub fn for_login(threat: &Arc<ThreatMonitor>, lockout: &Arc<LockoutGuard>) -> Self {
        Self::new()
            .stage(BlockedOriginStage(threat.clone()))
            .stage(OriginRateLimitStage(lockout.clone()))
            .stage(IdentityLockoutStage(lockout.clone()))
    }

    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run every stage in order.
    ///
    /// # Errors
    /// The first rejection.
    pub fn run(&self, request: &GuardRequest<'_>) -> Result<(), AuthError> {
        for stage in &self.stages {
            if let Err(e) = stage.check(request) {
                debug!(stage = stage.name(), origin = request.ctx.origin(), "guard rejected: {e}");
                return Err(e);
            }
        }
        Ok(())
    }
}
