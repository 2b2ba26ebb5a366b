//! Failure counting with timed lockout.
//!
//! Two independent tiers:
//!
//! - identity: sliding window of failed verifications per username; reaching
//!   the threshold locks the identity for a fixed duration;
//! - origin: sliding window of login requests per source address; exceeding
//!   the limit blocks the origin for every username.
//!
//! Both tiers are checked and updated under the per-key shard lock so
//! concurrent failures are never under-counted. Slow verifications reserve an
//! [`AttemptSlot`] first: attempts still in flight count against the identity
//! threshold, so a burst of parallel guesses cannot outrun the lock. Expired
//! lockouts clear lazily.

use crate::{clock::Clock, config::AuthConfig, error::AuthError};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct AttemptWindow {
    events: VecDeque<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
    in_flight: usize,
}

impl AttemptWindow {
    fn prune(&mut self, now: DateTime<Utc>, window: TimeDelta) {
        let cutoff = now - window;
        while self.events.front().is_some_and(|at| *at <= cutoff) {
            self.events.pop_front();
        }
    }

    /// Remaining lock, clearing it once it has aged out.
    fn active_lock(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.locked_until {
            Some(until) if until > now => Some(until),
            Some(_) => {
                self.locked_until = None;
                self.events.clear();
                None
            }
            None => None,
        }
    }

    fn is_idle(&self) -> bool {
        self.events.is_empty() && self.locked_until.is_none() && self.in_flight == 0
    }

    /// Forget counted failures; an active lock stays until it expires.
    fn clear_failures(&mut self, now: DateTime<Utc>) {
        self.events.clear();
        let _ = self.active_lock(now);
    }

    fn last_event(&self) -> Option<DateTime<Utc>> {
        self.events.back().copied()
    }
}

/// Whole seconds left, rounded up so a caller never retries too early.
#[must_use]
pub fn remaining_seconds(until: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (until - now).num_milliseconds().max(0);
    u64::try_from(millis).unwrap_or(0).div_ceil(1000)
}

/// Lock state of one identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityStatus {
    pub failures: usize,
    pub last_failure: Option<DateTime<Utc>>,
    pub locked_for_seconds: Option<u64>,
}

/// A reserved verification attempt against one identity.
///
/// Settle it with [`AttemptSlot::fail`] or [`AttemptSlot::succeed`]; dropping
/// it unsettled releases the reservation without counting anything.
#[must_use]
pub struct AttemptSlot<'a> {
    guard: &'a LockoutGuard,
    username: String,
    open: bool,
}

impl AttemptSlot<'_> {
    /// Count the attempt as failed. Returns true when it locked the identity.
    pub fn fail(mut self) -> bool {
        self.open = false;
        let guard = self.guard;
        guard.settle(&self.username, |record, now| {
            guard.push_failure(&self.username, record, now)
        })
    }

    /// Clear the failure counter.
    ///
    /// # Errors
    /// [`AuthError::AccountLocked`] if concurrent failures locked the
    /// identity while this attempt was in flight.
    pub fn succeed(mut self) -> Result<(), AuthError> {
        self.open = false;
        self.guard.settle(&self.username, |record, now| {
            record.clear_failures(now);
            record.active_lock(now).map_or(Ok(()), |until| {
                Err(AuthError::AccountLocked {
                    remaining_seconds: remaining_seconds(until, now),
                })
            })
        })
    }
}

impl Drop for AttemptSlot<'_> {
    fn drop(&mut self) {
        if self.open {
            self.guard.settle(&self.username, |_, _| ());
        }
    }
}

pub struct LockoutGuard {
    identities: DashMap<String, AttemptWindow>,
    origins: DashMap<String, AttemptWindow>,
    threshold: usize,
    window: TimeDelta,
    duration: TimeDelta,
    origin_limit: usize,
    origin_window: TimeDelta,
    origin_block: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl LockoutGuard {
    #[must_use]
    pub fn new(config: &AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            identities: DashMap::new(),
            origins: DashMap::new(),
            threshold: config.lockout_threshold() as usize,
            window: config.lockout_window(),
            duration: config.lockout_duration(),
            origin_limit: config.origin_request_limit() as usize,
            origin_window: config.origin_window(),
            origin_block: config.origin_block(),
            clock,
        }
    }

    /// Fail if the identity is currently locked.
    ///
    /// # Errors
    /// [`AuthError::AccountLocked`] with the remaining lock time.
    pub fn check_identity(&self, username: &str) -> Result<(), AuthError> {
        let now = self.clock.now();
        if let Some(mut record) = self.identities.get_mut(username) {
            if let Some(until) = record.active_lock(now) {
                return Err(AuthError::AccountLocked {
                    remaining_seconds: remaining_seconds(until, now),
                });
            }
            record.prune(now, self.window);
        }
        self.identities.remove_if(username, |_, record| record.is_idle());
        Ok(())
    }

    /// Reserve one verification attempt.
    ///
    /// Recent failures plus attempts already in flight must stay below the
    /// threshold, otherwise the attempt is refused as if the identity were
    /// locked.
    ///
    /// # Errors
    /// [`AuthError::AccountLocked`] while locked or while pending attempts
    /// could still lock the identity.
    pub fn begin_attempt(&self, username: &str) -> Result<AttemptSlot<'_>, AuthError> {
        let now = self.clock.now();
        let mut record = self.identities.entry(username.to_string()).or_default();
        if let Some(until) = record.active_lock(now) {
            return Err(AuthError::AccountLocked {
                remaining_seconds: remaining_seconds(until, now),
            });
        }
        record.prune(now, self.window);

        if record.events.len() + record.in_flight >= self.threshold {
            debug!(username, in_flight = record.in_flight, "attempt refused, threshold reserved");
            return Err(AuthError::AccountLocked {
                remaining_seconds: remaining_seconds(now + self.duration, now),
            });
        }
        record.in_flight += 1;
        Ok(AttemptSlot {
            guard: self,
            username: username.to_string(),
            open: true,
        })
    }

    /// Release one reservation and apply `outcome` under the same shard lock.
    fn settle<T>(
        &self,
        username: &str,
        outcome: impl FnOnce(&mut AttemptWindow, DateTime<Utc>) -> T,
    ) -> T {
        let now = self.clock.now();
        let result = {
            let mut record = self.identities.entry(username.to_string()).or_default();
            record.in_flight = record.in_flight.saturating_sub(1);
            outcome(&mut *record, now)
        };
        self.identities.remove_if(username, |_, record| record.is_idle());
        result
    }

    fn push_failure(&self, username: &str, record: &mut AttemptWindow, now: DateTime<Utc>) -> bool {
        if record.active_lock(now).is_some() {
            return false;
        }
        record.prune(now, self.window);
        record.events.push_back(now);

        if record.events.len() >= self.threshold {
            record.locked_until = Some(now + self.duration);
            record.events.clear();
            warn!(
                username,
                seconds = self.duration.num_seconds(),
                "identity locked after repeated failures"
            );
            return true;
        }
        false
    }

    /// Count one failed verification that ran without a slot. Returns true
    /// when this failure locked the identity.
    pub fn record_failure(&self, username: &str) -> bool {
        let now = self.clock.now();
        let mut record = self.identities.entry(username.to_string()).or_default();
        self.push_failure(username, &mut *record, now)
    }

    /// A successful verification clears the identity's counter. An active
    /// lock is left in place.
    pub fn record_success(&self, username: &str) {
        let now = self.clock.now();
        if let Some(mut record) = self.identities.get_mut(username) {
            record.clear_failures(now);
        }
        self.identities.remove_if(username, |_, record| record.is_idle());
    }

    #[must_use]
    pub fn identity_status(&self, username: &str) -> IdentityStatus {
        let now = self.clock.now();
        let Some(mut record) = self.identities.get_mut(username) else {
            return IdentityStatus {
                failures: 0,
                last_failure: None,
                locked_for_seconds: None,
            };
        };
        let lock = record.active_lock(now);
        record.prune(now, self.window);
        IdentityStatus {
            failures: record.events.len(),
            last_failure: record.last_event(),
            locked_for_seconds: lock.map(|until| remaining_seconds(until, now)),
        }
    }

    /// Administrative unlock.
    pub fn unlock_identity(&self, username: &str) {
        if self.identities.remove(username).is_some() {
            info!(username, "identity unlocked");
        }
    }

    /// Count one login request from `origin`, blocking it once the window
    /// limit is exceeded.
    ///
    /// # Errors
    /// [`AuthError::OriginBlocked`] while the origin is blocked.
    pub fn register_request(&self, origin: &str) -> Result<(), AuthError> {
        let now = self.clock.now();
        let mut record = self.origins.entry(origin.to_string()).or_default();
        if record.active_lock(now).is_some() {
            return Err(AuthError::OriginBlocked);
        }
        record.prune(now, self.origin_window);

        if record.events.len() >= self.origin_limit {
            record.locked_until = Some(now + self.origin_block);
            record.events.clear();
            warn!(
                origin,
                seconds = self.origin_block.num_seconds(),
                "origin throttled after request burst"
            );
            return Err(AuthError::OriginBlocked);
        }
        record.events.push_back(now);
        Ok(())
    }

    /// Remaining throttle time of `origin`, if any.
    #[must_use]
    pub fn origin_blocked_for(&self, origin: &str) -> Option<u64> {
        let now = self.clock.now();
        let mut record = self.origins.get_mut(origin)?;
        record
            .active_lock(now)
            .map(|until| remaining_seconds(until, now))
    }

    pub fn unblock_origin(&self, origin: &str) {
        self.origins.remove(origin);
    }

    /// Drop records whose windows and locks have all expired.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.identities.len() + self.origins.len();
        self.identities.retain(|_, record| {
            let _ = record.active_lock(now);
            record.prune(now, self.window);
            !record.is_idle()
        });
        self.origins.retain(|_, record| {
            let _ = record.active_lock(now);
            record.prune(now, self.origin_window);
            !record.is_idle()
        });
        before.saturating_sub(self.identities.len() + self.origins.len())
    }
}
