//! Cross-cutting threat signals.
//!
//! Brute-force and honeypot detection block an origin until it is explicitly
//! cleared. Login anomalies are advisory only; the caller decides whether to
//! escalate.

use crate::{clock::Clock, config::AuthConfig, context::RequestContext};
use chrono::{DateTime, FixedOffset, TimeDelta, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::Arc,
};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    NewDevice,
    SuspiciousOrigin,
    UnusualHour,
}

impl Anomaly {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewDevice => "new_device",
            Self::SuspiciousOrigin => "suspicious_origin",
            Self::UnusualHour => "unusual_hour",
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    BruteForce,
    Honeypot,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct OriginBlock {
    pub reason: BlockReason,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct OriginState {
    failures: VecDeque<DateTime<Utc>>,
    suspicious: bool,
    block: Option<OriginBlock>,
}

pub struct ThreatMonitor {
    origins: DashMap<String, OriginState>,
    devices: DashMap<String, HashSet<String>>,
    honeypot_paths: Vec<String>,
    threshold: usize,
    window: TimeDelta,
    normal_hours: (u32, u32),
    utc_offset: FixedOffset,
    clock: Arc<dyn Clock>,
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.split(['?', '#']).next().unwrap_or_default();
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}

impl ThreatMonitor {
    #[must_use]
    pub fn new(config: &AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            origins: DashMap::new(),
            devices: DashMap::new(),
            honeypot_paths: config
                .honeypot_paths()
                .iter()
                .map(|path| normalize_path(path))
                .collect(),
            threshold: config.brute_force_threshold() as usize,
            window: config.brute_force_window(),
            normal_hours: config.normal_hours(),
            utc_offset: config.utc_offset(),
            clock,
        }
    }

    /// True if `path` is a decoy: equal to one, or nested below one.
    #[must_use]
    pub fn is_honeypot(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.honeypot_paths.iter().any(|decoy| {
            path == *decoy
                || path
                    .strip_prefix(decoy.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Block `origin` for touching a decoy path. Returns true if the path was a
    /// decoy.
    pub fn observe_path(&self, origin: &str, path: &str) -> bool {
        if !self.is_honeypot(path) {
            return false;
        }
        warn!(origin, path, "honeypot path accessed");
        self.block(origin, BlockReason::Honeypot);
        true
    }

    /// Count one failed authentication from `origin`. Returns true when this
    /// failure crossed the brute-force threshold and blocked the origin.
    pub fn record_failure(&self, origin: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.origins.entry(origin.to_string()).or_default();
        if state.block.is_some() {
            return false;
        }
        let cutoff = now - self.window;
        while state.failures.front().is_some_and(|at| *at <= cutoff) {
            state.failures.pop_front();
        }
        state.failures.push_back(now);

        if state.failures.len() >= self.threshold {
            state.failures.clear();
            state.suspicious = true;
            state.block = Some(OriginBlock {
                reason: BlockReason::BruteForce,
                since: now,
            });
            warn!(origin, "origin blocked for brute force");
            return true;
        }
        false
    }

    pub fn block(&self, origin: &str, reason: BlockReason) {
        let now = self.clock.now();
        let mut state = self.origins.entry(origin.to_string()).or_default();
        state.suspicious = true;
        if state.block.is_none() {
            state.block = Some(OriginBlock { reason, since: now });
        }
    }

    #[must_use]
    pub fn blocked(&self, origin: &str) -> Option<OriginBlock> {
        self.origins.get(origin).and_then(|state| state.block)
    }

    #[must_use]
    pub fn is_blocked(&self, origin: &str) -> bool {
        self.blocked(origin).is_some()
    }

    #[must_use]
    pub fn blocked_origins(&self) -> Vec<(String, OriginBlock)> {
        let mut blocked: Vec<_> = self
            .origins
            .iter()
            .filter_map(|entry| entry.block.map(|block| (entry.key().clone(), block)))
            .collect();
        blocked.sort_by(|a, b| a.0.cmp(&b.0));
        blocked
    }

    pub fn mark_suspicious(&self, origin: &str) {
        self.origins.entry(origin.to_string()).or_default().suspicious = true;
    }

    /// Lift a block and forget everything known about `origin`.
    pub fn clear(&self, origin: &str) {
        if self.origins.remove(origin).is_some() {
            debug!(origin, "origin cleared");
        }
    }

    #[must_use]
    pub fn is_suspicious(&self, origin: &str) -> bool {
        self.origins.get(origin).is_some_and(|state| state.suspicious)
    }

    pub fn trust_device(&self, username: &str, fingerprint: &str) {
        self.devices
            .entry(username.to_string())
            .or_default()
            .insert(fingerprint.to_string());
    }

    #[must_use]
    pub fn is_known_device(&self, username: &str, fingerprint: &str) -> bool {
        self.devices
            .get(username)
            .is_some_and(|known| known.contains(fingerprint))
    }

    /// Local hour outside the configured normal band (inclusive at both ends).
    #[must_use]
    pub fn is_unusual_hour(&self, at: DateTime<Utc>) -> bool {
        let hour = at.with_timezone(&self.utc_offset).hour();
        let (start, end) = self.normal_hours;
        hour < start || hour > end
    }

    /// Anomalies of one login attempt. Does not change any state.
    #[must_use]
    pub fn observe_login(&self, username: &str, ctx: &RequestContext) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        if !self.is_known_device(username, ctx.fingerprint()) {
            anomalies.push(Anomaly::NewDevice);
        }
        if self.is_suspicious(ctx.origin()) {
            anomalies.push(Anomaly::SuspiciousOrigin);
        }
        if self.is_unusual_hour(self.clock.now()) {
            anomalies.push(Anomaly::UnusualHour);
        }
        if !anomalies.is_empty() {
            debug!(username, origin = ctx.origin(), ?anomalies, "login anomalies");
        }
        anomalies
    }

    /// Forget failure windows that have aged out on unblocked origins.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now() - self.window;
        let before = self.origins.len();
        self.origins.retain(|_, state| {
            while state.failures.front().is_some_and(|at| *at <= cutoff) {
                state.failures.pop_front();
            }
            state.block.is_some() || state.suspicious || !state.failures.is_empty()
        });
        before.saturating_sub(self.origins.len())
    }
}
