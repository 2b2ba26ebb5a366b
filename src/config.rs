//! Tunables for the security core.

use chrono::{FixedOffset, Offset, TimeDelta, Utc};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::Url;

pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

const DEFAULT_LOCKOUT_THRESHOLD: u32 = 3;
const DEFAULT_LOCKOUT_WINDOW_SECONDS: u64 = 5 * 60;
const DEFAULT_LOCKOUT_DURATION_SECONDS: u64 = 5 * 60;
const DEFAULT_ORIGIN_REQUEST_LIMIT: u32 = 5;
const DEFAULT_ORIGIN_WINDOW_SECONDS: u64 = 60;
const DEFAULT_ORIGIN_BLOCK_SECONDS: u64 = 5 * 60;
const DEFAULT_CHALLENGE_TTL_SECONDS: u64 = 5 * 60;
const DEFAULT_CHALLENGE_MAX_MISMATCHES: u32 = 5;
const DEFAULT_SESSION_IDLE_SECONDS: u64 = 30 * 60;
const DEFAULT_BRUTE_FORCE_THRESHOLD: u32 = 5;
const DEFAULT_BRUTE_FORCE_WINDOW_SECONDS: u64 = 5 * 60;
const DEFAULT_NORMAL_HOURS: (u32, u32) = (6, 22);
const DEFAULT_PENDING_LOGIN_TTL_SECONDS: u64 = 5 * 60;
const DEFAULT_WEBAUTHN_CHALLENGE_TTL_SECONDS: u64 = 60;
const DEFAULT_RP_ORIGIN: &str = "https://localhost";
const DEFAULT_TOTP_ISSUER: &str = "Authguard";
const DEFAULT_HONEYPOT_PATHS: [&str; 4] = ["/admin", "/wp-admin", "/.env", "/config"];
const DEFAULT_TRUSTED_PROXIES: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::LOCALHOST),
    IpAddr::V6(Ipv6Addr::LOCALHOST),
];

pub(crate) fn seconds(value: u64) -> TimeDelta {
    TimeDelta::try_seconds(i64::try_from(value).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    lockout_threshold: u32,
    lockout_window_seconds: u64,
    lockout_duration_seconds: u64,
    origin_request_limit: u32,
    origin_window_seconds: u64,
    origin_block_seconds: u64,
    challenge_ttl_seconds: u64,
    challenge_max_mismatches: u32,
    session_idle_seconds: u64,
    session_max_lifetime_seconds: Option<u64>,
    pbkdf2_iterations: u32,
    brute_force_threshold: u32,
    brute_force_window_seconds: u64,
    normal_hours: (u32, u32),
    utc_offset: FixedOffset,
    honeypot_paths: Vec<String>,
    trusted_proxies: Vec<IpAddr>,
    pending_login_ttl_seconds: u64,
    webauthn_challenge_ttl_seconds: u64,
    webauthn_rp_id: String,
    webauthn_rp_origin: String,
    escalate_on_anomaly: bool,
    totp_issuer: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lockout_threshold: DEFAULT_LOCKOUT_THRESHOLD,
            lockout_window_seconds: DEFAULT_LOCKOUT_WINDOW_SECONDS,
            lockout_duration_seconds: DEFAULT_LOCKOUT_DURATION_SECONDS,
            origin_request_limit: DEFAULT_ORIGIN_REQUEST_LIMIT,
            origin_window_seconds: DEFAULT_ORIGIN_WINDOW_SECONDS,
            origin_block_seconds: DEFAULT_ORIGIN_BLOCK_SECONDS,
            challenge_ttl_seconds: DEFAULT_CHALLENGE_TTL_SECONDS,
            challenge_max_mismatches: DEFAULT_CHALLENGE_MAX_MISMATCHES,
            session_idle_seconds: DEFAULT_SESSION_IDLE_SECONDS,
            session_max_lifetime_seconds: None,
            pbkdf2_iterations: MIN_PBKDF2_ITERATIONS,
            brute_force_threshold: DEFAULT_BRUTE_FORCE_THRESHOLD,
            brute_force_window_seconds: DEFAULT_BRUTE_FORCE_WINDOW_SECONDS,
            normal_hours: DEFAULT_NORMAL_HOURS,
            utc_offset: Utc.fix(),
            honeypot_paths: DEFAULT_HONEYPOT_PATHS
                .iter()
                .map(ToString::to_string)
                .collect(),
            trusted_proxies: DEFAULT_TRUSTED_PROXIES.to_vec(),
            pending_login_ttl_seconds: DEFAULT_PENDING_LOGIN_TTL_SECONDS,
            webauthn_challenge_ttl_seconds: DEFAULT_WEBAUTHN_CHALLENGE_TTL_SECONDS,
            webauthn_rp_id: "localhost".to_string(),
            webauthn_rp_origin: DEFAULT_RP_ORIGIN.to_string(),
            escalate_on_anomaly: true,
            totp_issuer: DEFAULT_TOTP_ISSUER.to_string(),
        }
    }

    #[must_use]
    pub fn with_lockout_threshold(mut self, attempts: u32) -> Self {
        self.lockout_threshold = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_lockout_window_seconds(mut self, seconds: u64) -> Self {
        self.lockout_window_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_lockout_duration_seconds(mut self, seconds: u64) -> Self {
        self.lockout_duration_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_origin_limit(mut self, requests: u32, window_seconds: u64) -> Self {
        self.origin_request_limit = requests.max(1);
        self.origin_window_seconds = window_seconds;
        self
    }

    #[must_use]
    pub fn with_origin_block_seconds(mut self, seconds: u64) -> Self {
        self.origin_block_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_challenge_ttl_seconds(mut self, seconds: u64) -> Self {
        self.challenge_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_challenge_max_mismatches(mut self, mismatches: u32) -> Self {
        self.challenge_max_mismatches = mismatches.max(1);
        self
    }

    #[must_use]
    pub fn with_session_idle_seconds(mut self, seconds: u64) -> Self {
        self.session_idle_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_max_lifetime_seconds(mut self, seconds: Option<u64>) -> Self {
        self.session_max_lifetime_seconds = seconds;
        self
    }

    /// Iteration counts below [`MIN_PBKDF2_ITERATIONS`] are raised to the floor.
    #[must_use]
    pub fn with_pbkdf2_iterations(mut self, iterations: u32) -> Self {
        self.pbkdf2_iterations = iterations.max(MIN_PBKDF2_ITERATIONS);
        self
    }

    #[must_use]
    pub fn with_brute_force(mut self, threshold: u32, window_seconds: u64) -> Self {
        self.brute_force_threshold = threshold.max(1);
        self.brute_force_window_seconds = window_seconds;
        self
    }

    /// Normal activity band as `(start_hour, end_hour)`, both inclusive.
    #[must_use]
    pub fn with_normal_hours(mut self, start: u32, end: u32) -> Self {
        self.normal_hours = (start.min(23), end.min(23));
        self
    }

    #[must_use]
    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    #[must_use]
    pub fn with_honeypot_paths(mut self, paths: Vec<String>) -> Self {
        self.honeypot_paths = paths;
        self
    }

    /// Peers whose `X-Forwarded-For` and `X-Real-IP` headers are believed.
    /// Requests from any other peer are keyed by the socket address.
    #[must_use]
    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = proxies;
        self
    }

    #[must_use]
    pub fn with_pending_login_ttl_seconds(mut self, seconds: u64) -> Self {
        self.pending_login_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_webauthn_challenge_ttl_seconds(mut self, seconds: u64) -> Self {
        self.webauthn_challenge_ttl_seconds = seconds;
        self
    }

    /// Derive the `WebAuthn` relying party from the public origin of the site.
    #[must_use]
    pub fn with_relying_party_origin(mut self, origin: &str) -> Self {
        let rp_id = Url::parse(origin)
            .ok()
            .and_then(|u: Url| u.host_str().map(ToString::to_string))
            .unwrap_or_else(|| "localhost".to_string());

        // Ensure origin does not have a trailing slash
        self.webauthn_rp_origin = origin.trim_end_matches('/').to_string();
        self.webauthn_rp_id = rp_id;
        self
    }

    #[must_use]
    pub fn with_escalate_on_anomaly(mut self, escalate: bool) -> Self {
        self.escalate_on_anomaly = escalate;
        self
    }

    #[must_use]
    pub fn with_totp_issuer(mut self, issuer: String) -> Self {
        self.totp_issuer = issuer;
        self
    }

    #[must_use]
    pub fn lockout_threshold(&self) -> u32 {
        self.lockout_threshold
    }

    #[must_use]
    pub fn lockout_window(&self) -> TimeDelta {
        seconds(self.lockout_window_seconds)
    }

    #[must_use]
    pub fn lockout_duration(&self) -> TimeDelta {
        seconds(self.lockout_duration_seconds)
    }

    #[must_use]
    pub fn origin_request_limit(&self) -> u32 {
        self.origin_request_limit
    }

    #[must_use]
    pub fn origin_window(&self) -> TimeDelta {
        seconds(self.origin_window_seconds)
    }

    #[must_use]
    pub fn origin_block(&self) -> TimeDelta {
        seconds(self.origin_block_seconds)
    }

    #[must_use]
    pub fn challenge_ttl(&self) -> TimeDelta {
        seconds(self.challenge_ttl_seconds)
    }

    #[must_use]
    pub fn challenge_ttl_seconds(&self) -> u64 {
        self.challenge_ttl_seconds
    }

    #[must_use]
    pub fn challenge_max_mismatches(&self) -> u32 {
        self.challenge_max_mismatches
    }

    #[must_use]
    pub fn session_idle_timeout(&self) -> TimeDelta {
        seconds(self.session_idle_seconds)
    }

    #[must_use]
    pub fn session_max_lifetime(&self) -> Option<TimeDelta> {
        self.session_max_lifetime_seconds.map(seconds)
    }

    #[must_use]
    pub fn pbkdf2_iterations(&self) -> u32 {
        self.pbkdf2_iterations
    }

    #[must_use]
    pub fn brute_force_threshold(&self) -> u32 {
        self.brute_force_threshold
    }

    #[must_use]
    pub fn brute_force_window(&self) -> TimeDelta {
        seconds(self.brute_force_window_seconds)
    }

    #[must_use]
    pub fn normal_hours(&self) -> (u32, u32) {
        self.normal_hours
    }

    #[must_use]
    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    #[must_use]
    pub fn honeypot_paths(&self) -> &[String] {
        &self.honeypot_paths
    }

    #[must_use]
    pub fn trusted_proxies(&self) -> &[IpAddr] {
        &self.trusted_proxies
    }

    #[must_use]
    pub fn is_trusted_proxy(&self, peer: IpAddr) -> bool {
        self.trusted_proxies.contains(&peer)
    }

    #[must_use]
    pub fn pending_login_ttl(&self) -> TimeDelta {
        seconds(self.pending_login_ttl_seconds)
    }

    #[must_use]
    pub fn webauthn_challenge_ttl(&self) -> TimeDelta {
        seconds(self.webauthn_challenge_ttl_seconds)
    }

    #[must_use]
    pub fn webauthn_rp_id(&self) -> &str {
        &self.webauthn_rp_id
    }

    #[must_use]
    pub fn webauthn_rp_origin(&self) -> &str {
        &self.webauthn_rp_origin
    }

    #[must_use]
    pub fn escalate_on_anomaly(&self) -> bool {
        self.escalate_on_anomaly
    }

    #[must_use]
    pub fn totp_issuer(&self) -> &str {
        &self.totp_issuer
    }
}
