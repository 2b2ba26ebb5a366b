use crate::cli::{
    actions::{server::Args, Action},
    commands::{self, bootstrap},
};
use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;
use std::{net::IpAddr, path::PathBuf};

/// Administrator credentials, present only when every bootstrap argument is.
fn bootstrap_admin(matches: &clap::ArgMatches) -> Option<crate::credentials::NewUser> {
    let value = |id: &str| matches.get_one::<String>(id).cloned();
    Some(crate::credentials::NewUser {
        username: value(bootstrap::ARG_ADMIN_USERNAME)?,
        email: value(bootstrap::ARG_ADMIN_EMAIL)?,
        password: SecretString::from(value(bootstrap::ARG_ADMIN_PASSWORD)?),
        pin: SecretString::from(value(bootstrap::ARG_ADMIN_PIN)?),
        role: crate::rbac::Role::SuperAdmin,
        mfa_enabled: false,
    })
}

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);
    let users_file = matches
        .get_one::<String>(commands::ARG_USERS_FILE)
        .map(PathBuf::from)
        .context("missing required argument: --users-file")?;
    let audit_log = matches
        .get_one::<String>(commands::ARG_AUDIT_LOG)
        .map(PathBuf::from)
        .context("missing required argument: --audit-log")?;
    let rp_origin = matches
        .get_one::<String>(commands::ARG_RP_ORIGIN)
        .cloned()
        .context("missing required argument: --rp-origin")?;
    url::Url::parse(&rp_origin).map_err(|e| anyhow!("invalid --rp-origin {rp_origin}: {e}"))?;

    let honeypot_paths = matches
        .get_many::<String>(commands::ARG_HONEYPOT_PATHS)
        .map(|paths| {
            paths
                .map(|path| path.trim().to_string())
                .filter(|path| !path.is_empty())
                .collect()
        });

    Ok(Action::Server(Args {
        port,
        users_file,
        audit_log,
        rp_origin,
        session_idle_seconds: matches
            .get_one::<u64>(commands::ARG_SESSION_IDLE)
            .copied()
            .unwrap_or(1800),
        sweep_interval: matches
            .get_one::<u64>(commands::ARG_SWEEP_INTERVAL)
            .copied()
            .unwrap_or(60),
        honeypot_paths,
        utc_offset_hours: matches
            .get_one::<i32>(commands::ARG_UTC_OFFSET)
            .copied()
            .unwrap_or(0),
        escalate_on_anomaly: matches
            .get_one::<bool>(commands::ARG_ESCALATE)
            .copied()
            .unwrap_or(true),
        trusted_proxies: matches
            .get_many::<IpAddr>(commands::ARG_TRUSTED_PROXIES)
            .map(|proxies| proxies.copied().collect()),
        bootstrap_admin: bootstrap_admin(matches),
    }))
}
