pub mod bootstrap;
pub mod logging;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ArgAction, ColorChoice, Command,
};

pub const ARG_PORT: &str = "port";
pub const ARG_USERS_FILE: &str = "users-file";
pub const ARG_AUDIT_LOG: &str = "audit-log";
pub const ARG_RP_ORIGIN: &str = "rp-origin";
pub const ARG_SESSION_IDLE: &str = "session-idle-seconds";
pub const ARG_SWEEP_INTERVAL: &str = "sweep-interval";
pub const ARG_HONEYPOT_PATHS: &str = "honeypot-paths";
pub const ARG_UTC_OFFSET: &str = "utc-offset-hours";
pub const ARG_ESCALATE: &str = "escalate-on-anomaly";
pub const ARG_TRUSTED_PROXIES: &str = "trusted-proxies";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("authguard")
        .about("Authentication and session security engine")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("AUTHGUARD_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_USERS_FILE)
                .short('u')
                .long(ARG_USERS_FILE)
                .help("JSON file holding the user table")
                .default_value("users.json")
                .env("AUTHGUARD_USERS_FILE"),
        )
        .arg(
            Arg::new(ARG_AUDIT_LOG)
                .long(ARG_AUDIT_LOG)
                .help("Append-only JSON lines audit log")
                .default_value("audit.jsonl")
                .env("AUTHGUARD_AUDIT_LOG"),
        )
        .arg(
            Arg::new(ARG_RP_ORIGIN)
                .long(ARG_RP_ORIGIN)
                .help("Public origin of the site, used as the WebAuthn relying party")
                .default_value("https://localhost")
                .env("AUTHGUARD_RP_ORIGIN"),
        )
        .arg(
            Arg::new(ARG_SESSION_IDLE)
                .long(ARG_SESSION_IDLE)
                .help("Seconds of inactivity after which a session expires")
                .default_value("1800")
                .env("AUTHGUARD_SESSION_IDLE_SECONDS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SWEEP_INTERVAL)
                .long(ARG_SWEEP_INTERVAL)
                .help("Seconds between sweeps of expired state, 0 disables the sweeper")
                .default_value("60")
                .env("AUTHGUARD_SWEEP_INTERVAL")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_HONEYPOT_PATHS)
                .long(ARG_HONEYPOT_PATHS)
                .help("Comma separated decoy paths, example: /admin,/.env")
                .env("AUTHGUARD_HONEYPOT_PATHS")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_UTC_OFFSET)
                .long(ARG_UTC_OFFSET)
                .help("UTC offset in hours of the normal activity band (06:00-22:00)")
                .default_value("0")
                .env("AUTHGUARD_UTC_OFFSET_HOURS")
                .allow_negative_numbers(true)
                .value_parser(clap::value_parser!(i32).range(-12..=14)),
        )
        .arg(
            Arg::new(ARG_ESCALATE)
                .long(ARG_ESCALATE)
                .help("Require a second factor when a login looks anomalous")
                .default_value("true")
                .env("AUTHGUARD_ESCALATE_ON_ANOMALY")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_TRUSTED_PROXIES)
                .long(ARG_TRUSTED_PROXIES)
                .help("Comma separated proxy addresses whose X-Forwarded-For is believed [default: 127.0.0.1,::1]")
                .env("AUTHGUARD_TRUSTED_PROXIES")
                .value_delimiter(',')
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(std::net::IpAddr)),
        );

    let command = bootstrap::with_args(command);
    logging::with_args(command)
}
