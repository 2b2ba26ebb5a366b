use clap::{Arg, Command};

pub const ARG_ADMIN_USERNAME: &str = "admin-username";
pub const ARG_ADMIN_EMAIL: &str = "admin-email";
pub const ARG_ADMIN_PASSWORD: &str = "admin-password";
pub const ARG_ADMIN_PIN: &str = "admin-pin";

/// Credentials of the administrator seeded into an empty user table.
///
/// All four are required together; none has a default.
#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ADMIN_USERNAME)
                .long(ARG_ADMIN_USERNAME)
                .help("Bootstrap administrator username, used only when the user table is empty")
                .env("AUTHGUARD_ADMIN_USERNAME")
                .requires_all([ARG_ADMIN_EMAIL, ARG_ADMIN_PASSWORD, ARG_ADMIN_PIN]),
        )
        .arg(
            Arg::new(ARG_ADMIN_EMAIL)
                .long(ARG_ADMIN_EMAIL)
                .help("Bootstrap administrator email address")
                .env("AUTHGUARD_ADMIN_EMAIL")
                .requires(ARG_ADMIN_USERNAME),
        )
        .arg(
            Arg::new(ARG_ADMIN_PASSWORD)
                .long(ARG_ADMIN_PASSWORD)
                .help("Bootstrap administrator password")
                .env("AUTHGUARD_ADMIN_PASSWORD")
                .hide_env_values(true)
                .requires(ARG_ADMIN_USERNAME),
        )
        .arg(
            Arg::new(ARG_ADMIN_PIN)
                .long(ARG_ADMIN_PIN)
                .help("Bootstrap administrator PIN")
                .env("AUTHGUARD_ADMIN_PIN")
                .hide_env_values(true)
                .requires(ARG_ADMIN_USERNAME),
        )
}
