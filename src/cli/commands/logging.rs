use clap::{builder::ValueParser, Arg, Command};
use tracing::Level;

pub const ARG_VERBOSITY: &str = "verbosity";

/// Log levels by verbosity count: no `-v` logs errors only.
pub const LEVELS: [Level; 5] = [
    Level::ERROR,
    Level::WARN,
    Level::INFO,
    Level::DEBUG,
    Level::TRACE,
];

/// Level for a `-v` count; counts past the table stay at TRACE.
#[must_use]
pub fn level_for(verbosity: u8) -> Level {
    LEVELS
        .get(usize::from(verbosity))
        .copied()
        .unwrap_or(Level::TRACE)
}

/// Accepts a level name or a verbosity count and yields the count, so
/// `AUTHGUARD_LOG_LEVEL=warn` and `-v` select the same level.
fn parse_level(level: &str) -> Result<u8, String> {
    let position = match level.trim().parse::<usize>() {
        Ok(count) => (count < LEVELS.len()).then_some(count),
        Err(_) => LEVELS
            .iter()
            .position(|known| known.to_string().eq_ignore_ascii_case(level.trim())),
    };
    position
        .and_then(|count| u8::try_from(count).ok())
        .ok_or_else(|| format!("invalid log level: {level}"))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
            .env("AUTHGUARD_LOG_LEVEL")
            .global(true)
            .action(clap::ArgAction::Count)
            .value_parser(ValueParser::from(parse_level)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_select_their_own_level() {
        for name in ["error", "WARN", "Info", "debug", "trace"] {
            let count = parse_level(name);
            assert_eq!(
                count.map(level_for).map(|level| level.to_string()),
                Ok(name.to_uppercase())
            );
        }
    }

    #[test]
    fn counts_and_garbage() {
        assert_eq!(parse_level("0"), Ok(0));
        assert_eq!(parse_level("4"), Ok(4));
        assert!(parse_level("5").is_err());
        assert!(parse_level("loud").is_err());
        assert_eq!(level_for(0), Level::ERROR);
        assert_eq!(level_for(1), Level::WARN);
        assert_eq!(level_for(9), Level::TRACE);
    }
}
