//! Logging setup driven by the CLI's repeated `-v` flag.
//!
//! Grounded on `vzclient/tool_base.py::ToolBase::configure_logging`: the
//! verbosity count maps to a crate log level and a (slightly lower)
//! third-party/driver log level, and the destination switches from stderr
//! to an appending file when `-l PATH` is given.

use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Resolve the repeated `-v` count to (crate level, driver level), per
/// `spec.md` §6.3: 0=warning, 1=info, 2=debug, ≥3=debug + driver debug.
pub fn levels_for_verbosity(verbosity: u8) -> (LevelFilter, LevelFilter) {
    let crate_level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };
    let driver_level = if verbosity >= 3 {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    (crate_level, driver_level)
}

/// Install a global `tracing` subscriber. `log_file`, if given, receives
/// appended output instead of stderr.
pub fn init(verbosity: u8, log_file: Option<&Path>) -> std::io::Result<()> {
    let (crate_level, driver_level) = levels_for_verbosity(verbosity);
    let filter = EnvFilter::new(format!(
        "metering_relay={crate_level},sqlx={driver_level},reqwest={driver_level}"
    ));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder.with_writer(file).init();
        }
        None => {
            builder.init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verbosity_levels_match_spec_table() {
        assert_eq!(
            levels_for_verbosity(0),
            (LevelFilter::WARN, LevelFilter::WARN)
        );
        assert_eq!(
            levels_for_verbosity(1),
            (LevelFilter::INFO, LevelFilter::WARN)
        );
        assert_eq!(
            levels_for_verbosity(2),
            (LevelFilter::DEBUG, LevelFilter::WARN)
        );
        assert_eq!(
            levels_for_verbosity(3),
            (LevelFilter::DEBUG, LevelFilter::DEBUG)
        );
    }
}
