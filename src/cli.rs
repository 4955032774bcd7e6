//! Command line argument parsing, shared by both binaries.
//!
//! Grounded on `vzclient/tool_base.py::ToolBase::configure_parser`, ported
//! to `clap`'s derive API. One positional config path; `-v` is repeatable
//! and `-l` switches the log destination.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
pub struct Args {
    /// Path to the YAML configuration file.
    pub config: PathBuf,

    /// Increase verbosity (repeatable): -v info, -vv debug, -vvv debug +
    /// driver debug.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to this file instead of stderr.
    #[arg(short = 'l', long = "logfile")]
    pub logfile: Option<PathBuf>,
}

/// Exit codes per `spec.md` §6.3.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const ARGUMENT_ERROR: i32 = 2;
}
