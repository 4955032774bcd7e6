//! Crate-wide error taxonomy.
//!
//! One variant family per subsystem, in the style of the root crate's own
//! `snafu`-derived errors (see e.g. `lib/prometheus-parser/src/lib.rs`).

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("buffer overflow: {len} bytes would exceed capacity {capacity}"))]
    BufferOverflow { len: usize, capacity: usize },

    #[snafu(display("high water mark ({hwm}) exceeds capacity ({capacity})"))]
    InvalidHighWaterMark { hwm: usize, capacity: usize },

    #[snafu(display("source driver error: {source}"))]
    Source { source: Box<dyn std::error::Error + Send + Sync> },

    #[snafu(display("sink driver error: {source}"))]
    Sink { source: Box<dyn std::error::Error + Send + Sync> },

    #[snafu(display("failed to read config file {path:?}: {source}"))]
    ConfigRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse config file {path:?}: {source}"))]
    ConfigParse {
        path: std::path::PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("invalid glob pattern {pattern:?}: {source}"))]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[snafu(display("unsupported driver {driver:?} for {kind}"))]
    UnsupportedDriver { driver: String, kind: &'static str },

    #[snafu(display("channel {name:?} is missing a required attribute: {attr}"))]
    MissingAttribute { name: String, attr: &'static str },

    #[snafu(display("unknown transform type {kind:?}"))]
    UnknownTransform { kind: String },

    #[snafu(display("invalid time bound {value:?}: expected \"YYYY-MM-DD HH:MM:SS\""))]
    InvalidTimeBound { value: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
