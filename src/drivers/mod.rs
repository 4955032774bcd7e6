//! Concrete source and sink driver implementations.
//!
//! `spec.md` treats these as external collaborators and only specifies
//! their contract (`crate::driver::{Reader, Writer}`); the concrete drivers
//! here are grounded on `original_source/vzclient`'s MySQL and InfluxDB
//! clients, ported to the Rust ecosystem's async equivalents.

pub mod http_device;
pub mod influx;
pub mod mysql;
