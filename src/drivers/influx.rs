//! Time-series HTTP sink driver.
//!
//! Grounded on `vzclient/asyncio/influx_driver.py::InfluxDriver`: a
//! per-stream byte prefix is precomputed once, each `write_chunk` appends
//! `prefix + "{v} {t}\n"` per sample to a [`Buffer`] sized so its
//! high-water mark leaves room for one more max-length line, and flushes
//! via a single HTTP POST with `precision=ms`.

use async_trait::async_trait;
use reqwest::Client;

use crate::buffer::Buffer;
use crate::driver::{render_record, DriverError, Sample, TagSet, Writer};

/// Connection options for an InfluxDB-style HTTP time-series sink.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub host: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

/// Assumed max line length beyond the prefix, used to size the
/// high-water mark (`spec.md` §4.4 "Sink framing").
const MAX_LINE_TAIL: usize = 64;

pub struct InfluxWriter {
    client: Client,
    config: InfluxConfig,
    prefix: Vec<u8>,
    buffer: Buffer,
}

impl InfluxWriter {
    pub fn new(
        config: InfluxConfig,
        measurement: &str,
        tags: &TagSet,
        field_name: &str,
        buffer_size: usize,
    ) -> Result<Self, crate::error::Error> {
        let prefix = crate::driver::line_protocol_prefix(measurement, tags, field_name);
        let hwm = buffer_size.saturating_sub(prefix.len() + MAX_LINE_TAIL);
        let buffer = Buffer::new(buffer_size, Some(hwm))?;
        Ok(Self {
            client: Client::new(),
            config,
            prefix,
            buffer,
        })
    }

    async fn post(&mut self) -> Result<(), DriverError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let body = self.buffer.take();
        let url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ms",
            self.config.host, self.config.org, self.config.bucket
        );
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.config.token)
            .body(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(format!("influx write failed with status {}", resp.status()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Writer for InfluxWriter {
    async fn write_chunk(&mut self, chunk: &[Sample]) -> Result<(), DriverError> {
        for &sample in chunk {
            let record = render_record(&self.prefix, sample);
            self.buffer.write(&[&record])?;
            if self.buffer.is_full() {
                self.post().await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), DriverError> {
        self.post().await
    }
}
