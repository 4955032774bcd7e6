//! Minimal concrete device sampling primitive: polls a JSON HTTP endpoint
//! expecting `{"t": <ms-or-null>, "v": <float>}`.
//!
//! `spec.md` §1 treats concrete device sources (modbus, etc.) as external
//! collaborators and only specifies the sampling primitive's *shape*
//! (`async fn() -> Result<(Option<i64>, f64), E>`, `spec.md` §4.3). This is
//! a minimal, runnable instance of that shape so the live-mode binary has
//! something concrete to poll; it is not itself part of the spec'd design.

use reqwest::Client;
use serde::Deserialize;

use crate::device_reader::RawSample;

#[derive(Debug, Deserialize)]
struct Reading {
    t: Option<i64>,
    v: f64,
}

#[derive(Clone)]
pub struct HttpDevice {
    client: Client,
    url: String,
}

impl HttpDevice {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    pub async fn sample(&self) -> Result<RawSample, reqwest::Error> {
        let reading: Reading = self.client.get(&self.url).send().await?.json().await?;
        Ok((reading.t, reading.v))
    }
}
