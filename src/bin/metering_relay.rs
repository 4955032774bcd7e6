//! Live-mode entry point: wires one `DeviceReader` per configured device
//! into a shared `RelayHub`, drives it until a termination signal arrives,
//! then shuts down in order. Grounded on `vzclient`'s `bin/influx_relay.py`.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use metering_relay::cli::{exit_code, Args};
use metering_relay::config::{Config, DeviceConfig};
use metering_relay::device_reader::DeviceReader;
use metering_relay::driver::{line_protocol_prefix, TagSet};
use metering_relay::drivers::http_device::HttpDevice;
use metering_relay::drivers::influx::InfluxConfig;
use metering_relay::hub::{RelayHub, SinkConnector};
use metering_relay::logging;
use metering_relay::service;
use reqwest::Client;
use serde_yaml::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shutdown budget split 20%/80% between readers and writers, per
/// `spec.md` §4.5 "Shutdown" / §5 "Timeouts" (default 300s total).
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(300);

fn main() -> ExitCode {
    let args = <Args as clap::Parser>::parse();

    if logging::init(args.verbose, args.logfile.as_deref()).is_err() {
        return ExitCode::from(exit_code::ARGUMENT_ERROR as u8);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::from(exit_code::ERROR as u8);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(err) => {
            error!(%err, "relay failed");
            ExitCode::from(exit_code::ERROR as u8)
        }
    }
}

async fn run(args: Args) -> metering_relay::Result<()> {
    let config = Config::load(&args.config, &Value::Null)?;
    let influx_config = influx_config(&config.defaults.destination)?;

    let mut hub = RelayHub::new(config.hub.clone())?;
    let reader_cancel = CancellationToken::new();

    for device in &config.devices {
        connect_device(&mut hub, device, &config, reader_cancel.clone());
    }

    hub.connect_writer(Arc::new(HttpSinkConnector {
        client: Client::new(),
        config: influx_config,
    }));

    info!(devices = config.devices.len(), "relay hub running");

    service::run_until_signal(
        reader_cancel.clone(),
        Some(async {
            hub.stop(SHUTDOWN_TIMEOUT).await;
        }),
    )
    .await;

    Ok(())
}

/// Spawn the `DeviceReader` loop for one configured device, feeding its
/// emitted samples into a channel the hub's reader task drains, and bridge
/// `DeviceReader::stop()` to the shared shutdown token.
fn connect_device(hub: &mut RelayHub, device: &DeviceConfig, config: &Config, cancel: CancellationToken) {
    let measurement = device
        .measurement
        .clone()
        .unwrap_or_else(|| config.defaults.measurement.clone());
    let field_name = device
        .field_name
        .clone()
        .unwrap_or_else(|| config.defaults.field_name.clone());

    let mut tags = TagSet::new();
    if !device.uuid.is_empty() {
        tags.insert("uuid", device.uuid.clone());
    }
    tags.insert("title", device.name.clone());
    for (k, v) in &device.tags {
        tags.insert(k.clone(), v.clone());
    }

    let prefix = line_protocol_prefix(&measurement, &tags, &field_name);
    let (tx, rx) = mpsc::channel(1024);
    hub.connect_reader(prefix, rx);

    let sampler = HttpDevice::new(device.url.clone());
    let name = device.name.clone();
    let use_device_time = device.use_device_time;
    let interpolate = device.interpolate;
    let sampling_interval_ms = device.sampling_interval_ms;
    let allowed_errors = device.allowed_errors;

    tokio::spawn(async move {
        let reader = DeviceReader::new(
            move || {
                let sampler = sampler.clone();
                async move { sampler.sample().await }
            },
            use_device_time,
            interpolate,
            sampling_interval_ms,
            allowed_errors,
            name.clone(),
        );

        let emit_tx = tx.clone();
        let emit = move |sample| {
            // The hub reader task owns the receiving half; a full channel
            // here means the hub is falling behind, so drop rather than
            // block the sampling loop (`spec.md` §4.3's schedule is
            // time-driven, not flow-controlled by the sink).
            if emit_tx.try_send(sample).is_err() {
                tracing::warn!(device = %name, "reader channel full, dropping sample");
            }
        };

        let result: Result<(), reqwest::Error> = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(()),
            result = reader.run(emit) => result,
        };
        if let Err(err) = result {
            error!(%err, "device reader exhausted its error budget");
        }
    });
}

fn influx_config(destination: &Value) -> metering_relay::Result<InfluxConfig> {
    let driver = destination.get("driver").and_then(Value::as_str).unwrap_or("influx");
    if driver != "influx" {
        return metering_relay::error::UnsupportedDriverSnafu {
            driver: driver.to_owned(),
            kind: "destination",
        }
        .fail();
    }
    Ok(InfluxConfig {
        host: destination
            .get("host")
            .and_then(Value::as_str)
            .unwrap_or("http://localhost:8086")
            .to_owned(),
        org: destination.get("org").and_then(Value::as_str).unwrap_or("").to_owned(),
        bucket: destination.get("bucket").and_then(Value::as_str).unwrap_or("").to_owned(),
        token: destination.get("secret").and_then(Value::as_str).unwrap_or("").to_owned(),
    })
}

/// Adapts the hub's generic [`SinkConnector`] seam to a fresh
/// [`metering_relay::drivers::influx`]-style HTTP POST per batch (`spec.md`
/// §5 "Shared resources": each writer task opens its own connection, no
/// pool). The influx driver's own buffering is bypassed here since the hub
/// already hands over complete immutable batches.
struct HttpSinkConnector {
    client: Client,
    config: InfluxConfig,
}

#[async_trait::async_trait]
impl SinkConnector for HttpSinkConnector {
    async fn post(&self, batch: bytes::Bytes) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ms",
            self.config.host, self.config.org, self.config.bucket
        );
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.config.token)
            .body(batch)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(format!("influx write failed with status {}", resp.status()).into());
        }
        Ok(())
    }
}
