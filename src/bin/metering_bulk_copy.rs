//! Bulk-copy entry point: plans channels from a YAML config, streams each
//! through transform/compression, and writes the result into a time-series
//! sink, then exits. Grounded on `vzclient`'s `bin/db_copy.py`.

use std::process::ExitCode;

use metering_relay::bulk_copy::{copy_all, plan_channels, resolve_tags};
use metering_relay::cli::{exit_code, Args};
use metering_relay::config::Config;
use metering_relay::driver::{ChannelDescriptor, DriverError, Reader};
use metering_relay::drivers::influx::{InfluxConfig, InfluxWriter};
use metering_relay::drivers::mysql::MySqlReader;
use metering_relay::logging;
use serde_yaml::Value;
use tracing::{error, info};

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
            error!(%err, "bulk copy failed");
            ExitCode::from(exit_code::ERROR as u8)
        }
    }
}

async fn run(args: Args) -> metering_relay::Result<()> {
    let config = Config::load(&args.config, &Value::Null)?;

    let source_url = mysql_url(&config.defaults.source)?;
    let influx_config = influx_config(&config.defaults.destination)?;
    let buffer_size = config.defaults.buffer_size;

    let mut source = MySqlReader::connect(&source_url)
        .await
        .map_err(|source| metering_relay::Error::Source { source })?;

    let channels = source
        .get_channels()
        .await
        .map_err(|source| metering_relay::Error::Source { source })?;
    info!(count = channels.len(), "discovered channels");

    let jobs = plan_channels(channels, &config)?;
    info!(count = jobs.len(), "planned channel copies");

    let source_url = source_url.clone();
    let influx_config = influx_config.clone();

    let results = copy_all(
        jobs,
        move |_channel: &ChannelDescriptor| {
            let url = source_url.clone();
            async move {
                MySqlReader::connect(&url)
                    .await
                    .map_err(|err| err as DriverError)
            }
        },
        move |channel: &ChannelDescriptor, options| {
            let influx_config = influx_config.clone();
            let tags = resolve_tags(channel, options);
            let measurement = options.measurement.clone();
            let field_name = options.field_name.clone();
            let buffer_size = buffer_size;
            async move {
                let tags = tags.map_err(|err| -> DriverError { Box::new(err) })?;
                InfluxWriter::new(influx_config, &measurement, &tags, &field_name, buffer_size)
                    .map_err(|err| -> DriverError { Box::new(err) })
            }
        },
    )
    .await;

    let mut total = 0usize;
    let mut failures = 0usize;
    for result in results {
        match result {
            Ok(n) => total += n,
            Err(_) => failures += 1,
        }
    }
    info!(total_samples = total, failures, "bulk copy complete");
    Ok(())
}

fn mysql_url(source: &Value) -> metering_relay::Result<String> {
    let driver = yaml_str(source, "driver").unwrap_or("mysql");
    if driver != "mysql" {
        return metering_relay::error::UnsupportedDriverSnafu {
            driver: driver.to_owned(),
            kind: "source",
        }
        .fail();
    }
    let host = yaml_str(source, "host").unwrap_or("localhost");
    let user = yaml_str(source, "user").unwrap_or("root");
    let secret = yaml_str(source, "secret").unwrap_or("");
    let database = yaml_str(source, "database").unwrap_or("volkszaehler");
    Ok(format!("mysql://{user}:{secret}@{host}/{database}"))
}

fn influx_config(destination: &Value) -> metering_relay::Result<InfluxConfig> {
    let driver = yaml_str(destination, "driver").unwrap_or("influx");
    if driver != "influx" {
        return metering_relay::error::UnsupportedDriverSnafu {
            driver: driver.to_owned(),
            kind: "destination",
        }
        .fail();
    }
    Ok(InfluxConfig {
        host: yaml_str(destination, "host").unwrap_or("http://localhost:8086").to_owned(),
        org: yaml_str(destination, "org").unwrap_or("").to_owned(),
        bucket: yaml_str(destination, "bucket").unwrap_or("").to_owned(),
        token: yaml_str(destination, "secret").unwrap_or("").to_owned(),
    })
}

fn yaml_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}
