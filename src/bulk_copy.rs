//! Chunked bulk-copy engine: plans which channels to copy from an
//! include/exclude configuration, then streams each through the same
//! transform/compression stages as the live path into a sink driver.
//!
//! Grounded on `vzclient/asyncio/database_copy.py::DatabaseCopy`.

use std::collections::BTreeMap;

use serde_yaml::Value;
use tracing::{debug, info, warn};

use crate::compressor::Compressor;
use crate::config::{glob_to_regex, parse_time_bound, Config, Excludes};
use crate::driver::{ChannelDescriptor, DriverError, Reader, Sample, TagSet, Writer};
use crate::error::{self, Result};
use crate::transform::TransformConfig;

/// Resolved per-channel copy options: `defaults` overlaid with any
/// include-specific overrides (`spec.md` §4.6, step 2).
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub begin: Option<i64>,
    pub end: Option<i64>,
    pub max_gap: Option<i64>,
    pub chunk_size: usize,
    pub measurement: String,
    pub field_name: String,
    pub copy_tags: Vec<String>,
    pub add_tags: BTreeMap<String, String>,
    pub transform: Option<TransformConfig>,
}

impl ChannelOptions {
    fn from_defaults(config: &Config) -> Result<Self> {
        let transform = match &config.defaults.transform {
            Some(t) => Some(TransformConfig::parse(&t.kind, t.scale, t.offset)?),
            None => None,
        };
        let begin = config.defaults.begin.as_deref().map(parse_time_bound).transpose()?;
        let end = config.defaults.end.as_deref().map(parse_time_bound).transpose()?;
        Ok(Self {
            begin,
            end,
            max_gap: config.defaults.max_gap,
            chunk_size: config.defaults.chunk_size,
            measurement: config.defaults.measurement.clone(),
            field_name: config.defaults.field_name.clone(),
            copy_tags: config.defaults.copy_tags.clone(),
            add_tags: config.defaults.add_tags.clone(),
            transform,
        })
    }

    /// Overlay per-include overrides found in the `include` entry's
    /// mapping form (e.g. `{channel: "*", max_gap: 500}`).
    fn overlay(mut self, overrides: &Value) -> Result<Self> {
        if let Some(v) = overrides.get("max_gap").and_then(Value::as_i64) {
            self.max_gap = Some(v);
        }
        if let Some(v) = overrides.get("chunk_size").and_then(Value::as_u64) {
            self.chunk_size = v as usize;
        }
        if let Some(v) = overrides.get("measurement").and_then(Value::as_str) {
            self.measurement = v.to_owned();
        }
        if let Some(v) = overrides.get("field_name").and_then(Value::as_str) {
            self.field_name = v.to_owned();
        }
        if let Some(v) = overrides.get("begin").and_then(Value::as_str) {
            self.begin = Some(parse_time_bound(v)?);
        }
        if let Some(v) = overrides.get("end").and_then(Value::as_str) {
            self.end = Some(parse_time_bound(v)?);
        }
        if let Some(v) = overrides.get("copy_tags").and_then(Value::as_sequence) {
            self.copy_tags = v.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect();
        }
        if let Some(v) = overrides.get("add_tags").and_then(Value::as_mapping) {
            // Merged on top of the defaults' add_tags, not replaced
            // (spec.md §4.6 "add_tags are merged on top").
            for (k, v) in v {
                if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                    self.add_tags.insert(k.to_owned(), v.to_owned());
                }
            }
        }
        if let Some(t) = overrides.get("transform") {
            if !t.is_null() {
                let kind = t.get("type").and_then(Value::as_str).unwrap_or_default();
                let scale = t.get("scale").and_then(Value::as_f64);
                let offset = t.get("offset").and_then(Value::as_f64);
                self.transform = Some(TransformConfig::parse(kind, scale, offset)?);
            }
        }
        Ok(self)
    }
}

/// A planned copy job: the channel plus its resolved options.
pub struct PlannedCopy {
    pub channel: ChannelDescriptor,
    pub options: ChannelOptions,
}

/// Decide, for one channel, whether `excludes` rejects it outright
/// (excludes win over includes).
pub fn is_excluded(channel: &ChannelDescriptor, excludes: &Excludes) -> Result<bool> {
    for attr in ["title", "type", "class", "id"] {
        for pattern in excludes.patterns_for(attr) {
            let re = glob_to_regex(pattern)?;
            if let Some(value) = channel.attribute(attr) {
                if re.is_match(value.trim()) {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

/// Scan `includes` in order; the first pattern matching the channel's
/// display name wins (`spec.md` §4.6, step 2).
pub fn plan_channels(
    channels: Vec<ChannelDescriptor>,
    config: &Config,
) -> Result<Vec<PlannedCopy>> {
    let base = ChannelOptions::from_defaults(config)?;
    let mut out = Vec::new();

    for channel in channels {
        if is_excluded(&channel, &config.excludes)? {
            debug!(channel = channel.name(), "excluded from copy");
            continue;
        }

        let mut matched = None;
        for include in &config.includes {
            let re = glob_to_regex(&include.pattern)?;
            if re.is_match(channel.name()) {
                matched = Some(include.overrides.clone());
                break;
            }
        }

        if let Some(overrides) = matched {
            let options = base.clone().overlay(&overrides)?;
            debug!(channel = channel.name(), "scheduled for copy");
            out.push(PlannedCopy { channel, options });
        }
    }
    Ok(out)
}

/// Resolve the sink tag set for one channel per `copy_tags`/`add_tags`
/// (`spec.md` §4.6 "Tag derivation for sink").
pub fn resolve_tags(channel: &ChannelDescriptor, options: &ChannelOptions) -> Result<TagSet> {
    let mut tags = TagSet::new();
    for key in &options.copy_tags {
        let value = match key.as_str() {
            "unit" => channel
                .unit
                .clone()
                .or_else(|| channel.channel_type.default_unit().map(str::to_owned))
                .ok_or_else(|| {
                    error::MissingAttributeSnafu {
                        name: channel.name().to_owned(),
                        attr: "unit",
                    }
                    .build()
                })?,
            "uuid" => {
                if channel.uuid.is_empty() {
                    "<none>".to_owned()
                } else {
                    channel.uuid.clone()
                }
            }
            "title" | "name" => channel.name().to_owned(),
            other => channel
                .attribute(other)
                .map(str::to_owned)
                .ok_or_else(|| {
                    error::MissingAttributeSnafu {
                        name: channel.name().to_owned(),
                        attr: "copy_tags entry",
                    }
                    .build()
                })?,
        };
        let tag_key = if key == "name" { "title" } else { key.as_str() };
        tags.insert(tag_key, value);
    }
    for (k, v) in &options.add_tags {
        tags.insert(k.clone(), v.clone());
    }
    Ok(tags)
}

/// Stream one channel from `reader` through transform/compression into
/// `writer`, returning the number of samples copied.
pub async fn copy_channel(
    channel: &ChannelDescriptor,
    options: &ChannelOptions,
    reader: &mut dyn Reader,
    writer: &mut dyn Writer,
) -> Result<usize, DriverError> {
    let transform = options.transform.as_ref().and_then(|t| t.resolve(channel));
    let mut compressor = options.max_gap.map(Compressor::new);

    let mut after = None;
    let mut total = 0usize;

    loop {
        let chunk = reader
            .next_chunk(channel, options.begin, options.end, after, options.chunk_size)
            .await?;
        let Some(chunk) = chunk else { break };
        if chunk.is_empty() {
            break;
        }
        after = chunk.last().map(|(t, _)| *t);

        let chunk: Vec<Sample> = match &transform {
            Some(t) => t.apply(&chunk),
            None => chunk,
        };

        let chunk: Vec<Sample> = match &mut compressor {
            Some(c) => chunk.into_iter().flat_map(|node| c.push(node)).collect(),
            None => chunk,
        };

        if !chunk.is_empty() {
            writer.write_chunk(&chunk).await?;
            total += chunk.len();
        }
    }

    if let Some(c) = compressor {
        let tail = c.finish();
        if !tail.is_empty() {
            writer.write_chunk(&tail).await?;
            total += tail.len();
        }
    }

    writer.flush().await?;
    info!(channel = channel.name(), samples = total, "channel copy complete");
    Ok(total)
}

/// Run all planned copy jobs concurrently via the supplied per-channel
/// reader/writer factories, logging (not propagating) individual
/// failures (`spec.md` §4.6 "Parallelism").
pub async fn copy_all<MkReader, MkWriter, RFut, WFut, R, W>(
    jobs: Vec<PlannedCopy>,
    mut reader_for: MkReader,
    mut writer_for: MkWriter,
) -> Vec<Result<usize, DriverError>>
where
    MkReader: FnMut(&ChannelDescriptor) -> RFut,
    MkWriter: FnMut(&ChannelDescriptor, &ChannelOptions) -> WFut,
    RFut: std::future::Future<Output = Result<R, DriverError>>,
    WFut: std::future::Future<Output = Result<W, DriverError>>,
    R: Reader,
    W: Writer,
{
    let mut futures = Vec::with_capacity(jobs.len());
    for job in jobs {
        let reader_fut = reader_for(&job.channel);
        let writer_fut = writer_for(&job.channel, &job.options);
        futures.push(async move {
            let mut reader = reader_fut.await?;
            let mut writer = writer_fut.await?;
            let result = copy_channel(&job.channel, &job.options, &mut reader, &mut writer).await;
            if let Err(err) = &result {
                warn!(channel = job.channel.name(), %err, "channel copy failed");
            }
            result
        });
    }
    futures::future::join_all(futures).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::ChannelType;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    fn channel(id: &str, title: &str) -> ChannelDescriptor {
        ChannelDescriptor {
            id: id.to_owned(),
            uuid: String::new(),
            title: Some(title.to_owned()),
            channel_type: ChannelType::ElectricMeter,
            unit: None,
            resolution: None,
            attributes: Default::default(),
        }
    }

    #[test]
    fn overlay_merges_add_tags_and_replaces_copy_tags_and_transform() {
        let mut add_tags = BTreeMap::new();
        add_tags.insert("site".to_owned(), "default".to_owned());
        let base = ChannelOptions {
            begin: None,
            end: None,
            max_gap: None,
            chunk_size: 10,
            measurement: "m".into(),
            field_name: "value".into(),
            copy_tags: vec!["uuid".into()],
            add_tags,
            transform: None,
        };

        let overrides: Value = serde_yaml::from_str(
            "copy_tags: [unit, title]\nadd_tags:\n  floor: '3'\ntransform:\n  type: linear\n  scale: 2.0\n  offset: 1.0\n",
        )
        .unwrap();

        let merged = base.overlay(&overrides).unwrap();
        assert_eq!(merged.copy_tags, vec!["unit".to_owned(), "title".to_owned()]);
        assert_eq!(merged.add_tags.get("site").unwrap(), "default");
        assert_eq!(merged.add_tags.get("floor").unwrap(), "3");
        match merged.transform {
            Some(TransformConfig::Linear { scale, offset }) => {
                assert_eq!(scale, 2.0);
                assert_eq!(offset, 1.0);
            }
            other => panic!("expected a linear transform, got {other:?}"),
        }
    }

    #[test]
    fn excludes_win_over_includes() {
        let mut excludes = Excludes::default();
        excludes.titles.push("secret*".to_owned());
        let chan = channel("1", "secret meter");
        assert!(is_excluded(&chan, &excludes).unwrap());
    }

    #[test]
    fn resolve_tags_uses_default_unit_table() {
        let chan = channel("1", "meter");
        let options = ChannelOptions {
            begin: None,
            end: None,
            max_gap: None,
            chunk_size: 10,
            measurement: "m".into(),
            field_name: "value".into(),
            copy_tags: vec!["unit".into(), "uuid".into(), "title".into()],
            add_tags: Default::default(),
            transform: None,
        };
        let tags = resolve_tags(&chan, &options).unwrap();
        let map: BTreeMap<_, _> = tags.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();
        assert_eq!(map.get("unit").unwrap(), "kWh");
        assert_eq!(map.get("uuid").unwrap(), "<none>");
        assert_eq!(map.get("title").unwrap(), "meter");
    }

    struct FakeReader {
        chunks: Vec<Vec<Sample>>,
    }

    #[async_trait]
    impl Reader for FakeReader {
        async fn get_channels(&mut self) -> Result<Vec<ChannelDescriptor>, DriverError> {
            Ok(vec![])
        }

        async fn next_chunk(
            &mut self,
            _channel: &ChannelDescriptor,
            _begin: Option<i64>,
            _end: Option<i64>,
            _after: Option<i64>,
            _chunk_size: usize,
        ) -> Result<Option<Vec<Sample>>, DriverError> {
            Ok(if self.chunks.is_empty() {
                None
            } else {
                Some(self.chunks.remove(0))
            })
        }
    }

    struct FakeWriter {
        written: Arc<Mutex<Vec<Sample>>>,
    }

    #[async_trait]
    impl Writer for FakeWriter {
        async fn write_chunk(&mut self, chunk: &[Sample]) -> Result<(), DriverError> {
            self.written.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn copy_channel_compresses_and_forwards() {
        let chan = channel("1", "meter");
        let options = ChannelOptions {
            begin: None,
            end: None,
            max_gap: None,
            chunk_size: 10,
            measurement: "m".into(),
            field_name: "value".into(),
            copy_tags: vec![],
            add_tags: Default::default(),
            transform: None,
        };
        let mut reader = FakeReader {
            chunks: vec![vec![(1, 1.0), (2, 1.0), (3, 1.0)], vec![(5, 1.0), (6, 1.0)]],
        };
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut writer = FakeWriter {
            written: written.clone(),
        };

        let n = copy_channel(&chan, &options, &mut reader, &mut writer)
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(*written.lock().unwrap(), vec![(1, 1.0), (6, 1.0)]);
    }
}
