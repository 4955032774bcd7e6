//! Channel descriptors, tag sets, line-protocol prefixes, and the
//! reader/writer driver contract.
//!
//! Source and sink drivers were duck-typed by method presence in the
//! original implementation; here they are explicit capability traits. A
//! driver is a resource you `connect`/`disconnect`; it vends a [`Reader`] or
//! [`Writer`] view of itself, but is not itself one (`spec.md` §9,
//! "duck-typed driver protocol → explicit interface").

use std::collections::BTreeMap;

use async_trait::async_trait;

/// A single `(timestamp_ms, value)` reading. Timestamps are epoch
/// milliseconds, UTC, monotonic-non-decreasing within one reader stream.
pub type Sample = (i64, f64);

/// Closed catalog of channel kinds used for default-unit lookups. Anything
/// outside this list is carried as `Other` with its raw string preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelType {
    ElectricMeter,
    Gas,
    Water,
    Temperature,
    Current,
    Voltage,
    Other(String),
}

impl ChannelType {
    pub fn as_str(&self) -> &str {
        match self {
            ChannelType::ElectricMeter => "electric meter",
            ChannelType::Gas => "gas",
            ChannelType::Water => "water",
            ChannelType::Temperature => "temperature",
            ChannelType::Current => "current",
            ChannelType::Voltage => "voltage",
            ChannelType::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "electric meter" => ChannelType::ElectricMeter,
            "gas" => ChannelType::Gas,
            "water" => ChannelType::Water,
            "temperature" => ChannelType::Temperature,
            "current" => ChannelType::Current,
            "voltage" => ChannelType::Voltage,
            other => ChannelType::Other(other.to_owned()),
        }
    }

    /// Default unit for this type, per `spec.md` §4.6 "Tag derivation for
    /// sink".
    pub fn default_unit(&self) -> Option<&'static str> {
        match self {
            ChannelType::ElectricMeter => Some("kWh"),
            ChannelType::Temperature => Some("\u{b0}C"),
            ChannelType::Current => Some("A"),
            ChannelType::Voltage => Some("V"),
            _ => None,
        }
    }
}

/// A channel as vended by a source driver's `get_channels`.
///
/// Core fields plus a string-keyed overlay for whatever extra attributes
/// the underlying source exposes (`spec.md` §9, "dynamic channel attributes
/// → tagged variants").
#[derive(Debug, Clone)]
pub struct ChannelDescriptor {
    pub id: String,
    pub uuid: String,
    pub title: Option<String>,
    pub channel_type: ChannelType,
    pub unit: Option<String>,
    pub resolution: Option<f64>,
    pub attributes: BTreeMap<String, String>,
}

impl ChannelDescriptor {
    /// Display name: `title` if present, else `id`.
    pub fn name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }

    /// Read an attribute used by include/exclude matching: one of
    /// `title`, `type`, `class`, `id`, or any overlay key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match key {
            "title" => self.title.as_deref(),
            "type" => Some(self.channel_type.as_str()),
            "id" => Some(&self.id),
            other => self.attributes.get(other).map(String::as_str),
        }
    }
}

/// An ordered tag set: short string key/value pairs, emitted in
/// lexicographic key order to keep the line-protocol prefix stable.
#[derive(Debug, Clone, Default)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Escape a measurement/tag-key/tag-value/field-name per line-protocol
/// rules: commas, spaces and equals signs are backslash-escaped.
/// (https://github.com/influxdata/influxdb/issues/3069, referenced in the
/// original driver's `get_prefix`.)
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | ' ' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Precompute the byte-immutable `measurement,tag1=v1,tag2=v2 field=`
/// prefix for a stream. Tag keys are sorted ascending.
pub fn line_protocol_prefix(measurement: &str, tags: &TagSet, field_name: &str) -> Vec<u8> {
    let mut out = escape(measurement);
    for (k, v) in tags.iter() {
        out.push(',');
        out.push_str(&escape(k));
        out.push('=');
        out.push_str(&escape(v));
    }
    out.push(' ');
    out.push_str(&escape(field_name));
    out.push('=');
    out.into_bytes()
}

/// Render one sample as a complete line-protocol record given its
/// precomputed prefix.
pub fn render_record(prefix: &[u8], sample: Sample) -> Vec<u8> {
    let (t, v) = sample;
    let mut out = Vec::with_capacity(prefix.len() + 32);
    out.extend_from_slice(prefix);
    out.extend_from_slice(format!("{v} {t}\n").as_bytes());
    out
}

/// Boxed error type used at the driver seam so `Reader`/`Writer` stay
/// object-safe and can be driven generically by `BulkCopy`.
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;

/// A source driver's reader view: enumerate channels, stream samples in
/// non-empty chunks via keyset pagination on timestamp.
#[async_trait]
pub trait Reader: Send {
    async fn get_channels(&mut self) -> Result<Vec<ChannelDescriptor>, DriverError>;

    /// Fetch the next non-empty chunk of samples for `channel` within
    /// `[begin, end)`, continuing from `after` (the last-seen timestamp of
    /// the previous chunk, `None` for the first call). Returns `None` once
    /// exhausted.
    async fn next_chunk(
        &mut self,
        channel: &ChannelDescriptor,
        begin: Option<i64>,
        end: Option<i64>,
        after: Option<i64>,
        chunk_size: usize,
    ) -> Result<Option<Vec<Sample>>, DriverError>;
}

/// A sink driver's writer view: buffer chunks, flush to the underlying
/// transport when full, and flush any residual bytes on release.
#[async_trait]
pub trait Writer: Send {
    async fn write_chunk(&mut self, chunk: &[Sample]) -> Result<(), DriverError>;

    /// Flush whatever is buffered. Called on normal drop paths by callers;
    /// not implied by `Drop` itself since it is fallible.
    async fn flush(&mut self) -> Result<(), DriverError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_tags_are_sorted_ascending() {
        let mut tags = TagSet::new();
        tags.insert("zeta", "1");
        tags.insert("alpha", "2");
        let prefix = line_protocol_prefix("meter", &tags, "value");
        assert_eq!(prefix, b"meter,alpha=2,zeta=1 value=");
    }

    #[test]
    fn prefix_is_byte_identical_across_reuses() {
        let mut tags = TagSet::new();
        tags.insert("uuid", "abc");
        let a = line_protocol_prefix("meter", &tags, "value");
        let b = line_protocol_prefix("meter", &tags, "value");
        assert_eq!(a, b);
    }

    #[test]
    fn escapes_commas_spaces_and_equals() {
        assert_eq!(escape("a,b c=d"), "a\\,b\\ c\\=d");
    }

    #[test]
    fn renders_full_record() {
        let prefix = line_protocol_prefix("m", &TagSet::new(), "value");
        let rec = render_record(&prefix, (1000, 3.5));
        assert_eq!(rec, b"m value=3.5 1000\n");
    }

    #[test]
    fn default_unit_lookup() {
        assert_eq!(ChannelType::ElectricMeter.default_unit(), Some("kWh"));
        assert_eq!(ChannelType::Other("foo".into()).default_unit(), None);
    }
}
