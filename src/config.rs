//! YAML configuration loading and section-wise layering.
//!
//! Grounded on `vzclient/tool_base.py::ToolBase::unify_sectionwise` (merge
//! algorithm) and `vzclient/asyncio/database_copy.py::DatabaseCopy.from_yaml`
//! (top-level shape: `defaults`, `include`, `exclude`, driver sub-configs).

use std::path::Path;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value;
use tracing::warn;

use crate::error::{self, Result};

/// Raw, still-layered configuration tree. Driver sub-configs
/// (`source`/`destination`) are kept as opaque YAML mappings since their
/// shape is driver-specific (`spec.md` §1, "out of scope").
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    pub begin: Option<String>,
    pub end: Option<String>,
    pub max_gap: Option<i64>,
    #[serde(default = "default_measurement")]
    pub measurement: String,
    #[serde(default = "default_field_name")]
    pub field_name: String,
    #[serde(default)]
    pub copy_tags: Vec<String>,
    #[serde(default)]
    pub add_tags: std::collections::BTreeMap<String, String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    pub transform: Option<TransformSection>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub source: Value,
    #[serde(default)]
    pub destination: Value,
}

fn default_measurement() -> String {
    "volkszaehler".to_owned()
}
fn default_field_name() -> String {
    "value".to_owned()
}
fn default_chunk_size() -> usize {
    8192
}
fn default_buffer_size() -> usize {
    1_000_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformSection {
    #[serde(rename = "type")]
    pub kind: String,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
}

/// One `include` list entry: either a bare glob string or a mapping with a
/// `channel` glob plus per-channel overrides.
#[derive(Debug, Clone)]
pub struct IncludeEntry {
    pub pattern: String,
    pub overrides: Value,
}

/// `exclude` section: attribute name → list of glob patterns.
#[derive(Debug, Clone, Default)]
pub struct Excludes {
    pub titles: Vec<String>,
    pub types: Vec<String>,
    pub classes: Vec<String>,
    pub ids: Vec<String>,
}

impl Excludes {
    pub fn patterns_for(&self, attr: &str) -> &[String] {
        match attr {
            "title" => &self.titles,
            "type" => &self.types,
            "class" => &self.classes,
            "id" => &self.ids,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub defaults: Defaults,
    pub includes: Vec<IncludeEntry>,
    pub excludes: Excludes,
    /// Live-mode device list (`devices` tool-specific section, used only by
    /// the relay binary; absent/empty for bulk-copy configs).
    pub devices: Vec<DeviceConfig>,
    /// Live-mode hub tunables (`hub` tool-specific section).
    pub hub: crate::hub::HubConfig,
    pub raw: Value,
}

/// One entry of the `devices` tool-specific section driving the relay
/// binary: a polled sampling endpoint plus the tag/measurement identity of
/// its stream. Not part of `spec.md`'s driver contract (device sampling
/// primitives are out of scope there, `spec.md` §1) — this is the concrete
/// schema the bundled `drivers::http_device` sampling primitive needs.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub measurement: Option<String>,
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub tags: std::collections::BTreeMap<String, String>,
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: i64,
    #[serde(default)]
    pub interpolate: bool,
    #[serde(default = "default_true")]
    pub use_device_time: bool,
    #[serde(default = "default_allowed_errors")]
    pub allowed_errors: i64,
}

fn default_sampling_interval_ms() -> i64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_allowed_errors() -> i64 {
    -1
}

impl Config {
    /// Load and section-wise merge `path`'s YAML content over `defaults`.
    pub fn load(path: &Path, defaults: &Value) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            error::ConfigReadSnafu {
                path: path.to_owned(),
                source,
            }
            .build()
        })?;
        let user: Value = serde_yaml::from_str(&text).map_err(|source| {
            error::ConfigParseSnafu {
                path: path.to_owned(),
                source,
            }
            .build()
        })?;

        let merged = unify_sectionwise(&user, defaults);

        const KNOWN_SECTIONS: &[&str] = &[
            "defaults", "include", "exclude", "logs", "destination", "devices", "hub",
        ];
        if let Value::Mapping(map) = &merged {
            for key in map.keys() {
                if let Value::String(k) = key {
                    if !KNOWN_SECTIONS.contains(&k.as_str()) {
                        warn!(section = %k, "ignoring unknown top-level config section");
                    }
                }
            }
        }

        let defaults_section = merged.get("defaults").cloned().unwrap_or(Value::Null);
        let defaults: Defaults = serde_yaml::from_value(defaults_section)
            .map_err(|source| error::ConfigParseSnafu { path: path.to_owned(), source }.build())?;

        let includes = parse_includes(merged.get("include"))?;
        let excludes = parse_excludes(merged.get("exclude"))?;
        let devices = parse_devices(merged.get("devices"), path)?;
        let hub = match merged.get("hub") {
            Some(v) => serde_yaml::from_value(v.clone())
                .map_err(|source| error::ConfigParseSnafu { path: path.to_owned(), source }.build())?,
            None => crate::hub::HubConfig::default(),
        };

        Ok(Config {
            defaults,
            includes,
            excludes,
            devices,
            hub,
            raw: merged,
        })
    }
}

fn parse_devices(value: Option<&Value>, path: &Path) -> Result<Vec<DeviceConfig>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let Some(seq) = value.as_sequence() else {
        return Ok(Vec::new());
    };
    seq.iter()
        .map(|v| {
            serde_yaml::from_value(v.clone())
                .map_err(|source| error::ConfigParseSnafu { path: path.to_owned(), source }.build())
        })
        .collect()
}

/// Unify two (possibly nested) YAML mappings section-wise: for every key
/// whose value is a mapping in *either* side, recurse; scalar keys from
/// `options` override `default`.
pub fn unify_sectionwise(options: &Value, default: &Value) -> Value {
    let empty = serde_yaml::Mapping::new();
    let options_map = options.as_mapping().unwrap_or(&empty);
    let default_map = default.as_mapping().unwrap_or(&empty);

    let mut sections: Vec<Value> = Vec::new();
    for (k, v) in options_map.iter().chain(default_map.iter()) {
        if v.is_mapping() && !sections.contains(k) {
            sections.push(k.clone());
        }
    }

    let mut out = serde_yaml::Mapping::new();
    for section in &sections {
        let opts = options_map.get(section).cloned().unwrap_or(Value::Null);
        let defs = default_map.get(section).cloned().unwrap_or(Value::Null);
        out.insert(section.clone(), unify_sectionwise(&opts, &defs));
    }

    // Scalars: default first, then options override.
    for (k, v) in default_map.iter() {
        if !sections.contains(k) {
            out.insert(k.clone(), v.clone());
        }
    }
    for (k, v) in options_map.iter() {
        if !sections.contains(k) {
            out.insert(k.clone(), v.clone());
        }
    }
    Value::Mapping(out)
}

fn parse_includes(value: Option<&Value>) -> Result<Vec<IncludeEntry>> {
    let Some(value) = value else {
        return Ok(vec![IncludeEntry {
            pattern: "*".to_owned(),
            overrides: Value::Null,
        }]);
    };
    let items: Vec<Value> = match value {
        Value::Sequence(seq) => seq.clone(),
        Value::String(s) => vec![Value::String(s.clone())],
        _ => vec![],
    };
    let mut out = Vec::new();
    for item in items {
        match item {
            Value::String(pattern) => out.push(IncludeEntry {
                pattern,
                overrides: Value::Null,
            }),
            Value::Mapping(mut m) => {
                let channel_key = Value::String("channel".to_owned());
                let pattern = match m.remove(&channel_key) {
                    Some(Value::String(s)) => s,
                    _ => "*".to_owned(),
                };
                out.push(IncludeEntry {
                    pattern,
                    overrides: Value::Mapping(m),
                });
            }
            _ => {}
        }
    }
    Ok(out)
}

fn parse_excludes(value: Option<&Value>) -> Result<Excludes> {
    let Some(Value::Mapping(map)) = value else {
        return Ok(Excludes::default());
    };
    let list_of = |key: &str| -> Vec<String> {
        map.get(Value::String(key.to_owned()))
            .and_then(|v| v.as_sequence())
            .map(|seq| {
                seq.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    };
    Ok(Excludes {
        titles: list_of("titles"),
        types: list_of("types"),
        classes: list_of("classes"),
        ids: list_of("ids"),
    })
}

/// Translate a glob pattern (`*` → `.*`, `?` → `.`) into a compiled regex
/// anchored to match the whole string, matching
/// `DatabaseCopy.make_re`/`str.match` semantics (Python's `re.match`
/// anchors at the start only; `spec.md` describes whole-name matching, so
/// this anchors both ends).
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut translated = String::with_capacity(pattern.len() + 2);
    translated.push('^');
    for c in pattern.chars() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');
    Regex::new(&translated).map_err(|source| {
        error::InvalidPatternSnafu {
            pattern: pattern.to_owned(),
            source,
        }
        .build()
    })
}

/// Parse a `begin`/`end` config bound (`spec.md` §6, `YYYY-MM-DD HH:MM:SS:`
/// format — trailing colon tolerated) into epoch milliseconds, UTC. Each
/// bound is parsed from its own string; `spec.md` §9 flags a latent bug in
/// one variant of the original relational driver where `end`'s bound was
/// computed from `begin`'s value when both were datetimes, so this keeps
/// the two independent by construction.
pub fn parse_time_bound(value: &str) -> Result<i64> {
    let trimmed = value.trim().trim_end_matches(':');
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S").map_err(|_| {
        error::InvalidTimeBoundSnafu {
            value: value.to_owned(),
        }
        .build()
    })?;
    Ok(naive.and_utc().timestamp_millis())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn section_wise_merge_scenario() {
        // spec.md §8 scenario 7
        let defaults: Value = serde_yaml::from_str(
            "return_value: 3\nother_options:\n  key1: 1\n  key2: 2\n  key3: val3\n",
        )
        .unwrap();
        let user: Value = serde_yaml::from_str("return_value: 0\nother_options:\n  key1: 2\n")
            .unwrap();

        let merged = unify_sectionwise(&user, &defaults);
        assert_eq!(merged.get("return_value").unwrap().as_i64(), Some(0));
        let other = merged.get("other_options").unwrap();
        assert_eq!(other.get("key1").unwrap().as_i64(), Some(2));
        assert_eq!(other.get("key2").unwrap().as_i64(), Some(2));
        assert_eq!(other.get("key3").unwrap().as_str(), Some("val3"));
    }

    #[test]
    fn glob_translates_wildcards() {
        let re = glob_to_regex("meter.*?").unwrap();
        assert!(re.is_match("meter.X?"));
        assert!(!re.is_match("meter.X?X"));
    }

    #[test]
    fn includes_default_to_match_all() {
        let includes = parse_includes(None).unwrap();
        assert_eq!(includes.len(), 1);
        assert_eq!(includes[0].pattern, "*");
    }

    #[test]
    fn time_bound_parses_with_and_without_trailing_colon() {
        let a = parse_time_bound("2024-01-01 00:00:00").unwrap();
        let b = parse_time_bound("2024-01-01 00:00:00:").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, 1_704_067_200_000);
    }

    #[test]
    fn time_bound_rejects_garbage() {
        assert!(parse_time_bound("not a date").is_err());
    }

    #[test]
    fn excludes_parse_all_four_attribute_lists() {
        let yaml: Value = serde_yaml::from_str(
            "titles: [a]\ntypes: [b]\nclasses: [c]\nids: [d]\n",
        )
        .unwrap();
        let excludes = parse_excludes(Some(&yaml)).unwrap();
        assert_eq!(excludes.titles, vec!["a"]);
        assert_eq!(excludes.types, vec!["b"]);
        assert_eq!(excludes.classes, vec!["c"]);
        assert_eq!(excludes.ids, vec!["d"]);
    }
}
