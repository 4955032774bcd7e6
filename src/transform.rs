//! Per-chunk value transforms, composed ahead of the compressor.
//!
//! Grounded on `vzclient/asyncio/transform.py`.

use crate::driver::{ChannelDescriptor, Sample};
use crate::error::{self, Result};

/// Configuration for a chunk transform, as parsed from the `transform`
/// config section (`spec.md` §6.1).
#[derive(Debug, Clone)]
pub enum TransformConfig {
    Linear { scale: f64, offset: f64 },
    AutoResolution,
}

impl TransformConfig {
    pub fn parse(kind: &str, scale: Option<f64>, offset: Option<f64>) -> Result<Self> {
        match kind {
            "linear" => Ok(TransformConfig::Linear {
                scale: scale.unwrap_or(1.0),
                offset: offset.unwrap_or(0.0),
            }),
            "auto-resolution" => Ok(TransformConfig::AutoResolution),
            other => error::UnknownTransformSnafu { kind: other }.fail(),
        }
    }

    /// Resolve this config against a channel, producing a concrete
    /// transform function. `AutoResolution` with `resolution == 1` (or
    /// unset) resolves to `None`: no wrapper is installed, matching the
    /// Python original's optimization of skipping the no-op case entirely.
    pub fn resolve(&self, channel: &ChannelDescriptor) -> Option<LinearTransform> {
        match self {
            TransformConfig::Linear { scale, offset } => Some(LinearTransform {
                scale: *scale,
                offset: *offset,
            }),
            TransformConfig::AutoResolution => {
                let scale = 1.0 / channel.resolution.unwrap_or(1.0);
                if scale != 1.0 {
                    Some(LinearTransform { scale, offset: 0.0 })
                } else {
                    None
                }
            }
        }
    }
}

/// `v := scale * v + offset`, applied per sample in a chunk.
#[derive(Debug, Clone, Copy)]
pub struct LinearTransform {
    pub scale: f64,
    pub offset: f64,
}

impl LinearTransform {
    pub fn apply(&self, chunk: &[Sample]) -> Vec<Sample> {
        chunk
            .iter()
            .map(|&(t, v)| (t, self.scale * v + self.offset))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn channel(resolution: Option<f64>) -> ChannelDescriptor {
        ChannelDescriptor {
            id: "1".into(),
            uuid: "u".into(),
            title: Some("chan".into()),
            channel_type: crate::driver::ChannelType::Other("x".into()),
            unit: None,
            resolution,
            attributes: Default::default(),
        }
    }

    #[test]
    fn linear_scales_and_offsets() {
        let t = LinearTransform {
            scale: 2.0,
            offset: 1.0,
        };
        assert_eq!(t.apply(&[(1, 3.0)]), vec![(1, 7.0)]);
    }

    #[test]
    fn auto_resolution_is_noop_when_resolution_is_one() {
        let cfg = TransformConfig::AutoResolution;
        assert!(cfg.resolve(&channel(Some(1.0))).is_none());
        assert!(cfg.resolve(&channel(None)).is_none());
    }

    #[test]
    fn auto_resolution_scales_by_inverse() {
        let cfg = TransformConfig::AutoResolution;
        let t = cfg.resolve(&channel(Some(0.1))).unwrap();
        assert_eq!(t.scale, 10.0);
        assert_eq!(t.apply(&[(1, 1.0)]), vec![(1, 10.0)]);
    }

    #[test]
    fn parse_rejects_unknown_kind() {
        assert!(TransformConfig::parse("quadratic", None, None).is_err());
    }
}
