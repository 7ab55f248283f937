use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One GPU expressed in accounting units (so fractional grants stay integral).
pub const MILLI_GPU: u32 = 1000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be > 0")]
    Zero { field: &'static str },
    #[error("{field} must be non-empty")]
    Empty { field: &'static str },
    #[error("crop_size {crop} exceeds decoded image size {height}x{width}")]
    CropTooLarge { crop: u32, height: u32, width: u32 },
    #[error("normalization {what} has {len} values but color mode {mode} has {channels} channels")]
    ChannelMismatch {
        what: &'static str,
        len: usize,
        mode: ColorMode,
        channels: usize,
    },
    #[error("normalization {what}[{index}] must be finite, got {value}")]
    NonFinite {
        what: &'static str,
        index: usize,
        value: f32,
    },
    #[error("normalization std[{index}] must be > 0, got {value}")]
    NonPositiveStd { index: usize, value: f32 },
    #[error("gpus_per_worker must be a fraction in (0, 1] or a whole number, got {0}")]
    InvalidGpuShare(f64),
    #[error(transparent)]
    Pool(#[from] PoolPolicyError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolPolicyError {
    #[error("worker count must be >= 1")]
    ZeroWorkers,
    #[error("min workers {min} exceeds max workers {max}")]
    MinAboveMax { min: usize, max: usize },
    #[error("invalid pool policy {0:?} (expected: N | fixed:N | bounded:MIN:MAX | unbounded:MIN)")]
    Parse(String),
}

/// How many predictor workers the pool may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPolicy {
    /// Exactly `n` workers for the whole run.
    Fixed(usize),
    /// Start with `min`, grow on demand up to `max`.
    Bounded { min: usize, max: usize },
    /// Start with `min`, grow on demand up to whatever the resources allow.
    Unbounded { min: usize },
}

impl PoolPolicy {
    pub fn validate(&self) -> Result<(), PoolPolicyError> {
        match *self {
            PoolPolicy::Fixed(n) => {
                if n == 0 {
                    return Err(PoolPolicyError::ZeroWorkers);
                }
            }
            PoolPolicy::Bounded { min, max } => {
                if min == 0 || max == 0 {
                    return Err(PoolPolicyError::ZeroWorkers);
                }
                if min > max {
                    return Err(PoolPolicyError::MinAboveMax { min, max });
                }
            }
            PoolPolicy::Unbounded { min } => {
                if min == 0 {
                    return Err(PoolPolicyError::ZeroWorkers);
                }
            }
        }
        Ok(())
    }

    pub fn min_workers(&self) -> usize {
        match *self {
            PoolPolicy::Fixed(n) => n,
            PoolPolicy::Bounded { min, .. } | PoolPolicy::Unbounded { min } => min,
        }
    }

    /// Upper bound on workers given the number of workers the resources can host.
    pub fn max_workers(&self, resource_limit: usize) -> usize {
        match *self {
            PoolPolicy::Fixed(n) => n,
            PoolPolicy::Bounded { max, .. } => max,
            PoolPolicy::Unbounded { min } => resource_limit.max(min),
        }
    }

    pub fn is_elastic(&self) -> bool {
        match *self {
            PoolPolicy::Fixed(_) => false,
            PoolPolicy::Bounded { min, max } => min < max,
            PoolPolicy::Unbounded { .. } => true,
        }
    }
}

impl fmt::Display for PoolPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolPolicy::Fixed(n) => write!(f, "fixed:{n}"),
            PoolPolicy::Bounded { min, max } => write!(f, "bounded:{min}:{max}"),
            PoolPolicy::Unbounded { min } => write!(f, "unbounded:{min}"),
        }
    }
}

impl FromStr for PoolPolicy {
    type Err = PoolPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        let parse_n = |v: &str| -> Result<usize, PoolPolicyError> {
            v.trim()
                .parse::<usize>()
                .map_err(|_| PoolPolicyError::Parse(s.to_string()))
        };
        let parts: Vec<&str> = raw.split(':').collect();
        let policy = match parts.as_slice() {
            [n] => PoolPolicy::Fixed(parse_n(n)?),
            ["fixed", n] => PoolPolicy::Fixed(parse_n(n)?),
            ["bounded", min, max] => PoolPolicy::Bounded {
                min: parse_n(min)?,
                max: parse_n(max)?,
            },
            ["unbounded", min] => PoolPolicy::Unbounded { min: parse_n(min)? },
            _ => return Err(PoolPolicyError::Parse(s.to_string())),
        };
        policy.validate()?;
        Ok(policy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorMode {
    #[serde(rename = "RGB")]
    Rgb,
    #[serde(rename = "L")]
    Luma,
    #[serde(rename = "RGBA")]
    Rgba,
}

impl ColorMode {
    pub fn channels(&self) -> usize {
        match self {
            ColorMode::Rgb => 3,
            ColorMode::Luma => 1,
            ColorMode::Rgba => 4,
        }
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColorMode::Rgb => "RGB",
            ColorMode::Luma => "L",
            ColorMode::Rgba => "RGBA",
        };
        f.write_str(s)
    }
}

impl FromStr for ColorMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RGB" => Ok(ColorMode::Rgb),
            "L" | "GRAY" | "GREY" => Ok(ColorMode::Luma),
            "RGBA" => Ok(ColorMode::Rgba),
            _ => anyhow::bail!("invalid color mode {s:?} (expected: RGB|L|RGBA)"),
        }
    }
}

/// Size and color mode images are decoded into by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub height: u32,
    pub width: u32,
    pub mode: ColorMode,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            height: 256,
            width: 256,
            mode: ColorMode::Rgb,
        }
    }
}

/// Maps the directory layout under `base_dir` to a label field.
///
/// `base_dir/<label>/<file...>` yields `field = <label>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partitioning {
    /// Prefix the label directories live under. Empty means the source root.
    pub base_dir: String,
    pub field: String,
}

impl Partitioning {
    pub fn dir(field: impl Into<String>) -> Self {
        Self {
            base_dir: String::new(),
            field: field.into(),
        }
    }
}

impl Default for Partitioning {
    fn default() -> Self {
        Self::dir("class")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalization {
    pub fn imagenet() -> Self {
        Self {
            mean: IMAGENET_MEAN.to_vec(),
            std: IMAGENET_STD.to_vec(),
        }
    }

    pub fn validate(&self, mode: ColorMode) -> Result<(), ConfigError> {
        let channels = mode.channels();
        for (what, values) in [("mean", &self.mean), ("std", &self.std)] {
            if values.len() != channels {
                return Err(ConfigError::ChannelMismatch {
                    what,
                    len: values.len(),
                    mode,
                    channels,
                });
            }
            for (index, &value) in values.iter().enumerate() {
                if !value.is_finite() {
                    return Err(ConfigError::NonFinite { what, index, value });
                }
            }
        }
        for (index, &value) in self.std.iter().enumerate() {
            if value <= 0.0 {
                return Err(ConfigError::NonPositiveStd { index, value });
            }
        }
        Ok(())
    }

    /// Closed range a normalized value of channel `c` can take, for inputs in [0, 1].
    pub fn output_range(&self, c: usize) -> Option<(f32, f32)> {
        let mean = *self.mean.get(c)?;
        let std = *self.std.get(c)?;
        Some(((0.0 - mean) / std, (1.0 - mean) / std))
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self::imagenet()
    }
}

/// Immutable configuration for one pipeline run.
///
/// Built once at startup, validated with [`PipelineConfig::validate`], then shared read-only by
/// every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// `s3://bucket/prefix/` or a local directory.
    pub source: String,
    pub partitioning: Partitioning,
    pub image: ImageSpec,
    pub crop_size: u32,
    pub normalization: Normalization,
    pub batch_size: usize,
    pub pool: PoolPolicy,
    /// GPU share granted to each worker. 0 runs every worker on CPU.
    pub gpus_per_worker: f64,
    /// Overrides GPU detection when set.
    pub num_gpus: Option<u32>,
    pub num_shards: usize,
    /// Local directory or `s3://bucket/prefix/`.
    pub destination: String,
    pub prefetch_batches: usize,
    pub preprocess_concurrency: usize,
    pub max_queue_batches: usize,
    pub max_task_retries: u32,
}

impl PipelineConfig {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            partitioning: Partitioning::default(),
            image: ImageSpec::default(),
            crop_size: 224,
            normalization: Normalization::imagenet(),
            batch_size: 128,
            pool: PoolPolicy::Fixed(4),
            gpus_per_worker: 0.0,
            num_gpus: None,
            num_shards: 4,
            destination: destination.into(),
            prefetch_batches: 2,
            preprocess_concurrency: 4,
            max_queue_batches: 8,
            max_task_retries: 3,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.trim().is_empty() {
            return Err(ConfigError::Empty { field: "source" });
        }
        if self.destination.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "destination",
            });
        }
        if self.partitioning.field.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "partitioning.field",
            });
        }
        for (field, v) in [
            ("image.height", self.image.height as usize),
            ("image.width", self.image.width as usize),
            ("crop_size", self.crop_size as usize),
            ("batch_size", self.batch_size),
            ("num_shards", self.num_shards),
            ("prefetch_batches", self.prefetch_batches),
            ("preprocess_concurrency", self.preprocess_concurrency),
            ("max_queue_batches", self.max_queue_batches),
        ] {
            if v == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.crop_size > self.image.height || self.crop_size > self.image.width {
            return Err(ConfigError::CropTooLarge {
                crop: self.crop_size,
                height: self.image.height,
                width: self.image.width,
            });
        }
        self.normalization.validate(self.image.mode)?;
        self.pool.validate()?;
        gpu_share_units(self.gpus_per_worker)?;
        Ok(())
    }

    /// Shape of a preprocessed tensor: (channels, crop, crop).
    pub fn tensor_shape(&self) -> [usize; 3] {
        let crop = self.crop_size as usize;
        [self.image.mode.channels(), crop, crop]
    }
}

/// Converts a per-worker GPU share into accounting units.
///
/// Fractions must lie in (0, 1]; shares above one GPU must be whole numbers.
pub fn gpu_share_units(share: f64) -> Result<u32, ConfigError> {
    if !share.is_finite() || share < 0.0 {
        return Err(ConfigError::InvalidGpuShare(share));
    }
    if share == 0.0 {
        return Ok(0);
    }
    if share > 1.0 && share.fract() != 0.0 {
        return Err(ConfigError::InvalidGpuShare(share));
    }
    let units = (share * f64::from(MILLI_GPU)).round();
    if units < 1.0 || units > f64::from(u32::MAX) {
        return Err(ConfigError::InvalidGpuShare(share));
    }
    Ok(units as u32)
}
