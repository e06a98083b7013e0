//! Engine configuration: TOML file, `FACELOOKUP_*` environment overrides, validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Every tunable of the recognition engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub detector: DetectorConfig,
    pub preprocess: PreprocessConfig,
    pub lbph: LbphConfig,
    pub matcher: MatcherConfig,
    pub model: ModelConfig,
    pub pipeline: PipelineConfig,
    pub annotation: AnnotationConfig,
}

/// Multi-scale detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Geometric step between pyramid levels.
    pub scale_factor: f64,
    /// Overlapping raw detections a candidate needs to be kept.
    pub min_neighbors: u32,
    /// Smallest accepted face box, `[width, height]`.
    pub min_size: [u32; 2],
    /// Upper bound on faces returned per image; the largest boxes win.
    pub max_faces: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 5,
            min_size: [30, 30],
            max_faces: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Canonical face size `[width, height]`; training and inference must agree.
    pub canonical_size: [u32; 2],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            canonical_size: [100, 100],
        }
    }
}

/// Local binary pattern histogram parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbphConfig {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphConfig {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

/// Distance bands used for reporting. Distances are LBPH chi-square, lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceTiers {
    pub excellent_below: f64,
    pub good_below: f64,
    pub fair_up_to: f64,
}

impl Default for ConfidenceTiers {
    fn default() -> Self {
        Self {
            excellent_below: 50.0,
            good_below: 80.0,
            fair_up_to: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// A face resolves to an identity when its distance is at most this value.
    pub threshold: f64,
    /// Distance at which the reported confidence reaches 0%.
    pub max_expected_distance: f64,
    pub tiers: ConfidenceTiers,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: 100.0,
            max_expected_distance: 100.0,
            tiers: ConfidenceTiers::default(),
        }
    }
}

/// What readers get while the model no longer reflects enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessPolicy {
    /// Keep answering from the previous model; rebuild off the read path.
    ServeStale,
    /// The next caller rebuilds synchronously before matching.
    BlockUntilRebuilt,
}

impl StalenessPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServeStale => "serve_stale",
            Self::BlockUntilRebuilt => "block_until_rebuilt",
        }
    }
}

impl std::str::FromStr for StalenessPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serve_stale" => Ok(Self::ServeStale),
            "block_until_rebuilt" => Ok(Self::BlockUntilRebuilt),
            other => Err(ConfigError::Invalid(format!(
                "unknown staleness policy {other:?} (expected serve_stale or block_until_rebuilt)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub staleness: StalenessPolicy,
    /// Spawn a worker thread that rebuilds as soon as enrollment changes.
    pub background_rebuild: bool,
    /// How long a cold-start reader waits for an in-flight rebuild.
    pub rebuild_wait_secs: u64,
    /// Where the last trained model is persisted, if anywhere.
    pub cache_path: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            staleness: StalenessPolicy::ServeStale,
            background_rebuild: true,
            rebuild_wait_secs: 30,
            cache_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Images larger than this are downscaled for detection, `[width, height]`.
    pub max_image_size: [u32; 2],
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_image_size: [1920, 1080],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    /// Known faces in the excellent/good tiers.
    pub known_color: [u8; 3],
    /// Known faces in the fair/reject tiers.
    pub weak_color: [u8; 3],
    pub unknown_color: [u8; 3],
    pub error_color: [u8; 3],
    /// TrueType font for labels; the built-in bitmap font is used when unset.
    pub font_path: Option<PathBuf>,
    pub font_size: f32,
    pub draw_summary: bool,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            known_color: [0, 200, 0],
            weak_color: [255, 165, 0],
            unknown_color: [220, 0, 0],
            error_color: [128, 128, 128],
            font_path: None,
            font_size: 16.0,
            draw_summary: true,
        }
    }
}

impl EngineConfig {
    /// Load from an optional TOML file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override individual settings from `FACELOOKUP_*` variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse::<f64>("FACELOOKUP_THRESHOLD") {
            self.matcher.threshold = v;
        }
        if let Some(v) = env_parse::<usize>("FACELOOKUP_MAX_FACES") {
            self.detector.max_faces = v;
        }
        if let Some(v) = env_parse::<f64>("FACELOOKUP_SCALE_FACTOR") {
            self.detector.scale_factor = v;
        }
        if let Some(v) = env_parse::<u32>("FACELOOKUP_MIN_NEIGHBORS") {
            self.detector.min_neighbors = v;
        }
        if let Some(v) = env_parse::<u32>("FACELOOKUP_MIN_FACE_SIZE") {
            self.detector.min_size = [v, v];
        }
        if let Ok(v) = std::env::var("FACELOOKUP_STALENESS") {
            self.model.staleness = v.parse()?;
        }
        if let Ok(v) = std::env::var("FACELOOKUP_MODEL_CACHE") {
            self.model.cache_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("FACELOOKUP_FONT") {
            self.annotation.font_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        if !(d.scale_factor > 1.0) {
            return Err(invalid(format!("detector.scale_factor must be > 1, got {}", d.scale_factor)));
        }
        if d.min_size[0] == 0 || d.min_size[1] == 0 {
            return Err(invalid("detector.min_size must be non-zero"));
        }
        if d.max_faces == 0 {
            return Err(invalid("detector.max_faces must be at least 1"));
        }

        let l = &self.lbph;
        if l.radius == 0 || !(1..=12).contains(&l.neighbors) || l.grid_x == 0 || l.grid_y == 0 {
            return Err(invalid(format!(
                "lbph: radius >= 1, neighbors in 1..=12 and non-zero grid required, got {l:?}"
            )));
        }
        let [cw, ch] = self.preprocess.canonical_size;
        let inner_w = cw.saturating_sub(2 * l.radius);
        let inner_h = ch.saturating_sub(2 * l.radius);
        if inner_w < l.grid_x || inner_h < l.grid_y {
            return Err(invalid(format!(
                "preprocess.canonical_size {cw}x{ch} too small for a {}x{} LBPH grid",
                l.grid_x, l.grid_y
            )));
        }

        let m = &self.matcher;
        if !(m.threshold >= 0.0) || !(m.max_expected_distance > 0.0) {
            return Err(invalid("matcher.threshold must be >= 0 and max_expected_distance > 0"));
        }
        let t = &m.tiers;
        if !(t.excellent_below <= t.good_below && t.good_below <= t.fair_up_to) {
            return Err(invalid(format!("matcher.tiers must be ordered, got {t:?}")));
        }

        let [mw, mh] = self.pipeline.max_image_size;
        if mw == 0 || mh == 0 {
            return Err(invalid("pipeline.max_image_size must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
