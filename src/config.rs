use crate::error::ConfigError;
use crate::refine::RefineOptions;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Pipeline tuning loaded from an optional TOML file.
///
/// Every key is optional; a missing section or key takes its default.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub refine: RefineOptions,
    pub segmentation: SegmentationConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Delay between the end of one inference and the start of the next
    pub interval_ms: u64,
    pub input_width: u32,
    pub input_height: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Treat the model output as logits
    pub apply_sigmoid: bool,
    /// Fraction of mask samples >= 128 needed to count as a detected subject
    pub min_subject_coverage: f32,
    pub intra_threads: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 80,
            input_width: 256,
            input_height: 256,
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
            apply_sigmoid: true,
            min_subject_coverage: 0.002,
            intra_threads: 4,
        }
    }
}

impl SegmentationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    pub fps: u32,
    pub mirror: bool,
    /// Background opacity, 0-100
    pub opacity: u8,
    /// Feather radius in output pixels, 0-15
    pub feather: u8,
    pub neutral_color: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            mirror: true,
            opacity: 100,
            feather: 0,
            neutral_color: "#000000".to_string(),
        }
    }
}

impl RenderConfig {
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    pub fn neutral_rgb(&self) -> [u8; 3] {
        parse_hex_color(&self.neutral_color).unwrap_or([0, 0, 0])
    }
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.refine;
        if !(0.0..=1.0).contains(&r.threshold) {
            return Err(ConfigError::Invalid(format!(
                "refine.threshold must be in [0, 1], got {}",
                r.threshold
            )));
        }
        if !(0.0..=1.0).contains(&r.smoothing) {
            return Err(ConfigError::Invalid(format!(
                "refine.smoothing must be in [0, 1], got {}",
                r.smoothing
            )));
        }
        if r.steepness <= 0.0 {
            return Err(ConfigError::Invalid("refine.steepness must be positive".into()));
        }

        let s = &self.segmentation;
        if s.input_width == 0 || s.input_height == 0 {
            return Err(ConfigError::Invalid("segmentation input size must be non-zero".into()));
        }
        if s.std.iter().any(|v| *v == 0.0) {
            return Err(ConfigError::Invalid("segmentation.std must not contain zero".into()));
        }

        let render = &self.render;
        if render.fps == 0 {
            return Err(ConfigError::Invalid("render.fps must be non-zero".into()));
        }
        if render.opacity > 100 {
            return Err(ConfigError::Invalid(format!(
                "render.opacity must be 0-100, got {}",
                render.opacity
            )));
        }
        if render.feather > 15 {
            return Err(ConfigError::Invalid(format!(
                "render.feather must be 0-15, got {}",
                render.feather
            )));
        }
        if parse_hex_color(&render.neutral_color).is_none() {
            return Err(ConfigError::Invalid(format!(
                "render.neutral_color is not a #rrggbb colour: {}",
                render.neutral_color
            )));
        }
        Ok(())
    }
}

/// Parse `#rrggbb` (or `rrggbb`) into RGB bytes.
pub fn parse_hex_color(s: &str) -> Option<[u8; 3]> {
    let hex = s.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}
