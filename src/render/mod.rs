mod accelerated;
mod software;
mod upload;

pub use accelerated::AcceleratedRenderer;
pub use software::{composite, SoftwareRenderer};
pub use upload::{draw_snapshot, upload_with_fallback, FrameUploader, UploadOutcome};

use crate::background::BackgroundAsset;
use crate::config::RenderConfig;
use crate::refine::RefinedMask;
use anyhow::Result;
use image::RgbaImage;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;

pub const MAX_FEATHER_PX: f32 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Accelerated,
    Software,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Accelerated => "accelerated",
            BackendKind::Software => "software",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accelerated" | "gpu" | "webgpu" => Ok(BackendKind::Accelerated),
            "software" | "cpu" | "canvas" => Ok(BackendKind::Software),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Per-frame parameters shared by both backends.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderParams {
    /// Background opacity in [0, 1]
    pub opacity: f32,
    /// Feather radius in output pixels, 0-15
    pub feather_px: f32,
    pub mirror: bool,
    pub neutral: [u8; 3],
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            opacity: 1.0,
            feather_px: 0.0,
            mirror: true,
            neutral: [0, 0, 0],
        }
    }
}

impl RenderParams {
    pub fn from_config(config: &RenderConfig) -> Self {
        let mut params = Self {
            mirror: config.mirror,
            neutral: config.neutral_rgb(),
            ..Self::default()
        };
        params.set_opacity_percent(config.opacity as f32);
        params.set_feather(config.feather as f32);
        params
    }

    /// Opacity arrives as 0-100.
    pub fn set_opacity_percent(&mut self, percent: f32) {
        let percent = if percent.is_finite() { percent } else { 0.0 };
        self.opacity = percent.clamp(0.0, 100.0) / 100.0;
    }

    pub fn set_feather(&mut self, px: f32) {
        let px = if px.is_finite() { px } else { 0.0 };
        self.feather_px = px.round().clamp(0.0, MAX_FEATHER_PX);
    }
}

/// Everything a backend needs to draw one frame.
pub struct RenderInput<'a> {
    pub frame: &'a RgbaImage,
    pub mask: Option<&'a RefinedMask>,
    pub background: Option<&'a BackgroundAsset>,
    pub params: &'a RenderParams,
    pub output: (u32, u32),
}

impl RenderInput<'_> {
    /// The mask, but only when it reports a subject.
    pub fn subject_mask(&self) -> Option<&RefinedMask> {
        self.mask.filter(|m| m.subject_detected)
    }

    /// Background opacity actually applied this frame. Forced to zero
    /// without a detected subject.
    pub fn effective_opacity(&self) -> f32 {
        if self.subject_mask().is_some() {
            self.params.opacity.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// One of the two interchangeable rendering backends.
pub trait FrameRenderer {
    fn kind(&self) -> BackendKind;

    /// Draw one composited frame at `input.output` size.
    fn render(&mut self, input: &RenderInput<'_>) -> Result<RgbaImage>;

    /// Drop device resources. Further calls to `render` may fail.
    fn release(&mut self);

    /// Background and mask blending entry points, when the backend's
    /// pipeline has them. Decided once when the renderer is created.
    fn composite_binding(&mut self) -> Option<&mut dyn CompositeBinding> {
        None
    }
}

/// Optional capability of a backend that blends background and mask itself
/// rather than receiving them with every frame.
pub trait CompositeBinding {
    fn bind_background(&mut self, background: Option<&Arc<BackgroundAsset>>);
    fn update_mask(&mut self, mask: Option<&Rc<RefinedMask>>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn opacity_and_feather_are_clamped() {
        let mut p = RenderParams::default();
        p.set_opacity_percent(60.0);
        assert!((p.opacity - 0.6).abs() < 1e-6);
        p.set_opacity_percent(250.0);
        assert_eq!(p.opacity, 1.0);
        p.set_opacity_percent(-3.0);
        assert_eq!(p.opacity, 0.0);

        p.set_feather(7.6);
        assert_eq!(p.feather_px, 8.0);
        p.set_feather(40.0);
        assert_eq!(p.feather_px, MAX_FEATHER_PX);
        p.set_feather(f32::NAN);
        assert_eq!(p.feather_px, 0.0);
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("gpu".parse::<BackendKind>(), Ok(BackendKind::Accelerated));
        assert_eq!("Software".parse::<BackendKind>(), Ok(BackendKind::Software));
        assert!("metal".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Accelerated.to_string(), "accelerated");
    }

    #[test]
    fn no_subject_forces_zero_opacity() {
        let frame = RgbaImage::new(2, 2);
        let params = RenderParams {
            opacity: 0.8,
            ..RenderParams::default()
        };
        let mask = RefinedMask {
            alpha: GrayImage::new(2, 2),
            subject_detected: false,
        };
        let input = RenderInput {
            frame: &frame,
            mask: Some(&mask),
            background: None,
            params: &params,
            output: (2, 2),
        };
        assert_eq!(input.effective_opacity(), 0.0);
        assert!(input.subject_mask().is_none());
    }
}
