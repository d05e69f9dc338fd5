use anyhow::Result;
use image::{GrayImage, RgbaImage};
use std::sync::{Arc, Mutex};

/// Raw model output at inference resolution.
///
/// Values are 0 = background, 255 = foreground. The resolution is whatever
/// the model produced and generally differs from the output resolution.
#[derive(Debug, Clone)]
pub struct RawMask {
    pub mask: GrayImage,
    pub subject_detected: bool,
}

impl RawMask {
    pub fn dimensions(&self) -> (u32, u32) {
        self.mask.dimensions()
    }

    /// Build a raw mask, deciding subject presence from how many samples
    /// reach half intensity.
    pub fn from_mask(mask: GrayImage, min_subject_coverage: f32) -> Self {
        let subject_detected = coverage(&mask) >= min_subject_coverage && !mask.is_empty();
        Self {
            mask,
            subject_detected,
        }
    }
}

/// Fraction of samples >= 128.
pub fn coverage(mask: &GrayImage) -> f32 {
    let total = mask.as_raw().len();
    if total == 0 {
        return 0.0;
    }
    let on = mask.as_raw().iter().filter(|&&v| v >= 128).count();
    on as f32 / total as f32
}

/// Trait for segmentation models
/// Allows swapping between different backends (generic ONNX, test doubles, ...)
pub trait SegmentationModel: Send {
    /// Produce a foreground probability mask for one frame.
    fn segment(&mut self, frame: &RgbaImage) -> Result<RawMask>;

    /// Reset internal state (for models with temporal/recurrent components)
    ///
    /// Called at every session start.
    fn reset_state(&mut self) {
        // Default implementation: no-op for stateless models
    }

    /// Get the model's preferred input dimensions
    ///
    /// Returns (width, height)
    fn input_size(&self) -> (u32, u32);
}

/// Model handle shared between sessions and lent to the blocking inference
/// task one cycle at a time.
pub type SharedModel = Arc<Mutex<Box<dyn SegmentationModel>>>;

pub fn share(model: Box<dyn SegmentationModel>) -> SharedModel {
    Arc::new(Mutex::new(model))
}
