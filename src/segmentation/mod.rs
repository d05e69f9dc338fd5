mod onnx;
mod preprocess;
pub mod types;

pub use onnx::OnnxSegmenter;
pub use preprocess::Preprocessor;
pub use types::{share, RawMask, SegmentationModel, SharedModel};

use crate::config::SegmentationConfig;
use anyhow::Result;

/// Create the default segmentation model (generic single-output ONNX)
pub fn create_default_model(
    model_path: &str,
    config: &SegmentationConfig,
) -> Result<Box<dyn SegmentationModel>> {
    let model = OnnxSegmenter::new(model_path, config)?;
    Ok(Box::new(model))
}
