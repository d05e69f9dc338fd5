use super::preprocess::Preprocessor;
use super::types::{RawMask, SegmentationModel};
use crate::config::SegmentationConfig;
use anyhow::{Context, Result};
use image::RgbaImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

/// Single-output person segmentation model (selfie / portrait style).
///
/// The first output is read as a foreground probability plane, either as
/// probabilities or as logits depending on `apply_sigmoid`.
pub struct OnnxSegmenter {
    session: Session,
    preprocessor: Preprocessor,
    width: u32,
    height: u32,
    apply_sigmoid: bool,
    min_subject_coverage: f32,
}

impl OnnxSegmenter {
    /// Create a new segmenter from an ONNX file
    ///
    /// # Arguments
    /// * `model_path` - Path to the ONNX model file
    /// * `config` - Input size, normalization and output interpretation
    pub fn new<P: AsRef<Path>>(model_path: P, config: &SegmentationConfig) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading segmentation model from {}", path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!(
            "Segmentation model ready, input {}x{}",
            config.input_width,
            config.input_height
        );

        Ok(Self {
            session,
            preprocessor: Preprocessor::new(
                config.input_width,
                config.input_height,
                config.mean,
                config.std,
            ),
            width: config.input_width,
            height: config.input_height,
            apply_sigmoid: config.apply_sigmoid,
            min_subject_coverage: config.min_subject_coverage,
        })
    }
}

impl SegmentationModel for OnnxSegmenter {
    fn segment(&mut self, frame: &RgbaImage) -> Result<RawMask> {
        let _span = tracing::debug_span!("onnx_segment").entered();

        let tensor = self.preprocessor.preprocess(frame);
        let shape = tensor.shape().to_vec();
        let (data, _offset) = tensor.into_raw_vec_and_offset();
        let input = Tensor::from_array((shape, data.into_boxed_slice()))
            .context("Failed to build input tensor")?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![input])
            .context("Failed to run inference")?;
        drop(_infer_span);

        let (out_shape, out_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("Segmentation output is not an f32 tensor")?;

        let mask = Preprocessor::output_to_mask(out_shape, out_data, self.apply_sigmoid)?;
        Ok(RawMask::from_mask(mask, self.min_subject_coverage))
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
