use anyhow::{bail, Result};
use image::{imageops, GrayImage, RgbImage, RgbaImage};
use ndarray::Array4;

/// Preprocessor for converting camera frames to model input tensors
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32, mean: [f32; 3], std: [f32; 3]) -> Self {
        Self {
            target_width,
            target_height,
            mean,
            std,
        }
    }

    /// Preprocess an RGBA frame into a normalized NCHW tensor
    ///
    /// Steps:
    /// 1. Resize to target dimensions (plain stretch, no letterbox)
    /// 2. Scale to [0, 1], then apply per-channel (v - mean) / std
    /// 3. Transpose from HWC to NCHW format
    ///
    /// Returns: Array4<f32> with shape [1, 3, height, width]
    pub fn preprocess(&self, image: &RgbaImage) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized = if image.dimensions() != (self.target_width, self.target_height) {
            imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            )
        } else {
            image.clone()
        };

        let (width, height) = resized.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                let v = pixel[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (v - self.mean[c]) / self.std[c];
            }
        }

        tensor
    }

    /// Turn a flat model output plane into a u8 mask.
    ///
    /// `shape` may be `[N, 1, H, W]`, `[N, H, W]` or `[H, W]`; only the first
    /// plane is read. With `apply_sigmoid` the values are treated as logits.
    pub fn output_to_mask(shape: &[i64], data: &[f32], apply_sigmoid: bool) -> Result<GrayImage> {
        let _span = tracing::debug_span!("postprocess").entered();

        let (h, w) = match shape {
            [_, _, h, w] => (*h, *w),
            [_, h, w] => (*h, *w),
            [h, w] => (*h, *w),
            other => bail!("unexpected segmentation output shape {:?}", other),
        };
        if h <= 0 || w <= 0 {
            bail!("segmentation output has empty plane {}x{}", w, h);
        }
        let (w, h) = (w as u32, h as u32);
        let plane = (w * h) as usize;
        if data.len() < plane {
            bail!(
                "segmentation output holds {} values, expected at least {}",
                data.len(),
                plane
            );
        }

        let values = data[..plane].iter().map(|&p| {
            let p = if apply_sigmoid { 1.0 / (1.0 + (-p).exp()) } else { p };
            (p * 255.0).clamp(0.0, 255.0) as u8
        });
        GrayImage::from_vec(w, h, values.collect())
            .ok_or_else(|| anyhow::anyhow!("mask buffer does not match {}x{}", w, h))
    }

    /// Convert a mask to a grayscale RGB image for visualization
    pub fn mask_to_rgb(mask: &GrayImage) -> RgbImage {
        RgbImage::from_fn(mask.width(), mask.height(), |x, y| {
            let v = mask.get_pixel(x, y)[0];
            image::Rgb([v, v, v])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_normalizes_into_nchw() {
        let pre = Preprocessor::new(2, 2, [0.5; 3], [0.5; 3]);
        let frame = RgbaImage::from_pixel(4, 4, image::Rgba([255, 0, 255, 255]));
        let t = pre.preprocess(&frame);
        assert_eq!(t.shape(), &[1, 3, 2, 2]);
        assert!((t[[0, 0, 1, 1]] - 1.0).abs() < 1e-5);
        assert!((t[[0, 1, 0, 0]] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn output_shapes_are_accepted() {
        let data = vec![0.0f32, 1.0, 0.5, 1.0];
        for shape in [vec![1, 1, 2, 2], vec![1, 2, 2], vec![2, 2]] {
            let m = Preprocessor::output_to_mask(&shape, &data, false).unwrap();
            assert_eq!(m.dimensions(), (2, 2));
            assert_eq!(m.get_pixel(1, 0)[0], 255);
            assert_eq!(m.get_pixel(0, 1)[0], 127);
        }
        assert!(Preprocessor::output_to_mask(&[4], &data, false).is_err());
        assert!(Preprocessor::output_to_mask(&[1, 1, 4, 4], &data, false).is_err());
    }

    #[test]
    fn logits_go_through_sigmoid() {
        let m = Preprocessor::output_to_mask(&[1, 1], &[0.0], true).unwrap();
        assert_eq!(m.get_pixel(0, 0)[0], 127);
    }
}
