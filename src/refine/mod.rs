//! Mask post-processing: raw inference output to a stable alpha channel.
//!
//! Stages run in a fixed order:
//! 1. soft threshold (sigmoid around `threshold`)
//! 2. temporal smoothing (EMA against the previous frame)
//! 3. 3x3 morphology
//! 4. feather blur, sized in mask space
//!
//! and the result is always resampled to the output resolution. The mask
//! keeps spanning the whole captured frame; renderers crop it together with
//! the frame.

mod morphology;

pub use morphology::{close3x3, dilate3x3, erode3x3};

use image::{imageops, GrayImage};
use serde::Deserialize;

use crate::background::cover_scale;

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MorphMode {
    None,
    Dilate,
    Erode,
    #[default]
    Close,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RefineOptions {
    /// Sigmoid centre in [0, 1]
    pub threshold: f32,
    /// Sigmoid steepness
    pub steepness: f32,
    /// Weight of the previous frame in the EMA, [0, 1]
    pub smoothing: f32,
    pub morphology: MorphMode,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            steepness: 6.0,
            smoothing: 0.6,
            morphology: MorphMode::Close,
        }
    }
}

/// Refined alpha at output resolution, ready for either renderer.
#[derive(Debug, Clone)]
pub struct RefinedMask {
    pub alpha: GrayImage,
    pub subject_detected: bool,
}

impl RefinedMask {
    pub fn dimensions(&self) -> (u32, u32) {
        self.alpha.dimensions()
    }
}

/// Stateful refiner. The only carried state is the previous smoothed buffer,
/// dropped whenever the raw mask size changes.
#[derive(Debug, Default)]
pub struct MaskRefiner {
    prev: Option<SmoothState>,
}

#[derive(Debug)]
struct SmoothState {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl MaskRefiner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.prev = None;
    }

    /// Run every stage on `raw` and resample to `output` (width, height).
    ///
    /// `raw` covers the `frame` sized capture. `feather_px` is measured in
    /// output pixels after the frame is cover-fitted; zero disables the blur.
    pub fn refine(
        &mut self,
        raw: &GrayImage,
        frame: (u32, u32),
        output: (u32, u32),
        options: &RefineOptions,
        feather_px: f32,
    ) -> GrayImage {
        let _span = tracing::debug_span!("refine").entered();
        let (w, h) = raw.dimensions();

        let mut alpha: Vec<f32> = raw
            .as_raw()
            .iter()
            .map(|&v| soft_threshold(v as f32 / 255.0, options.threshold, options.steepness))
            .collect();

        self.smooth(&mut alpha, w, h, options.smoothing);

        let smoothed = GrayImage::from_fn(w, h, |x, y| {
            image::Luma([to_u8(alpha[(y * w + x) as usize])])
        });

        let shaped = match options.morphology {
            MorphMode::None => smoothed,
            MorphMode::Dilate => dilate3x3(&smoothed),
            MorphMode::Erode => erode3x3(&smoothed),
            MorphMode::Close => close3x3(&smoothed),
        };

        let feathered = feather(&shaped, mask_to_output_scale(w, frame, output), feather_px);
        resample(&feathered, output.0, output.1)
    }

    fn smooth(&mut self, alpha: &mut [f32], width: u32, height: u32, s: f32) {
        match &mut self.prev {
            Some(prev) if prev.width == width && prev.height == height => {
                for (a, p) in alpha.iter_mut().zip(prev.values.iter_mut()) {
                    *a = s * *p + (1.0 - s) * *a;
                    *p = *a;
                }
            }
            _ => {
                self.prev = Some(SmoothState {
                    width,
                    height,
                    values: alpha.to_vec(),
                });
            }
        }
    }
}

/// `sigmoid(k * (a - t))` for `a` in [0, 1].
pub fn soft_threshold(a: f32, t: f32, k: f32) -> f32 {
    1.0 / (1.0 + (-k * (a - t)).exp())
}

/// Output pixels per mask pixel once the frame the mask covers is cover-fitted
/// into `output`.
pub fn mask_to_output_scale(mask_width: u32, frame: (u32, u32), output: (u32, u32)) -> f32 {
    if mask_width == 0 {
        return 1.0;
    }
    let frame_per_mask = frame.0 as f64 / mask_width as f64;
    (frame_per_mask * cover_scale(frame, output)) as f32
}

/// Blur `mask` so that the softened edge spans `feather_px` pixels once each
/// mask pixel becomes `scale_to_output` output pixels.
pub fn feather(mask: &GrayImage, scale_to_output: f32, feather_px: f32) -> GrayImage {
    if feather_px <= 0.0 || mask.width() == 0 || scale_to_output <= 0.0 {
        return mask.clone();
    }
    let sigma = (feather_px / scale_to_output).max(0.25);
    imageops::blur(mask, sigma)
}

/// Bilinear resample to exactly `width` x `height`.
pub fn resample(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    if mask.dimensions() == (width, height) {
        return mask.clone();
    }
    imageops::resize(mask, width, height, imageops::FilterType::Triangle)
}

fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(w: u32, h: u32, v: u8) -> GrayImage {
        GrayImage::from_pixel(w, h, image::Luma([v]))
    }

    fn no_morph() -> RefineOptions {
        RefineOptions {
            morphology: MorphMode::None,
            ..RefineOptions::default()
        }
    }

    #[test]
    fn soft_threshold_is_monotonic() {
        let mut last = f32::MIN;
        for i in 0..=255 {
            let s = soft_threshold(i as f32 / 255.0, 0.5, 6.0);
            assert!(s >= last, "sigmoid decreased at {}", i);
            last = s;
        }
        assert!((soft_threshold(0.5, 0.5, 6.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn first_frame_passes_through_unsmoothed() {
        let mut refiner = MaskRefiner::new();
        let opts = no_morph();
        let out = refiner.refine(&flat(4, 4, 200), (4, 4), (4, 4), &opts, 0.0);
        let expected = to_u8(soft_threshold(200.0 / 255.0, opts.threshold, opts.steepness));
        assert!(out.pixels().all(|p| p[0] == expected));
    }

    #[test]
    fn ema_converges_monotonically() {
        let mut refiner = MaskRefiner::new();
        let opts = no_morph();
        refiner.refine(&flat(4, 4, 0), (4, 4), (4, 4), &opts, 0.0);

        let target = to_u8(soft_threshold(1.0, opts.threshold, opts.steepness));
        let mut last = 0u8;
        for _ in 0..40 {
            let v = refiner
                .refine(&flat(4, 4, 255), (4, 4), (4, 4), &opts, 0.0)
                .get_pixel(1, 1)[0];
            assert!(v >= last);
            assert!(v <= target);
            last = v;
        }
        assert_eq!(last, target);
    }

    #[test]
    fn size_change_resets_smoothing() {
        let mut refiner = MaskRefiner::new();
        let opts = no_morph();
        refiner.refine(&flat(4, 4, 0), (4, 4), (4, 4), &opts, 0.0);

        let out = refiner.refine(&flat(8, 8, 255), (8, 8), (8, 8), &opts, 0.0);
        let expected = to_u8(soft_threshold(1.0, opts.threshold, opts.steepness));
        assert_eq!(out.get_pixel(3, 3)[0], expected);
    }

    #[test]
    fn output_is_resampled_to_requested_size() {
        let mut refiner = MaskRefiner::new();
        let out = refiner.refine(
            &flat(32, 18, 255),
            (1280, 720),
            (1280, 720),
            &RefineOptions::default(),
            0.0,
        );
        assert_eq!(out.dimensions(), (1280, 720));
    }

    #[test]
    fn feather_softens_edges_only_when_enabled() {
        let mut mask = GrayImage::new(20, 20);
        for y in 0..20 {
            for x in 10..20 {
                mask.put_pixel(x, y, image::Luma([255]));
            }
        }
        assert_eq!(feather(&mask, 2.0, 0.0), mask);

        let soft = feather(&mask, 2.0, 4.0);
        let edge = soft.get_pixel(9, 10)[0];
        assert!(edge > 0 && edge < 255, "edge value {}", edge);
    }

    #[test]
    fn scale_follows_frame_cover_fit() {
        // 32 mask columns over a 160 wide frame, halved into a 60x45 output
        assert!((mask_to_output_scale(32, (160, 90), (60, 45)) - 2.5).abs() < 1e-6);
        // Same-aspect output is a plain width ratio
        assert!((mask_to_output_scale(32, (1280, 720), (1280, 720)) - 40.0).abs() < 1e-4);
        assert_eq!(mask_to_output_scale(0, (160, 90), (60, 45)), 1.0);
    }

    #[test]
    fn feather_narrows_as_mask_pixels_grow() {
        let mut mask = GrayImage::new(40, 8);
        for y in 0..8 {
            for x in 20..40 {
                mask.put_pixel(x, y, image::Luma([255]));
            }
        }
        // 6 output pixels of feather spans 3 mask pixels at 2x, 1 at 6x
        let coarse = feather(&mask, 2.0, 6.0);
        let fine = feather(&mask, 6.0, 6.0);
        let softened = |m: &GrayImage| {
            (0..40)
                .filter(|&x| {
                    let v = m.get_pixel(x, 4)[0];
                    v > 8 && v < 247
                })
                .count()
        };
        assert!(
            softened(&fine) < softened(&coarse),
            "fine {} vs coarse {}",
            softened(&fine),
            softened(&coarse)
        );
        // Far from the edge nothing moves
        assert_eq!(fine.get_pixel(2, 4)[0], 0);
        assert_eq!(fine.get_pixel(30, 4)[0], 255);
    }
}
