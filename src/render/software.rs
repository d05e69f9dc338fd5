//! Canvas-style compositing on the CPU.
//!
//! Layers are drawn onto a premultiplied f32 canvas with the same operators
//! a 2D canvas offers (source-over, destination-out, destination-in,
//! lighter), in this order:
//!
//! 1. real background at `1 - opacity`, with the subject cut out
//! 2. background asset (or neutral fill) at `opacity`, added
//! 3. video frame masked to the subject, on top
//!
//! Outside the subject that leaves `(1 - o) * real + o * asset`.

use super::{BackendKind, FrameRenderer, RenderInput};
use crate::background::{cover_fit, cover_fit_as};
use anyhow::Result;
use image::{imageops, GrayImage, Rgba, RgbaImage};
use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    SourceOver,
    DestinationOut,
    DestinationIn,
    Lighter,
}

/// Premultiplied RGBA working buffer.
#[derive(Debug, Default)]
struct Canvas {
    width: u32,
    height: u32,
    px: Vec<[f32; 4]>,
}

impl Canvas {
    fn resize(&mut self, width: u32, height: u32) {
        if (self.width, self.height) != (width, height) {
            self.width = width;
            self.height = height;
            self.px = vec![[0.0; 4]; (width * height) as usize];
        }
    }

    fn clear(&mut self) {
        self.px.fill([0.0; 4]);
    }

    fn draw_image(&mut self, image: &RgbaImage, alpha: f32, op: Op) {
        for (d, p) in self.px.iter_mut().zip(image.pixels()) {
            let a = p[3] as f32 / 255.0 * alpha;
            let s = [
                p[0] as f32 / 255.0 * a,
                p[1] as f32 / 255.0 * a,
                p[2] as f32 / 255.0 * a,
                a,
            ];
            apply(op, s, d);
        }
    }

    fn fill(&mut self, color: [u8; 3], alpha: f32, op: Op) {
        let s = [
            color[0] as f32 / 255.0 * alpha,
            color[1] as f32 / 255.0 * alpha,
            color[2] as f32 / 255.0 * alpha,
            alpha,
        ];
        for d in self.px.iter_mut() {
            apply(op, s, d);
        }
    }

    /// Use the mask as the source alpha; its colour never matters for the
    /// destination operators.
    fn draw_mask(&mut self, mask: &GrayImage, op: Op) {
        for (d, m) in self.px.iter_mut().zip(mask.pixels()) {
            let a = m[0] as f32 / 255.0;
            apply(op, [0.0, 0.0, 0.0, a], d);
        }
    }

    fn draw_canvas(&mut self, other: &Canvas, op: Op) {
        for (d, s) in self.px.iter_mut().zip(other.px.iter()) {
            apply(op, *s, d);
        }
    }

    /// Flatten over black.
    fn to_rgba(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        for (o, p) in out.pixels_mut().zip(self.px.iter()) {
            *o = Rgba([
                to_u8(p[0]),
                to_u8(p[1]),
                to_u8(p[2]),
                255,
            ]);
        }
        out
    }
}

fn apply(op: Op, s: [f32; 4], d: &mut [f32; 4]) {
    match op {
        Op::SourceOver => {
            let k = 1.0 - s[3];
            for c in 0..4 {
                d[c] = s[c] + d[c] * k;
            }
        }
        Op::DestinationOut => {
            let k = 1.0 - s[3];
            for c in d.iter_mut() {
                *c *= k;
            }
        }
        Op::DestinationIn => {
            for c in d.iter_mut() {
                *c *= s[3];
            }
        }
        Op::Lighter => {
            for c in 0..4 {
                d[c] = (s[c] + d[c]).min(1.0);
            }
        }
    }
}

fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

fn fit<'a>(image: &'a RgbaImage, output: (u32, u32)) -> Cow<'a, RgbaImage> {
    if image.dimensions() == output {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(cover_fit(image, output.0, output.1))
    }
}

/// The mask spans the whole captured frame, so it gets the frame's crop.
fn fit_mask<'a>(
    mask: &'a GrayImage,
    frame: (u32, u32),
    output: (u32, u32),
) -> Cow<'a, GrayImage> {
    if mask.dimensions() == output && frame == output {
        Cow::Borrowed(mask)
    } else {
        Cow::Owned(cover_fit_as(mask, frame, output.0, output.1))
    }
}

/// Software backend. Owns its two working canvases for the session.
#[derive(Debug, Default)]
pub struct SoftwareRenderer {
    scene: Canvas,
    foreground: Canvas,
}

impl SoftwareRenderer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameRenderer for SoftwareRenderer {
    fn kind(&self) -> BackendKind {
        BackendKind::Software
    }

    fn render(&mut self, input: &RenderInput<'_>) -> Result<RgbaImage> {
        let _span = tracing::debug_span!("software_composite").entered();
        Ok(composite_into(
            &mut self.scene,
            &mut self.foreground,
            input,
        ))
    }

    fn release(&mut self) {
        self.scene = Canvas::default();
        self.foreground = Canvas::default();
    }
}

/// Composite one frame with fresh canvases.
pub fn composite(input: &RenderInput<'_>) -> RgbaImage {
    let mut scene = Canvas::default();
    let mut foreground = Canvas::default();
    composite_into(&mut scene, &mut foreground, input)
}

fn composite_into(scene: &mut Canvas, foreground: &mut Canvas, input: &RenderInput<'_>) -> RgbaImage {
    let (w, h) = input.output;
    scene.resize(w, h);
    scene.clear();

    let opacity = input.effective_opacity();

    // The real background is the video frame itself; mirroring applies to
    // it and the mask together so the subject stays registered.
    let mut frame = fit(input.frame, input.output);
    let mut mask = input
        .subject_mask()
        .map(|m| fit_mask(&m.alpha, input.frame.dimensions(), input.output));
    if input.params.mirror {
        frame = Cow::Owned(imageops::flip_horizontal(&*frame));
        mask = mask.map(|m| Cow::Owned(imageops::flip_horizontal(&*m)));
    }

    scene.draw_image(&frame, 1.0 - opacity, Op::SourceOver);
    if let Some(mask) = &mask {
        scene.draw_mask(mask, Op::DestinationOut);
    }

    if opacity > 0.0 {
        match input.background {
            Some(bg) => {
                let bg = fit(&bg.canvas, input.output);
                scene.draw_image(&bg, opacity, Op::Lighter);
            }
            None => scene.fill(input.params.neutral, opacity, Op::Lighter),
        }
    }

    if let Some(mask) = &mask {
        foreground.resize(w, h);
        foreground.clear();
        foreground.draw_image(&frame, 1.0, Op::SourceOver);
        foreground.draw_mask(mask, Op::DestinationIn);
        scene.draw_canvas(foreground, Op::SourceOver);
    }

    scene.to_rgba()
}
