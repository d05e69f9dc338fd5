use super::OutputSink;
use anyhow::{Context, Result};
use image::RgbaImage;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, FourCC, Format};

/// Composited frames written to a v4l2loopback device as YUYV.
pub struct V4L2Output {
    file: File,
    width: u32,
    height: u32,
    scratch: Vec<u8>,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!("Opening v4l2loopback {} at {}x{}", path.display(), width, height);

        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2 device at {}", path.display()))?;
        let requested = Format::new(width, height, FourCC::new(b"YUYV"));
        let negotiated = Output::set_format(&device, &requested)
            .with_context(|| format!("Failed to set YUYV {}x{} on {}", width, height, path.display()))?;
        if (negotiated.width, negotiated.height) != (width, height) {
            tracing::warn!(
                "Loopback negotiated {}x{} instead of {}x{}",
                negotiated.width,
                negotiated.height,
                width,
                height
            );
        }

        // Frames are plain writes of one packed YUYV image each
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {} for writing", path.display()))?;

        Ok(Self {
            file,
            width,
            height,
            scratch: Vec::with_capacity((width * height * 2) as usize),
        })
    }
}

/// Pack RGBA pixels into YUV 4:2:2 (YUYV), dropping alpha.
///
/// Each horizontal pair shares one chroma sample; an odd last column is
/// paired with itself.
pub fn rgba_to_yuyv(image: &RgbaImage, out: &mut Vec<u8>) {
    let (width, height) = image.dimensions();
    out.clear();
    out.reserve((width * height * 2) as usize);
    if width == 0 {
        return;
    }

    for row in image.as_raw().chunks_exact(width as usize * 4) {
        for pair in row.chunks(8) {
            let left = &pair[..4];
            let right = if pair.len() == 8 { &pair[4..] } else { left };

            let (y0, u0, v0) = bt601(left[0], left[1], left[2]);
            let (y1, u1, v1) = bt601(right[0], right[1], right[2]);
            let u = ((u0 as u16 + u1 as u16 + 1) / 2) as u8;
            let v = ((v0 as u16 + v1 as u16 + 1) / 2) as u8;

            out.extend_from_slice(&[y0, u, y1, v]);
        }
    }
}

/// Full-range BT.601 in 8.8 fixed point.
fn bt601(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = (77 * r + 150 * g + 29 * b + 128) >> 8;
    let u = ((-43 * r - 85 * g + 128 * b + 128) >> 8) + 128;
    let v = ((128 * r - 107 * g - 21 * b + 128) >> 8) + 128;
    (clamp_u8(y), clamp_u8(u), clamp_u8(v))
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()> {
        let resized;
        let frame = if frame.dimensions() != (self.width, self.height) {
            resized = image::imageops::resize(
                frame,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            );
            &resized
        } else {
            frame
        };

        rgba_to_yuyv(frame, &mut self.scratch);

        self.file
            .write_all(&self.scratch)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_is_two_bytes_per_pixel() {
        let img = RgbaImage::from_pixel(4, 2, image::Rgba([255, 255, 255, 255]));
        let mut out = Vec::new();
        rgba_to_yuyv(&img, &mut out);
        assert_eq!(out.len(), 4 * 2 * 2);
        assert!(out[0] >= 254);
        assert!((127..=128).contains(&out[1]));
    }

    #[test]
    fn black_maps_to_zero_luma_neutral_chroma() {
        let img = RgbaImage::from_pixel(2, 1, image::Rgba([0, 0, 0, 255]));
        let mut out = Vec::new();
        rgba_to_yuyv(&img, &mut out);
        assert_eq!(out, vec![0, 128, 0, 128]);
    }

    #[test]
    fn odd_width_pairs_last_pixel_with_itself() {
        let img = RgbaImage::from_fn(3, 1, |x, _| {
            if x == 2 {
                image::Rgba([255, 0, 0, 255])
            } else {
                image::Rgba([0, 0, 0, 255])
            }
        });
        let mut out = Vec::new();
        rgba_to_yuyv(&img, &mut out);
        assert_eq!(out.len(), 8);
        // Red pushes V up and U down
        assert!(out[7] > 200);
        assert!(out[5] < 128);
        assert_eq!(out[4], out[6]);
    }
}
