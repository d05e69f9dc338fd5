use backdrop::background::{self, BackgroundSelection};
use backdrop::refine::{MaskRefiner, MorphMode, RefineOptions, RefinedMask};
use backdrop::render::{composite, FrameRenderer, RenderInput, RenderParams, SoftwareRenderer};
use image::{GrayImage, Luma, Rgba, RgbaImage};
use std::sync::Arc;

const W: u32 = 40;
const H: u32 = 20;

/// Every pixel distinct enough that a missing mirror would show.
fn video_frame() -> RgbaImage {
    RgbaImage::from_fn(W, H, |x, y| Rgba([(x * 6) as u8, (y * 12) as u8, 90, 255]))
}

/// 255 inside the centred 20x10 rectangle, 0 elsewhere.
fn centred_mask() -> GrayImage {
    GrayImage::from_fn(W, H, |x, y| {
        if (10..30).contains(&x) && (5..15).contains(&y) {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

fn mirrored(frame: &RgbaImage, x: u32, y: u32) -> Rgba<u8> {
    *frame.get_pixel(W - 1 - x, y)
}

fn assert_close(actual: &Rgba<u8>, expected: [f32; 3], at: (u32, u32)) {
    for c in 0..3 {
        let diff = (actual[c] as f32 - expected[c]).abs();
        assert!(
            diff <= 1.0,
            "channel {} at {:?}: got {}, expected {:.1}",
            c,
            at,
            actual[c],
            expected[c]
        );
    }
}

#[test]
fn opacity_sixty_blends_outside_and_keeps_subject() {
    let frame = video_frame();
    let beach = Arc::new(RgbaImage::from_pixel(80, 40, Rgba([200, 50, 10, 255])));
    let background = background::load(
        &BackgroundSelection::new("beach", "/unused"),
        Some(beach),
        (W, H),
        1,
    )
    .unwrap();

    let mask = RefinedMask {
        alpha: centred_mask(),
        subject_detected: true,
    };
    let mut params = RenderParams::default();
    params.set_opacity_percent(60.0);

    let out = composite(&RenderInput {
        frame: &frame,
        mask: Some(&mask),
        background: Some(&background),
        params: &params,
        output: (W, H),
    });

    for y in 0..H {
        for x in 0..W {
            let real = mirrored(&frame, x, y);
            let got = out.get_pixel(x, y);
            if (10..30).contains(&x) && (5..15).contains(&y) {
                assert_eq!(got, &Rgba([real[0], real[1], real[2], 255]), "subject at ({}, {})", x, y);
            } else {
                let expected = [
                    0.4 * real[0] as f32 + 0.6 * 200.0,
                    0.4 * real[1] as f32 + 0.6 * 50.0,
                    0.4 * real[2] as f32 + 0.6 * 10.0,
                ];
                assert_close(got, expected, (x, y));
            }
        }
    }
}

#[test]
fn no_subject_shows_real_background_regardless_of_opacity() {
    let frame = video_frame();
    let office = Arc::new(RgbaImage::from_pixel(W, H, Rgba([0, 255, 0, 255])));
    let background = background::load(
        &BackgroundSelection::new("office", "/unused"),
        Some(office),
        (W, H),
        1,
    )
    .unwrap();

    let mask = RefinedMask {
        alpha: centred_mask(),
        subject_detected: false,
    };

    let mut renderer = SoftwareRenderer::new();
    for opacity in [0.0, 60.0, 100.0] {
        let mut params = RenderParams::default();
        params.set_opacity_percent(opacity);
        let out = renderer
            .render(&RenderInput {
                frame: &frame,
                mask: Some(&mask),
                background: Some(&background),
                params: &params,
                output: (W, H),
            })
            .unwrap();

        for y in 0..H {
            for x in 0..W {
                let real = mirrored(&frame, x, y);
                assert_eq!(out.get_pixel(x, y), &Rgba([real[0], real[1], real[2], 255]));
            }
        }
    }
}

#[test]
fn unmirrored_output_keeps_orientation() {
    let frame = video_frame();
    let params = RenderParams {
        mirror: false,
        ..RenderParams::default()
    };
    let out = composite(&RenderInput {
        frame: &frame,
        mask: None,
        background: None,
        params: &params,
        output: (W, H),
    });
    assert_eq!(out.get_pixel(3, 4), frame.get_pixel(3, 4));
}

#[test]
fn capture_and_output_sizes_may_differ() {
    // 16:9 capture into a 4:3 output is cover-fitted, never stretched
    let frame = RgbaImage::from_pixel(160, 90, Rgba([10, 20, 30, 255]));
    let mask = RefinedMask {
        alpha: GrayImage::from_pixel(60, 45, Luma([255])),
        subject_detected: true,
    };
    let params = RenderParams::default();
    let out = composite(&RenderInput {
        frame: &frame,
        mask: Some(&mask),
        background: None,
        params: &params,
        output: (60, 45),
    });
    assert_eq!(out.dimensions(), (60, 45));
    assert_eq!(out.get_pixel(30, 20), &Rgba([10, 20, 30, 255]));
}

#[test]
fn subject_stays_on_its_pixels_across_aspect_ratios() {
    // Red subject at frame columns 120..140 on blue, segmented at 32x18
    let frame = RgbaImage::from_fn(160, 90, |x, _| {
        if (120..140).contains(&x) {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([0, 0, 255, 255])
        }
    });
    let raw = GrayImage::from_fn(32, 18, |x, _| {
        if (24..28).contains(&x) {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let options = RefineOptions {
        steepness: 40.0,
        morphology: MorphMode::None,
        ..RefineOptions::default()
    };
    let mut refiner = MaskRefiner::new();
    let alpha = refiner.refine(&raw, (160, 90), (60, 45), &options, 0.0);
    let mask = RefinedMask {
        alpha,
        subject_detected: true,
    };

    for mirror in [false, true] {
        let params = RenderParams {
            opacity: 1.0,
            neutral: [0, 0, 0],
            mirror,
            ..RenderParams::default()
        };
        let out = composite(&RenderInput {
            frame: &frame,
            mask: Some(&mask),
            background: None,
            params: &params,
            output: (60, 45),
        });
        // Unmirrored, the subject covers output columns 50..60
        let at = |x: u32| if mirror { 59 - x } else { x };
        for x in [54, 55, 56] {
            assert_close(out.get_pixel(at(x), 22), [255.0, 0.0, 0.0], (at(x), 22));
        }
        for x in [20, 40, 45] {
            assert_close(out.get_pixel(at(x), 22), [0.0, 0.0, 0.0], (at(x), 22));
        }
    }
}

#[test]
fn refined_mask_drives_the_composite_at_output_size() {
    // Raw inference output at a quarter of the output resolution
    let raw = GrayImage::from_fn(W / 4, H / 4, |x, y| {
        if (3..7).contains(&x) && (1..4).contains(&y) {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let options = RefineOptions {
        steepness: 40.0,
        morphology: MorphMode::None,
        ..RefineOptions::default()
    };
    let mut refiner = MaskRefiner::new();
    let alpha = refiner.refine(&raw, (W, H), (W, H), &options, 0.0);
    assert_eq!(alpha.dimensions(), (W, H));

    let mask = RefinedMask {
        alpha,
        subject_detected: true,
    };
    let frame = video_frame();
    let params = RenderParams {
        opacity: 1.0,
        neutral: [0, 0, 0],
        ..RenderParams::default()
    };
    let out = composite(&RenderInput {
        frame: &frame,
        mask: Some(&mask),
        background: None,
        params: &params,
        output: (W, H),
    });

    // Corners are pure neutral fill, the centre is the subject
    assert_eq!(out.get_pixel(0, 0), &Rgba([0, 0, 0, 255]));
    let centre = out.get_pixel(W / 2, H / 2);
    let real = mirrored(&frame, W / 2, H / 2);
    assert_close(centre, [real[0] as f32, real[1] as f32, real[2] as f32], (W / 2, H / 2));
}
