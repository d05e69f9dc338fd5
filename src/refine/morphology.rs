use image::GrayImage;

/// 3x3 max filter. Border pixels are copied through unchanged.
pub fn dilate3x3(mask: &GrayImage) -> GrayImage {
    filter3x3(mask, u8::MIN, u8::max)
}

/// 3x3 min filter. Border pixels are copied through unchanged.
pub fn erode3x3(mask: &GrayImage) -> GrayImage {
    filter3x3(mask, u8::MAX, u8::min)
}

/// Dilate then erode: fills pinholes and narrow gaps in the foreground.
pub fn close3x3(mask: &GrayImage) -> GrayImage {
    erode3x3(&dilate3x3(mask))
}

fn filter3x3(mask: &GrayImage, init: u8, pick: fn(u8, u8) -> u8) -> GrayImage {
    let (w, h) = mask.dimensions();
    let mut out = mask.clone();
    if w < 3 || h < 3 {
        return out;
    }

    let src = mask.as_raw();
    let w = w as usize;
    let h = h as usize;
    let dst: &mut [u8] = &mut out;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut m = init;
            for row in [y - 1, y, y + 1] {
                let base = row * w + x;
                m = pick(m, src[base - 1]);
                m = pick(m, src[base]);
                m = pick(m, src[base + 1]);
            }
            dst[y * w + x] = m;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speck() -> GrayImage {
        let mut m = GrayImage::new(7, 7);
        m.put_pixel(3, 3, image::Luma([255]));
        m
    }

    fn pinhole() -> GrayImage {
        let mut m = GrayImage::from_pixel(7, 7, image::Luma([255]));
        m.put_pixel(3, 3, image::Luma([0]));
        m
    }

    #[test]
    fn erode_removes_isolated_foreground_pixel() {
        let out = erode3x3(&speck());
        assert!(out.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn dilate_fills_isolated_hole() {
        let out = dilate3x3(&pinhole());
        assert!(out.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn close_fills_isolated_hole() {
        let out = close3x3(&pinhole());
        assert_eq!(out.get_pixel(3, 3)[0], 255);
        assert!(out.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn close_is_dilate_then_erode() {
        // close(m) == erode(dilate(m)). Closing fills gaps, it does not
        // remove specks: a lone speck grows to 3x3 and shrinks back to itself.
        let out = close3x3(&speck());
        assert_eq!(out, erode3x3(&dilate3x3(&speck())));
        assert_eq!(out.get_pixel(3, 3)[0], 255);
        assert_eq!(out.get_pixel(2, 3)[0], 0);
    }

    #[test]
    fn dilate_grows_speck_to_block() {
        let out = dilate3x3(&speck());
        for y in 2..=4 {
            for x in 2..=4 {
                assert_eq!(out.get_pixel(x, y)[0], 255);
            }
        }
        assert_eq!(out.get_pixel(1, 3)[0], 0);
    }

    #[test]
    fn borders_are_left_alone() {
        let mut m = GrayImage::new(4, 4);
        m.put_pixel(0, 0, image::Luma([200]));
        let out = erode3x3(&m);
        assert_eq!(out.get_pixel(0, 0)[0], 200);
    }

    #[test]
    fn tiny_masks_pass_through() {
        let m = GrayImage::from_pixel(2, 2, image::Luma([9]));
        assert_eq!(dilate3x3(&m), m);
    }
}
