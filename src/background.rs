//! Background image catalogue.
//!
//! Decoded images are cached per selection id. The drawable representation
//! handed to renderers is a cover-fitted copy at the output size, rebuilt
//! (never mutated) whenever a background is selected.

use anyhow::{Context, Result};
use image::{imageops, ImageBuffer, Pixel, RgbaImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundSelection {
    pub id: String,
    pub path: PathBuf,
}

impl BackgroundSelection {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// Parse `id=path`; a bare path uses its file stem as the id.
    pub fn parse(spec: &str) -> Self {
        match spec.split_once('=') {
            Some((id, path)) if !id.is_empty() => Self::new(id, path),
            _ => {
                let path = PathBuf::from(spec);
                let id = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| spec.to_string());
                Self { id, path }
            }
        }
    }
}

/// A background ready to draw at one output size.
#[derive(Debug)]
pub struct BackgroundAsset {
    pub id: String,
    /// Cover-fitted to exactly the output size
    pub canvas: RgbaImage,
    /// Bumped on every rebuild so renderers can tell a new binding apart
    pub generation: u64,
    source: Arc<RgbaImage>,
}

impl BackgroundAsset {
    pub fn dimensions(&self) -> (u32, u32) {
        self.canvas.dimensions()
    }
}

/// Decode `selection` unless `cached` already holds its image, then fit it
/// to `output`.
///
/// Blocking: sessions run it on the blocking pool.
pub fn load(
    selection: &BackgroundSelection,
    cached: Option<Arc<RgbaImage>>,
    output: (u32, u32),
    generation: u64,
) -> Result<BackgroundAsset> {
    let source = match cached {
        Some(source) => source,
        None => {
            let image = decode(&selection.path)?;
            tracing::info!(
                "Loaded background '{}' ({}x{})",
                selection.id,
                image.width(),
                image.height()
            );
            Arc::new(image)
        }
    };
    let canvas = cover_fit(&*source, output.0, output.1);
    Ok(BackgroundAsset {
        id: selection.id.clone(),
        canvas,
        generation,
        source,
    })
}

/// Decoded images per selection id.
#[derive(Debug, Default)]
pub struct BackgroundStore {
    // The path tells an id that now points elsewhere apart from a hit
    cache: HashMap<String, (PathBuf, Arc<RgbaImage>)>,
    generation: u64,
}

impl BackgroundStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The decoded image of `selection`, if this id was last loaded from
    /// the same path.
    pub fn cached(&self, selection: &BackgroundSelection) -> Option<Arc<RgbaImage>> {
        self.cache
            .get(&selection.id)
            .filter(|(path, _)| *path == selection.path)
            .map(|(_, image)| Arc::clone(image))
    }

    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Whether `generation` is the most recent one handed out.
    pub fn is_latest(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Keep the decoded source of `asset` for later selections of the same
    /// id and path. Replaces whatever the id pointed at before.
    pub fn remember(&mut self, selection: &BackgroundSelection, asset: &BackgroundAsset) {
        self.cache.insert(
            selection.id.clone(),
            (selection.path.clone(), Arc::clone(&asset.source)),
        );
    }
}

fn decode(path: &Path) -> Result<RgbaImage> {
    let image = image::open(path)
        .with_context(|| format!("Failed to decode {}", path.display()))?;
    Ok(image.to_rgba8())
}

/// Factor a `src` sized image is scaled by to cover `dst`.
pub fn cover_scale(src: (u32, u32), dst: (u32, u32)) -> f64 {
    if src.0 == 0 || src.1 == 0 {
        return 1.0;
    }
    f64::max(dst.0 as f64 / src.0 as f64, dst.1 as f64 / src.1 as f64)
}

/// Size a `src` sized image is scaled to before the overflow is cropped.
pub fn cover_size(src: (u32, u32), dst: (u32, u32)) -> (u32, u32) {
    let scale = cover_scale(src, dst);
    (
        ((src.0 as f64 * scale).round() as u32).max(dst.0),
        ((src.1 as f64 * scale).round() as u32).max(dst.1),
    )
}

/// Scale `image` to fill `width` x `height` keeping its aspect ratio, and crop
/// the overflow evenly from both sides.
pub fn cover_fit<P>(image: &ImageBuffer<P, Vec<P::Subpixel>>, width: u32, height: u32) -> ImageBuffer<P, Vec<P::Subpixel>>
where
    P: Pixel + 'static,
    P::Subpixel: 'static,
{
    cover_fit_as(image, image.dimensions(), width, height)
}

/// Cover fit of an image that spans a whole `frame` sized picture at some
/// other resolution, such as a mask of a video frame. The crop follows the
/// frame's geometry, so the result lines up with `cover_fit` of the frame.
pub fn cover_fit_as<P>(
    image: &ImageBuffer<P, Vec<P::Subpixel>>,
    frame: (u32, u32),
    width: u32,
    height: u32,
) -> ImageBuffer<P, Vec<P::Subpixel>>
where
    P: Pixel + 'static,
    P::Subpixel: 'static,
{
    let (iw, ih) = image.dimensions();
    if iw == 0 || ih == 0 || frame.0 == 0 || frame.1 == 0 || width == 0 || height == 0 {
        return ImageBuffer::new(width, height);
    }

    let (dw, dh) = cover_size(frame, (width, height));
    if (iw, ih) == (width, height) && (dw, dh) == (width, height) {
        return image.clone();
    }
    let scaled = if (iw, ih) == (dw, dh) {
        image.clone()
    } else {
        imageops::resize(image, dw, dh, imageops::FilterType::Triangle)
    };

    let x = (dw - width) / 2;
    let y = (dh - height) / 2;
    imageops::crop_imm(&scaled, x, y, width, height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn cover_fit_fills_target_exactly() {
        let img = RgbaImage::from_pixel(400, 100, image::Rgba([10, 20, 30, 255]));
        let out = cover_fit(&img, 160, 90);
        assert_eq!(out.dimensions(), (160, 90));
        assert!(out.pixels().all(|p| p[3] == 255));
    }

    #[test]
    fn cover_fit_crops_centre() {
        // Left third red, middle third green, right third blue
        let img = RgbaImage::from_fn(300, 100, |x, _| match x / 100 {
            0 => image::Rgba([255, 0, 0, 255]),
            1 => image::Rgba([0, 255, 0, 255]),
            _ => image::Rgba([0, 0, 255, 255]),
        });
        let out = cover_fit(&img, 100, 100);
        assert_eq!(out.get_pixel(50, 50), &image::Rgba([0, 255, 0, 255]));
    }

    #[test]
    fn selection_parsing() {
        let s = BackgroundSelection::parse("office=/tmp/office.png");
        assert_eq!(s.id, "office");
        assert_eq!(s.path, PathBuf::from("/tmp/office.png"));

        let s = BackgroundSelection::parse("/tmp/beach.jpg");
        assert_eq!(s.id, "beach");
    }

    #[test]
    fn cover_fit_as_follows_frame_geometry() {
        // A quarter resolution mask of a 16:9 frame, white in the right quarter
        let frame = (160, 90);
        let mask = GrayImage::from_fn(40, 18, |x, _| Luma([if x >= 30 { 255 } else { 0 }]));
        let fitted = cover_fit_as(&mask, frame, 60, 45);
        assert_eq!(fitted.dimensions(), (60, 45));

        // The frame is scaled to 80x45 and 10 columns are cropped per side,
        // so the white quarter starts at output column 60 - 10 = 50
        assert_eq!(fitted.get_pixel(45, 20)[0], 0);
        assert_eq!(fitted.get_pixel(55, 20)[0], 255);
        assert_eq!(fitted.get_pixel(59, 20)[0], 255);
    }

    #[test]
    fn cover_size_matches_cover_fit() {
        assert_eq!(cover_size((160, 90), (60, 45)), (80, 45));
        assert_eq!(cover_size((640, 480), (1280, 720)), (1280, 960));
        assert_eq!(cover_size((64, 36), (64, 36)), (64, 36));
    }

    #[test]
    fn missing_file_is_an_error() {
        let sel = BackgroundSelection::new("gone", "/nonexistent/bg.png");
        assert!(load(&sel, None, (64, 36), 1).is_err());
        assert!(BackgroundStore::new().cached(&sel).is_none());
    }

    #[test]
    fn cache_hit_skips_decoding() {
        let mut store = BackgroundStore::new();
        let sel = BackgroundSelection::new("plain", "/never/read.png");
        let image = Arc::new(RgbaImage::from_pixel(8, 8, image::Rgba([1, 2, 3, 255])));

        let a = load(&sel, Some(image), (16, 9), store.next_generation()).unwrap();
        store.remember(&sel, &a);
        let b = load(&sel, store.cached(&sel), (32, 18), store.next_generation()).unwrap();
        assert_eq!(a.dimensions(), (16, 9));
        assert_eq!(b.dimensions(), (32, 18));
        assert_eq!(b.canvas.get_pixel(0, 0), &image::Rgba([1, 2, 3, 255]));
        assert!(b.generation > a.generation);
        assert!(store.is_latest(b.generation));
        assert!(!store.is_latest(a.generation));
    }

    #[test]
    fn repointed_id_reloads_from_new_path() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("old.png");
        let new_path = dir.path().join("new.png");
        RgbaImage::from_pixel(4, 4, image::Rgba([255, 0, 0, 255]))
            .save(&old_path)
            .unwrap();
        RgbaImage::from_pixel(4, 4, image::Rgba([0, 0, 255, 255]))
            .save(&new_path)
            .unwrap();

        let mut store = BackgroundStore::new();
        let old = BackgroundSelection::new("office", &old_path);
        let asset = load(&old, store.cached(&old), (4, 4), store.next_generation()).unwrap();
        store.remember(&old, &asset);
        assert!(store.cached(&old).is_some());

        let new = BackgroundSelection::new("office", &new_path);
        assert!(store.cached(&new).is_none());
        let asset = load(&new, store.cached(&new), (4, 4), store.next_generation()).unwrap();
        store.remember(&new, &asset);
        assert_eq!(asset.canvas.get_pixel(1, 1), &image::Rgba([0, 0, 255, 255]));
        assert!(store.cached(&old).is_none());
    }
}
