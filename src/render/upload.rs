use crate::background::cover_fit;
use crate::error::UploadError;
use image::RgbaImage;

/// Destination of per-frame uploads: a persistent texture of fixed size.
pub trait FrameUploader {
    fn texture_size(&self) -> (u32, u32);

    fn upload(&mut self, frame: &RgbaImage) -> Result<(), UploadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The frame went straight into the texture
    Direct,
    /// The frame was redrawn on the CPU first and that copy went in
    Snapshot,
    /// Both attempts failed; the texture keeps the previous frame
    Stale,
}

/// Upload `frame`, falling back once to a CPU-drawn snapshot at the
/// texture's size. Never fails: the worst case is a frozen frame.
pub fn upload_with_fallback<U: FrameUploader + ?Sized>(
    uploader: &mut U,
    frame: &RgbaImage,
) -> UploadOutcome {
    let err = match uploader.upload(frame) {
        Ok(()) => return UploadOutcome::Direct,
        Err(e) => e,
    };
    tracing::debug!("Direct frame upload failed: {}", err);

    let Some(snapshot) = draw_snapshot(frame, uploader.texture_size()) else {
        tracing::warn!("Frame upload failed, keeping previous frame: {}", err);
        return UploadOutcome::Stale;
    };

    match uploader.upload(&snapshot) {
        Ok(()) => UploadOutcome::Snapshot,
        Err(e) => {
            tracing::warn!("Snapshot upload failed, keeping previous frame: {}", e);
            UploadOutcome::Stale
        }
    }
}

/// Redraw `frame` into a buffer matching the texture. `None` when there is
/// nothing to draw.
pub fn draw_snapshot(frame: &RgbaImage, size: (u32, u32)) -> Option<RgbaImage> {
    let (w, h) = frame.dimensions();
    if w == 0 || h == 0 || size.0 == 0 || size.1 == 0 {
        return None;
    }
    Some(cover_fit(frame, size.0, size.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts frames of the right size unless told to reject everything.
    struct MockTexture {
        size: (u32, u32),
        reject_all: bool,
        uploads: Vec<(u32, u32)>,
    }

    impl MockTexture {
        fn new(size: (u32, u32)) -> Self {
            Self {
                size,
                reject_all: false,
                uploads: Vec::new(),
            }
        }
    }

    impl FrameUploader for MockTexture {
        fn texture_size(&self) -> (u32, u32) {
            self.size
        }

        fn upload(&mut self, frame: &RgbaImage) -> Result<(), UploadError> {
            self.uploads.push(frame.dimensions());
            if self.reject_all {
                return Err(UploadError::Device("lost".into()));
            }
            if frame.dimensions() != self.size {
                return Err(UploadError::SizeMismatch {
                    expected: self.size,
                    actual: frame.dimensions(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn matching_frame_uploads_directly() {
        let mut tex = MockTexture::new((4, 4));
        let outcome = upload_with_fallback(&mut tex, &RgbaImage::new(4, 4));
        assert_eq!(outcome, UploadOutcome::Direct);
        assert_eq!(tex.uploads.len(), 1);
    }

    #[test]
    fn mismatched_frame_goes_through_snapshot() {
        let mut tex = MockTexture::new((4, 4));
        let outcome = upload_with_fallback(&mut tex, &RgbaImage::new(8, 6));
        assert_eq!(outcome, UploadOutcome::Snapshot);
        assert_eq!(tex.uploads, vec![(8, 6), (4, 4)]);
    }

    #[test]
    fn second_failure_keeps_stale_frame() {
        let mut tex = MockTexture::new((4, 4));
        tex.reject_all = true;
        let outcome = upload_with_fallback(&mut tex, &RgbaImage::new(4, 4));
        assert_eq!(outcome, UploadOutcome::Stale);
        // Exactly one retry
        assert_eq!(tex.uploads.len(), 2);
    }

    #[test]
    fn empty_frame_is_stale_without_retry() {
        let mut tex = MockTexture::new((4, 4));
        let outcome = upload_with_fallback(&mut tex, &RgbaImage::new(0, 0));
        assert_eq!(outcome, UploadOutcome::Stale);
        assert_eq!(tex.uploads.len(), 1);
    }
}
