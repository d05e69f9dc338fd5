mod v4l_capture;

pub use v4l_capture::WebcamCapture;

use image::RgbaImage;
use std::sync::Arc;
use tokio::sync::watch;

/// Requested capture mode; the device may negotiate something else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 1280,
            height: 720,
        }
    }
}

/// A continuously refreshing frame source.
///
/// Readers only ever see the newest frame; nothing queues.
pub trait FrameSource {
    /// Newest frame, or `None` before the first frame arrives
    fn latest(&self) -> Option<Arc<RgbaImage>>;

    /// Negotiated resolution of captured frames
    fn resolution(&self) -> (u32, u32);

    /// Stop the device and release its tracks. Idempotent.
    fn release(&mut self);
}

/// Writer half of a newest-frame cell, held by the capture thread.
#[derive(Debug)]
pub struct FramePublisher {
    tx: watch::Sender<Option<Arc<RgbaImage>>>,
}

/// Reader half of a newest-frame cell.
#[derive(Debug, Clone)]
pub struct FrameReceiver {
    rx: watch::Receiver<Option<Arc<RgbaImage>>>,
}

pub fn frame_channel() -> (FramePublisher, FrameReceiver) {
    let (tx, rx) = watch::channel(None);
    (FramePublisher { tx }, FrameReceiver { rx })
}

impl FramePublisher {
    pub fn publish(&self, frame: RgbaImage) {
        self.tx.send_replace(Some(Arc::new(frame)));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }
}

impl FrameReceiver {
    pub fn latest(&self) -> Option<Arc<RgbaImage>> {
        self.rx.borrow().clone()
    }
}
