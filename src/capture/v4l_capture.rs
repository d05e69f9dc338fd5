use super::{frame_channel, CaptureRequest, FrameReceiver, FrameSource};
use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, RgbaImage};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Webcam capture running on its own thread.
///
/// The thread owns the device and keeps publishing the newest decoded frame.
/// Opening happens on that thread too, but `open` waits for the outcome so
/// a denied or missing device surfaces to the caller.
pub struct WebcamCapture {
    frames: FrameReceiver,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    width: u32,
    height: u32,
}

impl WebcamCapture {
    pub fn open(request: CaptureRequest) -> Result<Self> {
        tracing::info!(
            "Initializing webcam {} at {}x{}",
            request.device_index,
            request.width,
            request.height
        );

        let (publisher, frames) = frame_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(u32, u32)>>(1);

        let thread = thread::Builder::new()
            .name("webcam-capture".into())
            .spawn(move || {
                let mut camera = match open_camera(request) {
                    Ok(camera) => camera,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let res = camera.resolution();
                let _ = ready_tx.send(Ok((res.width(), res.height())));

                while !stop_flag.load(Ordering::SeqCst) {
                    match grab(&mut camera) {
                        Ok(frame) => publisher.publish(frame),
                        Err(e) => {
                            tracing::warn!("Dropped capture frame: {:#}", e);
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                }

                if let Err(e) = camera.stop_stream() {
                    tracing::warn!("Failed to stop camera stream: {}", e);
                }
                publisher.clear();
                tracing::debug!("Capture thread exiting");
            })
            .context("Failed to spawn capture thread")?;

        let (width, height) = match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(size)) => size,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                stop.store(true, Ordering::SeqCst);
                return Err(anyhow!("Camera did not open within {:?}", OPEN_TIMEOUT));
            }
        };

        tracing::info!("Webcam initialized at {}x{}", width, height);

        Ok(Self {
            frames,
            stop,
            thread: Some(thread),
            width,
            height,
        })
    }
}

fn open_camera(request: CaptureRequest) -> Result<Camera> {
    let index = CameraIndex::Index(request.device_index);
    let ideal = CameraFormat::new(
        Resolution::new(request.width, request.height),
        FrameFormat::MJPEG,
        30,
    );
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(ideal));

    let mut camera = Camera::new(index, requested).context("Failed to open camera")?;

    camera
        .open_stream()
        .context("Failed to open camera stream")?;

    Ok(camera)
}

fn grab(camera: &mut Camera) -> Result<RgbaImage> {
    let frame = camera.frame().context("Failed to capture frame")?;

    let decoded = frame
        .decode_image::<RgbFormat>()
        .context("Failed to decode frame")?;

    Ok(DynamicImage::ImageRgb8(decoded).to_rgba8())
}

impl FrameSource for WebcamCapture {
    fn latest(&self) -> Option<Arc<RgbaImage>> {
        self.frames.latest()
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn release(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            tracing::info!("Releasing webcam");
            if handle.join().is_err() {
                tracing::warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for WebcamCapture {
    fn drop(&mut self) {
        self.release();
    }
}
