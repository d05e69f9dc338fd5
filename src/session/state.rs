use super::lock::{RunLock, SessionToken};
use super::task::{LoopFlag, RepeatingTask};
use crate::background::BackgroundAsset;
use crate::capture::FrameSource;
use crate::metrics::{MetricsAggregator, SessionStatus};
use crate::output::OutputSink;
use crate::overlay::OverlayMetadata;
use crate::refine::{RefineOptions, RefinedMask};
use crate::render::{FrameRenderer, RenderParams};
use image::RgbaImage;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

/// Handles of the two loops of one session.
pub(crate) struct SessionLoops {
    pub render_flag: LoopFlag,
    pub render: JoinHandle<()>,
    pub segmentation: Option<RepeatingTask>,
}

impl SessionLoops {
    fn cancel(self) {
        self.render_flag.disable();
        self.render.abort();
        if let Some(segmentation) = self.segmentation {
            segmentation.cancel();
        }
    }
}

/// State shared by the coordinator and the loops of the active session.
///
/// Everything lives on the runtime thread; the cells are never borrowed
/// across an await point. The refined mask is written only by the
/// segmentation loop and read only by the render loop.
pub struct SessionState {
    pub(crate) lock: RefCell<RunLock>,
    params: RefCell<RenderParams>,
    refine: RefCell<RefineOptions>,
    output: Cell<(u32, u32)>,
    mask: RefCell<Option<Rc<RefinedMask>>>,
    background: RefCell<Option<Arc<BackgroundAsset>>>,
    overlay: RefCell<Option<OverlayMetadata>>,
    pub(crate) metrics: RefCell<MetricsAggregator>,
    pub(crate) source: RefCell<Option<Box<dyn FrameSource>>>,
    pub(crate) renderer: RefCell<Option<Box<dyn FrameRenderer>>>,
    pub(crate) sink: RefCell<Option<Box<dyn OutputSink>>>,
    pub(crate) loops: RefCell<Option<SessionLoops>>,
}

impl SessionState {
    pub fn new(params: RenderParams, refine: RefineOptions, output: (u32, u32)) -> Rc<Self> {
        Rc::new(Self {
            lock: RefCell::new(RunLock::new()),
            params: RefCell::new(params),
            refine: RefCell::new(refine),
            output: Cell::new(output),
            mask: RefCell::new(None),
            background: RefCell::new(None),
            overlay: RefCell::new(None),
            metrics: RefCell::new(MetricsAggregator::new(Instant::now())),
            source: RefCell::new(None),
            renderer: RefCell::new(None),
            sink: RefCell::new(None),
            loops: RefCell::new(None),
        })
    }

    pub fn is_current(&self, token: SessionToken) -> bool {
        self.lock.borrow().is_active(token)
    }

    pub fn active_token(&self) -> Option<SessionToken> {
        self.lock.borrow().active()
    }

    pub fn params(&self) -> RenderParams {
        self.params.borrow().clone()
    }

    pub fn update_params(&self, f: impl FnOnce(&mut RenderParams)) {
        f(&mut self.params.borrow_mut());
    }

    pub fn refine_options(&self) -> RefineOptions {
        self.refine.borrow().clone()
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.output.get()
    }

    pub(crate) fn set_output_size(&self, size: (u32, u32)) {
        self.output.set(size);
    }

    pub fn mask(&self) -> Option<Rc<RefinedMask>> {
        self.mask.borrow().clone()
    }

    /// Replace the current mask on behalf of session `token`. A revoked
    /// token changes nothing.
    pub fn publish_mask(&self, token: SessionToken, mask: RefinedMask) -> bool {
        if !self.is_current(token) {
            return false;
        }
        *self.mask.borrow_mut() = Some(Rc::new(mask));
        true
    }

    pub fn background(&self) -> Option<Arc<BackgroundAsset>> {
        self.background.borrow().clone()
    }

    pub fn set_background(&self, background: Option<Arc<BackgroundAsset>>) {
        *self.background.borrow_mut() = background;
    }

    pub fn overlay(&self) -> Option<OverlayMetadata> {
        self.overlay.borrow().clone()
    }

    pub fn set_overlay(&self, overlay: Option<OverlayMetadata>) {
        *self.overlay.borrow_mut() = overlay;
    }

    pub fn latest_frame(&self) -> Option<Arc<RgbaImage>> {
        self.source.borrow().as_ref().and_then(|s| s.latest())
    }

    pub fn record_latency(&self, token: SessionToken, ms: f64) {
        if self.is_current(token) {
            self.metrics.borrow_mut().record_latency(ms);
        }
    }

    /// Stop both loops and release every resource of the session. Runs as
    /// the session lock's release callback, so it must not touch the lock.
    pub(crate) fn teardown(&self) {
        if let Some(loops) = self.loops.borrow_mut().take() {
            loops.cancel();
        }
        if let Some(mut source) = self.source.borrow_mut().take() {
            source.release();
        }
        if let Some(mut renderer) = self.renderer.borrow_mut().take() {
            renderer.release();
        }
        self.sink.borrow_mut().take();
        self.mask.borrow_mut().take();
        self.background.borrow_mut().take();
        self.metrics.borrow_mut().set_status(SessionStatus::Stopped);
        tracing::debug!("Session resources released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    fn mask() -> RefinedMask {
        RefinedMask {
            alpha: GrayImage::new(2, 2),
            subject_detected: true,
        }
    }

    #[test]
    fn revoked_token_cannot_publish() {
        let state = SessionState::new(RenderParams::default(), RefineOptions::default(), (2, 2));
        let weak = Rc::downgrade(&state);
        let a = state.lock.borrow_mut().acquire(move || {
            if let Some(s) = weak.upgrade() {
                s.teardown();
            }
        });
        assert!(state.publish_mask(a, mask()));

        let b = state.lock.borrow_mut().acquire(|| {});
        assert!(!state.publish_mask(a, mask()));
        assert!(state.mask().is_none());
        assert!(state.publish_mask(b, mask()));
        assert!(state.mask().is_some());
    }

    #[test]
    fn teardown_clears_mask_and_background() {
        let state = SessionState::new(RenderParams::default(), RefineOptions::default(), (2, 2));
        let token = state.lock.borrow_mut().acquire(|| {});
        state.publish_mask(token, mask());
        state.teardown();
        assert!(state.mask().is_none());
        assert!(state.background().is_none());
        assert_eq!(state.metrics.borrow().snapshot().status, SessionStatus::Stopped);
    }
}
